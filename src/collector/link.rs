//! Gateway 物理连接
//!
//! 一个 `GatewayLink` 对应一个唯一的 `GatewayKey`，由所有凭据相同的 Logical Agent 共享。
//! 只保存连接状态和待响应请求，所有修改都发生在 Collector 的 actor 任务内。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::GatewayKey;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Disconnected => write!(f, "disconnected"),
            LinkStatus::Connecting => write!(f, "connecting"),
            LinkStatus::Connected => write!(f, "connected"),
            LinkStatus::Error => write!(f, "error"),
        }
    }
}

/// 响应的接收方
pub(crate) enum Responder {
    /// 普通 RPC：ok 时返回 payload，否则 None
    Rpc(oneshot::Sender<Option<Value>>),
    /// connect 握手，由 Collector 直接处理
    Handshake,
}

/// 待响应请求
pub(crate) struct PendingRequest {
    pub method: String,
    pub responder: Responder,
    /// 超时定时器，收到响应时取消
    pub timer: JoinHandle<()>,
}

/// 单个 Gateway 连接
pub struct GatewayLink {
    key: GatewayKey,
    status: LinkStatus,
    /// 共享此连接的 Logical Agent ID（按配置顺序）
    agent_ids: Vec<String>,
    /// 写入通道（socket 打开后才有）
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// 当前 socket 代数（由 Collector 全局分配），旧 socket 的事件会被忽略
    generation: u64,
    pending: HashMap<u64, PendingRequest>,
    reconnect_scheduled: bool,
}

impl GatewayLink {
    pub fn new(key: GatewayKey) -> Self {
        Self {
            key,
            status: LinkStatus::Disconnected,
            agent_ids: Vec::new(),
            outbound: None,
            generation: 0,
            pending: HashMap::new(),
            reconnect_scheduled: false,
        }
    }

    pub fn key(&self) -> &GatewayKey {
        &self.key
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == LinkStatus::Connected
    }

    pub fn agent_ids(&self) -> &[String] {
        &self.agent_ids
    }

    /// 是否被多个 Logical Agent 共享
    pub fn is_shared(&self) -> bool {
        self.agent_ids.len() > 1
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn set_agents(&mut self, agent_ids: Vec<String>) {
        self.agent_ids = agent_ids;
    }

    pub(crate) fn set_status(&mut self, status: LinkStatus) {
        self.status = status;
    }

    /// 以新的 socket 代数开始一轮连接
    ///
    /// 代数由 Collector 全局分配，重建的连接不会复用已移除连接用过的代数。
    /// 旧的写入通道在这里释放，旧 socket 随之关闭。
    pub(crate) fn begin_connect(&mut self, generation: u64) {
        self.generation = generation;
        self.outbound = None;
        self.status = LinkStatus::Connecting;
        self.reconnect_scheduled = false;
    }

    /// socket 已打开；代数不匹配时返回 false
    pub(crate) fn attach_socket(
        &mut self,
        generation: u64,
        outbound: mpsc::UnboundedSender<String>,
    ) -> bool {
        if generation != self.generation {
            return false;
        }
        self.outbound = Some(outbound);
        self.status = LinkStatus::Connecting;
        true
    }

    /// 记录一次断线
    ///
    /// 同一 socket 的 close / error 只处理第一次，返回 true 表示需要安排重连。
    pub(crate) fn mark_dropped(&mut self, generation: u64, status: LinkStatus) -> bool {
        if generation != self.generation || self.reconnect_scheduled {
            return false;
        }
        self.outbound = None;
        self.status = status;
        self.reconnect_scheduled = true;
        true
    }

    /// 是否有待执行的重连
    pub fn reconnect_scheduled(&self) -> bool {
        self.reconnect_scheduled
    }

    /// 永久关闭（配置重载移除此连接时使用）
    pub(crate) fn close(&mut self) {
        self.outbound = None;
        self.status = LinkStatus::Disconnected;
        self.reconnect_scheduled = false;
    }

    /// 写入一帧；没有打开的 socket 时返回 false
    pub(crate) fn write(&self, text: String) -> bool {
        match &self.outbound {
            Some(outbound) => outbound.send(text).is_ok(),
            None => false,
        }
    }

    pub(crate) fn insert_pending(&mut self, id: u64, request: PendingRequest) {
        self.pending.insert(id, request);
    }

    /// 取出待响应请求（响应和超时两条路径都只会成功一次）
    pub(crate) fn take_pending(&mut self, id: u64) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }
}
