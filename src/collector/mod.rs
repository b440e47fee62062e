//! Gateway 遥测采集
//!
//! Collector 是一个 actor：单个 tokio 任务独占所有状态（agents / links / pending / host），
//! 按顺序处理 `Command`。socket 读写、RPC 超时、轮询定时器只负责投递命令，
//! 因此不需要锁，一轮轮询的结果在同一个命令回合内合并。
//!
//! - 握手：`connect.challenge` → `connect` 请求 → `hello-ok`
//! - 轮询：每个已连接的 Gateway 每周期并发 6 个 RPC
//! - 拆分：按 `gatewayAgentId` 把 Gateway 级数据拆给各 Logical Agent
//! - 推送：每次合并发出一条 `update`

mod broadcaster;
mod host;
mod link;
mod poller;
mod socket;
mod state;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use broadcaster::{Broadcaster, ConnId, Subscription};
pub use link::{GatewayLink, LinkStatus};
pub use poller::PollRound;
pub use state::{event_patch, filter_sessions, hello_patch, split_health, split_round};

use link::{PendingRequest, Responder};

use crate::config::{CollectorConfig, GatewayKey, LogicalAgent};
use crate::error::{Error, Result};
use crate::protocol::{self, event_name, method, EventType, FleetEvent, Frame};
use crate::types::{AgentStatePatch, AgentStateRecord, HostMetrics, Snapshot};

/// Collector 内部命令
pub(crate) enum Command {
    /// socket 已打开
    Opened {
        key: GatewayKey,
        generation: u64,
        outbound: mpsc::UnboundedSender<String>,
    },
    /// 收到文本帧
    Frame {
        key: GatewayKey,
        generation: u64,
        text: String,
    },
    /// socket 关闭或出错
    Closed {
        key: GatewayKey,
        generation: u64,
        reason: String,
        error: bool,
    },
    /// 外部发起的 RPC
    Request {
        agent_id: String,
        method: String,
        params: Value,
        reply: oneshot::Sender<Option<Value>>,
    },
    /// RPC 超时
    Timeout { key: GatewayKey, id: u64 },
    /// 固定延迟后重连
    Reconnect { key: GatewayKey },
    /// 轮询所有已连接的 Gateway
    PollAll,
    /// 轮询单个 Gateway（握手后的首次轮询）
    PollLink { key: GatewayKey },
    /// 一轮轮询结束
    RoundComplete { key: GatewayKey, round: PollRound },
    /// 主机指标
    HostMetrics(HostMetrics),
    /// 读取快照
    Snapshot { reply: oneshot::Sender<Snapshot> },
    /// 配置重载
    Reload {
        agents: Vec<LogicalAgent>,
        reply: oneshot::Sender<()>,
    },
    /// 停止
    Shutdown,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Collector 状态聚合（只在 actor 任务内修改）
pub struct Collector {
    config: CollectorConfig,
    agents: BTreeMap<String, LogicalAgent>,
    states: BTreeMap<String, AgentStateRecord>,
    links: HashMap<GatewayKey, GatewayLink>,
    host: Option<HostMetrics>,
    /// 全局递增的请求 ID（跨所有连接）
    next_request_id: u64,
    /// 全局递增的 socket 代数（跨所有连接，含已移除后重建的连接）
    next_generation: u64,
    /// 最近一次状态变化的时间（快照时间戳）
    updated_at: i64,
    /// 是否已开始建立连接（重载时新连接是否立即打开）
    started: bool,
    broadcaster: Arc<Broadcaster>,
    tx: mpsc::UnboundedSender<Command>,
}

impl Collector {
    pub(crate) fn new(
        config: CollectorConfig,
        agents: Vec<LogicalAgent>,
        broadcaster: Arc<Broadcaster>,
        tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let mut collector = Self {
            config,
            agents: BTreeMap::new(),
            states: BTreeMap::new(),
            links: HashMap::new(),
            host: None,
            next_request_id: 1,
            next_generation: 1,
            updated_at: now_millis(),
            started: false,
            broadcaster,
            tx,
        };
        collector.apply_agents(agents);
        collector
    }

    /// 打开所有 Gateway 连接
    pub(crate) fn start(&mut self) {
        self.started = true;
        let keys: Vec<GatewayKey> = self.links.keys().cloned().collect();
        for key in keys {
            self.connect(&key);
        }
    }

    pub fn link(&self, key: &GatewayKey) -> Option<&GatewayLink> {
        self.links.get(key)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn state(&self, agent_id: &str) -> Option<&AgentStateRecord> {
        self.states.get(agent_id)
    }

    /// 全量快照；没有状态变化时多次调用结果相同
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            ts: self.updated_at,
            agents: self.states.clone(),
            host: self.host.clone(),
        }
    }

    /// 处理一条命令，返回 false 表示停止
    pub(crate) fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Opened {
                key,
                generation,
                outbound,
            } => self.on_opened(&key, generation, outbound),
            Command::Frame {
                key,
                generation,
                text,
            } => self.on_frame(&key, generation, &text),
            Command::Closed {
                key,
                generation,
                reason,
                error,
            } => self.on_closed(&key, generation, &reason, error),
            Command::Request {
                agent_id,
                method,
                params,
                reply,
            } => self.on_request(&agent_id, &method, params, reply),
            Command::Timeout { key, id } => self.on_timeout(&key, id),
            Command::Reconnect { key } => self.on_reconnect(&key),
            Command::PollAll => self.poll_all(),
            Command::PollLink { key } => self.poll_link(&key),
            Command::RoundComplete { key, round } => self.on_round(&key, &round),
            Command::HostMetrics(metrics) => self.on_host_metrics(metrics),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Reload { agents, reply } => {
                self.apply_agents(agents);
                let _ = reply.send(());
            }
            Command::Shutdown => {
                tracing::info!("Collector shutting down");
                return false;
            }
        }
        true
    }

    // ==================== 配置 ====================

    /// 应用 agent 列表（首次加载和重载共用）
    ///
    /// 连接数始终等于不同 `GatewayKey` 的数量。
    fn apply_agents(&mut self, agents: Vec<LogicalAgent>) {
        let previous = std::mem::take(&mut self.agents);
        self.agents = agents.into_iter().map(|a| (a.id.clone(), a)).collect();

        // 移除的 agent
        for id in previous.keys() {
            if !self.agents.contains_key(id) {
                self.states.remove(id);
                self.updated_at = now_millis();
                tracing::info!("Agent removed: {}", id);
                self.broadcaster.broadcast(FleetEvent::Update {
                    id: id.clone(),
                    state: None,
                    removed: true,
                });
            }
        }

        // 每个 Gateway 的共享者
        let mut members: HashMap<GatewayKey, Vec<String>> = HashMap::new();
        for agent in self.agents.values() {
            members
                .entry(agent.gateway_key())
                .or_default()
                .push(agent.id.clone());
        }

        // 不再被引用的连接
        let stale: Vec<GatewayKey> = self
            .links
            .keys()
            .filter(|k| !members.contains_key(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(mut link) = self.links.remove(&key) {
                link.close();
                tracing::info!("Gateway link closed: {}", key);
            }
        }

        // 新建连接并更新共享者
        let mut fresh = Vec::new();
        for (key, ids) in members {
            let link = self.links.entry(key.clone()).or_insert_with(|| {
                fresh.push(key.clone());
                GatewayLink::new(key.clone())
            });
            link.set_agents(ids);
        }

        // 新 agent 或换了 Gateway 的 agent 重置状态
        let now = now_millis();
        let ids: Vec<String> = self.agents.keys().cloned().collect();
        for id in ids {
            let moved = previous
                .get(&id)
                .map(|old| old.gateway_key() != self.agents[&id].gateway_key())
                .unwrap_or(true);
            if !moved {
                continue;
            }
            self.states.insert(id.clone(), AgentStateRecord::default());
            let connected = self
                .links
                .get(&self.agents[&id].gateway_key())
                .map(|l| l.is_connected())
                .unwrap_or(false);
            if connected {
                self.apply(&id, AgentStatePatch::online(now));
            }
        }

        tracing::info!(
            "Agents loaded: {} agents, {} gateway links",
            self.agents.len(),
            self.links.len()
        );

        if self.started {
            for key in fresh {
                self.connect(&key);
            }
        }
    }

    // ==================== 状态合并 ====================

    /// 合并增量并推送 update
    fn apply(&mut self, agent_id: &str, patch: AgentStatePatch) {
        let Some(record) = self.states.get_mut(agent_id) else {
            return;
        };
        record.merge(patch);
        let state = record.clone();
        self.updated_at = now_millis();
        self.broadcaster.broadcast(FleetEvent::Update {
            id: agent_id.to_string(),
            state: Some(state),
            removed: false,
        });
    }

    /// 对共享此连接的每个 agent 生成并合并增量
    fn apply_to_link<F>(&mut self, key: &GatewayKey, mut make: F)
    where
        F: FnMut(&LogicalAgent, bool) -> AgentStatePatch,
    {
        let Some(link) = self.links.get(key) else {
            return;
        };
        let shared = link.is_shared();
        let ids = link.agent_ids().to_vec();
        for id in ids {
            let Some(agent) = self.agents.get(&id) else {
                continue;
            };
            let patch = make(agent, shared);
            self.apply(&id, patch);
        }
    }

    fn mark_link_offline(&mut self, key: &GatewayKey, reason: &str) {
        self.apply_to_link(key, |_, _| AgentStatePatch::offline(reason));
    }

    // ==================== 连接 ====================

    fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn connect(&mut self, key: &GatewayKey) {
        if !self.links.contains_key(key) {
            return;
        }
        let generation = self.next_generation();
        if let Some(link) = self.links.get_mut(key) {
            link.begin_connect(generation);
        }
        socket::spawn(key.clone(), generation, self.tx.clone());
    }

    fn on_opened(
        &mut self,
        key: &GatewayKey,
        generation: u64,
        outbound: mpsc::UnboundedSender<String>,
    ) {
        if let Some(link) = self.links.get_mut(key) {
            if link.attach_socket(generation, outbound) {
                tracing::info!("Gateway socket open: {}, waiting for challenge", key);
            }
        }
    }

    fn on_closed(&mut self, key: &GatewayKey, generation: u64, reason: &str, error: bool) {
        let status = if error {
            LinkStatus::Error
        } else {
            LinkStatus::Disconnected
        };
        let dropped = self
            .links
            .get_mut(key)
            .map(|link| link.mark_dropped(generation, status))
            .unwrap_or(false);
        if !dropped {
            return;
        }

        tracing::warn!(
            "Gateway {} {}, reconnecting in {:?}",
            key,
            reason,
            self.config.reconnect_delay
        );
        self.mark_link_offline(key, reason);
        poller::schedule(
            self.config.reconnect_delay,
            self.tx.clone(),
            Command::Reconnect { key: key.clone() },
        );
    }

    fn on_reconnect(&mut self, key: &GatewayKey) {
        let due = self
            .links
            .get(key)
            .map(|l| l.reconnect_scheduled())
            .unwrap_or(false);
        if due {
            tracing::info!("Reconnecting gateway {}", key);
            self.connect(key);
        }
    }

    // ==================== 帧处理 ====================

    fn on_frame(&mut self, key: &GatewayKey, generation: u64, text: &str) {
        let current = self
            .links
            .get(key)
            .map(|l| l.generation() == generation)
            .unwrap_or(false);
        if !current {
            return;
        }

        match Frame::parse(text) {
            Some(Frame::Event { event, payload }) => self.on_event(key, &event, &payload),
            Some(Frame::Res {
                id,
                ok,
                payload,
                error,
            }) => match protocol::response_id(&id) {
                Some(id) => self.on_response(key, id, ok, payload, error),
                None => tracing::debug!("Response without usable id from {}", key),
            },
            Some(Frame::Req { method, .. }) => {
                tracing::debug!("Ignoring server request {} from {}", method, key);
            }
            None => {}
        }
    }

    fn on_event(&mut self, key: &GatewayKey, event: &str, payload: &Value) {
        if event == event_name::CONNECT_CHALLENGE {
            self.send_handshake(key);
            return;
        }
        let now = now_millis();
        self.apply_to_link(key, |agent, _| state::event_patch(event, payload, agent, now));
    }

    fn send_handshake(&mut self, key: &GatewayKey) {
        let id = self.next_id();
        let timer = self.arm_timer(key, id);
        let (client_id, client_mode) = (self.config.client_id.clone(), self.config.client_mode.clone());
        let Some(link) = self.links.get_mut(key) else {
            timer.abort();
            return;
        };
        let params = protocol::connect_params(&client_id, &client_mode, &key.token);
        if !link.write(Frame::request(id, method::CONNECT, params).to_text()) {
            timer.abort();
            return;
        }
        tracing::debug!("Sent connect request to {} (id={})", key, id);
        link.insert_pending(
            id,
            PendingRequest {
                method: method::CONNECT.to_string(),
                responder: Responder::Handshake,
                timer,
            },
        );
    }

    fn on_response(
        &mut self,
        key: &GatewayKey,
        id: u64,
        ok: bool,
        payload: Value,
        error: Option<Value>,
    ) {
        let Some(pending) = self.links.get_mut(key).and_then(|l| l.take_pending(id)) else {
            tracing::debug!("Response for unknown request id={} from {}", id, key);
            return;
        };
        pending.timer.abort();

        match pending.responder {
            Responder::Rpc(reply) => {
                if !ok {
                    tracing::debug!(
                        "RPC {} rejected by {}: {}",
                        pending.method,
                        key,
                        protocol::error_message(error.as_ref())
                    );
                }
                let _ = reply.send(if ok { Some(payload) } else { None });
            }
            Responder::Handshake => self.on_hello(key, ok, &payload, error.as_ref()),
        }
    }

    fn on_hello(&mut self, key: &GatewayKey, ok: bool, payload: &Value, error: Option<&Value>) {
        if !ok {
            let message = protocol::error_message(error);
            tracing::warn!("Gateway {} rejected connect: {}", key, message);
            self.mark_link_offline(key, &message);
            return;
        }

        if payload.get("type").and_then(|t| t.as_str()) != Some("hello-ok") {
            tracing::debug!("Unexpected hello payload type from {}", key);
        }
        if let Some(link) = self.links.get_mut(key) {
            link.set_status(LinkStatus::Connected);
        }
        tracing::info!("Gateway connected: {}", key);

        let now = now_millis();
        self.apply_to_link(key, |agent, _| state::hello_patch(payload, agent, now));
        poller::schedule(
            self.config.settle_delay,
            self.tx.clone(),
            Command::PollLink { key: key.clone() },
        );
    }

    // ==================== RPC ====================

    fn next_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn arm_timer(&self, key: &GatewayKey, id: u64) -> JoinHandle<()> {
        poller::schedule(
            self.config.request_timeout,
            self.tx.clone(),
            Command::Timeout {
                key: key.clone(),
                id,
            },
        )
    }

    /// 在指定连接上发起 RPC
    ///
    /// 连接未处于 connected 时立即返回 None：不写帧、不启动定时器。
    pub(crate) fn send(
        &mut self,
        key: &GatewayKey,
        method: &str,
        params: Value,
    ) -> oneshot::Receiver<Option<Value>> {
        let (reply, rx) = oneshot::channel();

        let connected = self.links.get(key).map(|l| l.is_connected()).unwrap_or(false);
        if !connected {
            let _ = reply.send(None);
            return rx;
        }

        let id = self.next_id();
        let frame = Frame::request(id, method, params).to_text();
        let written = self.links.get(key).map(|l| l.write(frame)).unwrap_or(false);
        if !written {
            let _ = reply.send(None);
            return rx;
        }

        let timer = self.arm_timer(key, id);
        if let Some(link) = self.links.get_mut(key) {
            link.insert_pending(
                id,
                PendingRequest {
                    method: method.to_string(),
                    responder: Responder::Rpc(reply),
                    timer,
                },
            );
        }
        rx
    }

    fn on_request(
        &mut self,
        agent_id: &str,
        method: &str,
        params: Value,
        reply: oneshot::Sender<Option<Value>>,
    ) {
        let Some(key) = self.agents.get(agent_id).map(|a| a.gateway_key()) else {
            let _ = reply.send(None);
            return;
        };
        let rx = self.send(&key, method, params);
        tokio::spawn(async move {
            let _ = reply.send(rx.await.ok().flatten());
        });
    }

    fn on_timeout(&mut self, key: &GatewayKey, id: u64) {
        let Some(pending) = self.links.get_mut(key).and_then(|l| l.take_pending(id)) else {
            return;
        };
        tracing::debug!("RPC {} to {} timed out (id={})", pending.method, key, id);
        match pending.responder {
            Responder::Rpc(reply) => {
                let _ = reply.send(None);
            }
            Responder::Handshake => self.mark_link_offline(key, "connect handshake timed out"),
        }
    }

    // ==================== 轮询 ====================

    fn poll_all(&mut self) {
        let keys: Vec<GatewayKey> = self
            .links
            .values()
            .filter(|l| l.is_connected())
            .map(|l| l.key().clone())
            .collect();
        for key in keys {
            self.poll_link(&key);
        }
    }

    fn poll_link(&mut self, key: &GatewayKey) {
        let connected = self.links.get(key).map(|l| l.is_connected()).unwrap_or(false);
        if !connected {
            return;
        }
        let receivers = protocol::poll_requests().map(|(method, params)| self.send(key, method, params));
        poller::spawn_round(key.clone(), receivers, self.tx.clone());
    }

    fn on_round(&mut self, key: &GatewayKey, round: &PollRound) {
        tracing::debug!(
            "Poll round from {}: {}/6 fields resolved",
            key,
            round.resolved_count()
        );
        let now = now_millis();
        self.apply_to_link(key, |agent, shared| state::split_round(round, agent, shared, now));
    }

    fn on_host_metrics(&mut self, metrics: HostMetrics) {
        self.host = Some(metrics.clone());
        self.updated_at = now_millis();
        self.broadcaster.broadcast(FleetEvent::HostMetrics { metrics });
    }
}

/// Collector 句柄（可克隆，供展示层使用）
#[derive(Clone)]
pub struct CollectorHandle {
    tx: mpsc::UnboundedSender<Command>,
    broadcaster: Arc<Broadcaster>,
}

/// 启动 Collector：建立连接、启动轮询定时器和 actor 任务
pub fn spawn(config: CollectorConfig, agents: Vec<LogicalAgent>) -> CollectorHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let broadcaster = Broadcaster::new(config.subscriber_buffer);

    let mut collector = Collector::new(config.clone(), agents, broadcaster.clone(), tx.clone());
    let handle = CollectorHandle {
        tx: tx.clone(),
        broadcaster: broadcaster.clone(),
    };
    collector.start();

    poller::spawn_agent_ticker(config.poll_interval, tx.clone());
    poller::spawn_host_ticker(config.host_interval, tx.clone());

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            if !collector.handle(command) {
                break;
            }
        }
        broadcaster.close_all();
        tracing::info!("👋 Collector stopped");
    });

    handle
}

impl CollectorHandle {
    /// 当前全量状态
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// 订阅事件（只收到订阅之后的事件）
    pub fn subscribe(&self, events: &[EventType]) -> Subscription {
        self.broadcaster.open(events)
    }

    /// 通过 agent 所在的 Gateway 发起 RPC；不可用、超时、被拒绝都返回 None
    pub async fn request(&self, agent_id: &str, method: &str, params: Value) -> Option<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Request {
                agent_id: agent_id.to_string(),
                method: method.to_string(),
                params,
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// 整体替换 agent 列表
    pub async fn reload(&self, agents: Vec<LogicalAgent>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Reload { agents, reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// 停止 Collector（已发出的请求不会被撤回）
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}
