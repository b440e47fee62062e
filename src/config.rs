//! 监控配置
//!
//! 配置文件为 JSON（camelCase），描述要监控的 Logical Agent 列表以及各周期参数。
//! 路径优先级：显式路径 > `FLEET_MONITOR_CONFIG` 环境变量 > `~/.fleet-monitor/config.json`

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 配置文件路径环境变量
pub const CONFIG_ENV: &str = "FLEET_MONITOR_CONFIG";

/// Gateway 默认端口
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Gateway 物理连接标识
///
/// 相同 (host, port, token) 的 Logical Agent 共享同一条连接。
/// `Display` 只输出 token 前 8 个字符，避免凭据进入日志。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayKey {
    pub host: String,
    pub port: u16,
    pub token: String,
}

impl GatewayKey {
    /// WebSocket 地址
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// token 前缀（用于日志）
    pub fn token_prefix(&self) -> &str {
        match self.token.char_indices().nth(8) {
            Some((idx, _)) => &self.token[..idx],
            None => &self.token,
        }
    }
}

impl fmt::Display for GatewayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.token_prefix())
    }
}

/// Logical Agent 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalAgent {
    /// 本地唯一 ID
    pub id: String,
    /// Gateway 内部的 agent ID（缺省与 id 相同）
    #[serde(default)]
    pub gateway_agent_id: String,
    /// 显示名称
    #[serde(default, alias = "name")]
    pub display_name: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub token: String,
    /// 工作区路径
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

impl LogicalAgent {
    /// 创建本地 Gateway 上的 Agent（测试和简单场景使用）
    pub fn new(id: &str, host: &str, port: u16, token: &str) -> Self {
        Self {
            id: id.to_string(),
            gateway_agent_id: id.to_string(),
            display_name: id.to_string(),
            emoji: None,
            host: host.to_string(),
            port,
            token: token.to_string(),
            workspace: None,
        }
    }

    /// 设置 Gateway 内部 agent ID
    pub fn with_gateway_agent_id(mut self, gateway_agent_id: &str) -> Self {
        self.gateway_agent_id = gateway_agent_id.to_string();
        self
    }

    /// 所属 Gateway 连接标识
    pub fn gateway_key(&self) -> GatewayKey {
        GatewayKey {
            host: self.host.clone(),
            port: self.port,
            token: self.token.clone(),
        }
    }

    /// 会话 key 前缀：`agent:<gatewayAgentId>:`
    pub fn session_prefix(&self) -> String {
        format!("agent:{}:", self.gateway_agent_id)
    }

    /// 补全缺省字段
    fn normalize(&mut self) {
        if self.gateway_agent_id.is_empty() {
            self.gateway_agent_id = self.id.clone();
        }
        if self.display_name.is_empty() {
            self.display_name = self.id.clone();
        }
    }
}

/// 监控配置文件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub agents: Vec<LogicalAgent>,
    /// 会话归档根目录（每个 agent 一个子目录）
    pub agents_dir: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub host_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub settle_delay_ms: u64,
    /// connect 握手中的 client.id
    pub client_id: String,
    /// connect 握手中的 client.mode
    pub client_mode: String,
    /// 每个订阅者的事件缓冲区大小
    pub subscriber_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            agents_dir: None,
            poll_interval_secs: 15,
            host_interval_secs: 30,
            request_timeout_secs: 10,
            reconnect_delay_secs: 10,
            settle_delay_ms: 500,
            client_id: "gateway-client".to_string(),
            client_mode: "backend".to_string(),
            subscriber_buffer: 100,
        }
    }
}

impl MonitorConfig {
    /// 从 JSON 字符串解析
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: MonitorConfig = serde_json::from_str(json)?;
        for agent in &mut config.agents {
            agent.normalize();
        }
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("读取配置失败 {}: {}", path.display(), e)))?;
        let config = Self::from_json(&content)?;
        tracing::info!(
            "Loaded config {:?}: {} agents, {} gateways",
            path,
            config.agents.len(),
            config.gateway_count()
        );
        Ok(config)
    }

    /// 从环境变量或默认路径加载
    pub fn from_env() -> Result<Self> {
        Self::load(&Self::default_path())
    }

    /// 默认配置路径: ~/.fleet-monitor/config.json
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .map(|h| h.join(".fleet-monitor").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("fleet-monitor.json"))
    }

    /// 归档目录（默认 ~/.openclaw/agents）
    pub fn agents_dir(&self) -> PathBuf {
        if let Some(dir) = &self.agents_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .map(|h| h.join(".openclaw").join("agents"))
            .unwrap_or_else(|| PathBuf::from("agents"))
    }

    /// 不同 Gateway 连接数
    pub fn gateway_count(&self) -> usize {
        self.agents
            .iter()
            .map(|a| a.gateway_key())
            .collect::<HashSet<_>>()
            .len()
    }

    /// 校验：id 非空且唯一
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(Error::Config("agent id 不能为空".into()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(Error::Config(format!("重复的 agent id: {}", agent.id)));
            }
        }
        Ok(())
    }

    /// 生成 Collector 运行参数
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            host_interval: Duration::from_secs(self.host_interval_secs.max(1)),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            client_id: self.client_id.clone(),
            client_mode: self.client_mode.clone(),
            subscriber_buffer: self.subscriber_buffer.max(1),
        }
    }
}

/// Collector 运行参数
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Agent 轮询周期
    pub poll_interval: Duration,
    /// 主机指标轮询周期
    pub host_interval: Duration,
    /// 单个 RPC 超时
    pub request_timeout: Duration,
    /// 断线后固定重连延迟（无退避）
    pub reconnect_delay: Duration,
    /// 握手成功后首次轮询的延迟
    pub settle_delay: Duration,
    pub client_id: String,
    pub client_mode: String,
    pub subscriber_buffer: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        MonitorConfig::default().collector_config()
    }
}
