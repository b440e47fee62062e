//! 数据类型定义

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ==================== Collector 状态 ====================

/// 健康检查结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    /// Gateway 返回的完整 payload（未过滤）
    pub payload: Value,
    /// `payload.agents` 中与本 agent 匹配的条目
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<Value>,
}

/// 用量统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageState {
    pub payload: Value,
    /// 多个 Logical Agent 共享同一 Gateway 时为 true（用量为 Gateway 级别）
    pub shared: bool,
}

/// Agent 状态快照
///
/// 每个已配置的 Logical Agent 始终有一条记录，首次连接前所有字段为空。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateRecord {
    pub online: bool,
    /// 最后一次收到数据的时间（毫秒时间戳）
    pub last_seen: Option<i64>,
    pub health: Option<HealthState>,
    pub sessions: Option<Vec<Value>>,
    pub usage: Option<UsageState>,
    pub heartbeat: Option<Value>,
    pub channels: Option<Value>,
    pub cron: Option<Value>,
    pub presence: Option<Value>,
    pub error: Option<String>,
}

/// 状态增量
///
/// 只有 `Some` 的字段会被合并；`error: Some(None)` 表示清除错误。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentStatePatch {
    pub online: Option<bool>,
    pub last_seen: Option<i64>,
    pub health: Option<HealthState>,
    pub sessions: Option<Vec<Value>>,
    pub usage: Option<UsageState>,
    pub heartbeat: Option<Value>,
    pub channels: Option<Value>,
    pub cron: Option<Value>,
    pub presence: Option<Value>,
    pub error: Option<Option<String>>,
}

impl AgentStatePatch {
    /// 上线（清除错误）
    pub fn online(now: i64) -> Self {
        Self {
            online: Some(true),
            last_seen: Some(now),
            error: Some(None),
            ..Default::default()
        }
    }

    /// 离线并记录原因
    pub fn offline(reason: impl Into<String>) -> Self {
        Self {
            online: Some(false),
            error: Some(Some(reason.into())),
            ..Default::default()
        }
    }

    /// 仅刷新 last_seen
    pub fn seen(now: i64) -> Self {
        Self {
            last_seen: Some(now),
            ..Default::default()
        }
    }
}

impl AgentStateRecord {
    /// 逐字段浅合并
    pub fn merge(&mut self, patch: AgentStatePatch) {
        if let Some(online) = patch.online {
            self.online = online;
        }
        if let Some(last_seen) = patch.last_seen {
            self.last_seen = Some(last_seen);
        }
        if let Some(health) = patch.health {
            self.health = Some(health);
        }
        if let Some(sessions) = patch.sessions {
            self.sessions = Some(sessions);
        }
        if let Some(usage) = patch.usage {
            self.usage = Some(usage);
        }
        if let Some(heartbeat) = patch.heartbeat {
            self.heartbeat = Some(heartbeat);
        }
        if let Some(channels) = patch.channels {
            self.channels = Some(channels);
        }
        if let Some(cron) = patch.cron {
            self.cron = Some(cron);
        }
        if let Some(presence) = patch.presence {
            self.presence = Some(presence);
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
    }
}

/// 主机指标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetrics {
    pub hostname: Option<String>,
    /// 1 / 5 / 15 分钟负载
    pub load_average: [f64; 3],
    pub memory_total: u64,
    pub memory_used: u64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub uptime_secs: u64,
    /// 采集时间（毫秒时间戳）
    pub collected_at: i64,
}

/// 全量快照（供新订阅者初始化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// 生成时间（毫秒时间戳）
    pub ts: i64,
    pub agents: BTreeMap<String, AgentStateRecord>,
    pub host: Option<HostMetrics>,
}

// ==================== 会话归档 ====================

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total: u64,
}

impl TokenUsage {
    /// 由四项计数构造，total 为四项之和（饱和到 `u64::MAX`）
    pub fn new(input: u64, output: u64, cache_read: u64, cache_write: u64) -> Self {
        Self {
            input,
            output,
            cache_read,
            cache_write,
            total: input
                .saturating_add(output)
                .saturating_add(cache_read)
                .saturating_add(cache_write),
        }
    }

    /// 累加，transcript 里的异常大数不会溢出
    pub fn add(&mut self, other: &TokenUsage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.cache_read = self.cache_read.saturating_add(other.cache_read);
        self.cache_write = self.cache_write.saturating_add(other.cache_write);
        self.total = self.total.saturating_add(other.total);
    }
}

/// 会话记录（每次分析时从磁盘重新构建）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// 会话 key，如 `agent:main:main`
    pub key: String,
    pub agent_id: String,
    pub session_id: String,
    pub display_name: Option<String>,
    /// 最后使用的模型
    pub model: Option<String>,
    pub cost: f64,
    pub tokens: TokenUsage,
    pub message_count: usize,
    /// 用户消息数（即 API 调用次数）
    pub api_calls: usize,
    /// 首条消息时间（毫秒时间戳）
    pub start_time: Option<i64>,
    /// 末条消息时间（毫秒时间戳）
    pub end_time: Option<i64>,
    pub updated_at: Option<i64>,
    pub is_main: bool,
    pub parent_key: Option<String>,
}

/// 委派树节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationNode {
    #[serde(flatten)]
    pub session: SessionRecord,
    pub children: Vec<DelegationNode>,
}

/// 委派森林汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationSummary {
    pub total_sessions: usize,
    pub subagent_sessions: usize,
    pub total_cost: f64,
    pub max_depth: usize,
}

/// 委派分析结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationReport {
    pub roots: Vec<DelegationNode>,
    pub summary: DelegationSummary,
}

/// 会话轨迹中的单条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStep {
    pub timestamp: Option<i64>,
    pub role: String,
    pub model: Option<String>,
    pub cost: f64,
    pub tokens: TokenUsage,
    pub stop_reason: Option<String>,
    pub tools: Vec<String>,
    pub preview: String,
}

/// 单会话轨迹
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTrace {
    pub session: SessionRecord,
    pub children: Vec<String>,
    pub steps: Vec<TraceStep>,
}
