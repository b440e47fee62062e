//! Agent 状态拆分
//!
//! Gateway 的数据是连接级别的，这里按 `gatewayAgentId` 拆给共享同一连接的各个 Logical Agent。
//! heartbeat / channels / cron 在协议层没有 agent 维度，所有共享者收到相同的数据。

use serde_json::Value;

use super::poller::PollRound;
use crate::config::LogicalAgent;
use crate::protocol::event_name;
use crate::types::{AgentStatePatch, HealthState, UsageState};

/// 拆分 health：保留完整 payload，并附加 `agents[]` 中匹配的条目
pub fn split_health(payload: &Value, gateway_agent_id: &str) -> HealthState {
    let agent = payload
        .get("agents")
        .and_then(|a| a.as_array())
        .and_then(|agents| {
            agents
                .iter()
                .find(|entry| entry.get("agentId").and_then(|v| v.as_str()) == Some(gateway_agent_id))
        })
        .cloned();

    HealthState {
        payload: payload.clone(),
        agent,
    }
}

/// 按 `agent:<gatewayAgentId>:` 前缀过滤会话
///
/// payload 可以是数组或 `{ sessions: [...] }`，其他形状返回 None。
pub fn filter_sessions(payload: &Value, agent: &LogicalAgent) -> Option<Vec<Value>> {
    let list = match payload {
        Value::Array(items) => items,
        Value::Object(obj) => obj.get("sessions")?.as_array()?,
        _ => return None,
    };

    let prefix = agent.session_prefix();
    Some(
        list.iter()
            .filter(|s| {
                s.get("key")
                    .and_then(|k| k.as_str())
                    .map(|k| k.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .cloned()
            .collect(),
    )
}

/// 一轮轮询结果 → 单个 agent 的增量
pub fn split_round(
    round: &PollRound,
    agent: &LogicalAgent,
    shared: bool,
    now: i64,
) -> AgentStatePatch {
    AgentStatePatch {
        last_seen: Some(now),
        health: round
            .health
            .as_ref()
            .map(|h| split_health(h, &agent.gateway_agent_id)),
        sessions: round
            .sessions
            .as_ref()
            .and_then(|s| filter_sessions(s, agent)),
        usage: round.usage.as_ref().map(|u| UsageState {
            payload: u.clone(),
            shared,
        }),
        heartbeat: round.heartbeat.clone(),
        channels: round.channels.clone(),
        cron: round.cron.clone(),
        ..Default::default()
    }
}

/// hello-ok 快照 → 上线增量
pub fn hello_patch(payload: &Value, agent: &LogicalAgent, now: i64) -> AgentStatePatch {
    let snapshot = payload.get("snapshot");
    let mut patch = AgentStatePatch::online(now);
    if let Some(health) = snapshot.and_then(|s| s.get("health")).filter(|h| !h.is_null()) {
        patch.health = Some(split_health(health, &agent.gateway_agent_id));
    }
    if let Some(presence) = snapshot.and_then(|s| s.get("presence")).filter(|p| !p.is_null()) {
        patch.presence = Some(presence.clone());
    }
    patch
}

/// 服务端推送事件 → 增量（所有事件都刷新 last_seen）
pub fn event_patch(event: &str, payload: &Value, agent: &LogicalAgent, now: i64) -> AgentStatePatch {
    let mut patch = AgentStatePatch::seen(now);
    match event {
        event_name::HEALTH if !payload.is_null() => {
            patch.health = Some(split_health(payload, &agent.gateway_agent_id));
        }
        event_name::PRESENCE if !payload.is_null() => {
            patch.presence = Some(payload.clone());
        }
        _ => {}
    }
    patch
}
