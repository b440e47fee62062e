//! 协议定义
//!
//! - Gateway 线协议：WebSocket 文本帧，每帧一个 JSON（event / req / res）
//! - Collector 输出事件：推送给订阅者的 `update` / `hostMetrics`

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{AgentStateRecord, HostMetrics};

/// 握手协议版本
pub const PROTOCOL_VERSION: u32 = 3;

/// RPC 方法名
pub mod method {
    pub const CONNECT: &str = "connect";
    pub const HEALTH: &str = "health";
    pub const SESSIONS_LIST: &str = "sessions.list";
    pub const USAGE_COST: &str = "usage.cost";
    pub const LAST_HEARTBEAT: &str = "last-heartbeat";
    pub const CHANNELS_STATUS: &str = "channels.status";
    pub const CRON_LIST: &str = "cron.list";
}

/// Gateway 推送的事件名
pub mod event_name {
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    pub const HEALTH: &str = "health";
    pub const PRESENCE: &str = "presence";
    pub const TICK: &str = "tick";
}

/// Gateway 线协议帧
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// 服务端推送事件
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },

    /// 请求（Collector → Gateway）
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },

    /// 响应（Gateway → Collector）
    Res {
        id: Value,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        error: Option<Value>,
    },
}

impl Frame {
    /// 解析文本帧，格式异常返回 None
    pub fn parse(text: &str) -> Option<Frame> {
        match serde_json::from_str(text) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!("Discarding malformed frame: {}", e);
                None
            }
        }
    }

    /// 构造请求帧
    pub fn request(id: u64, method: &str, params: Value) -> Frame {
        Frame::Req {
            id: id.to_string(),
            method: method.to_string(),
            params,
        }
    }

    /// 序列化为文本帧
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// 解析响应 id（兼容字符串和数字）
pub fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// 提取 `res{ok:false}` 的错误信息
pub fn error_message(error: Option<&Value>) -> String {
    match error {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(other) => other.to_string(),
        None => "request rejected".to_string(),
    }
}

/// connect 请求参数
pub fn connect_params(client_id: &str, client_mode: &str, token: &str) -> Value {
    json!({
        "minProtocol": PROTOCOL_VERSION,
        "maxProtocol": PROTOCOL_VERSION,
        "client": {
            "id": client_id,
            "version": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
            "mode": client_mode,
        },
        "auth": { "token": token },
    })
}

/// 每轮轮询的 RPC 列表（方法名 + 参数）
pub fn poll_requests() -> [(&'static str, Value); 6] {
    [
        (method::HEALTH, Value::Null),
        (
            method::SESSIONS_LIST,
            json!({ "activeMinutes": 1440, "limit": 50 }),
        ),
        (method::USAGE_COST, json!({ "days": 7 })),
        (method::LAST_HEARTBEAT, Value::Null),
        (method::CHANNELS_STATUS, Value::Null),
        (method::CRON_LIST, Value::Null),
    ]
}

/// 推送事件（Collector → 订阅者）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FleetEvent {
    /// Agent 状态变化；removed 为 true 时 state 为 null
    Update {
        id: String,
        state: Option<AgentStateRecord>,
        removed: bool,
    },

    /// 主机指标
    HostMetrics { metrics: HostMetrics },
}

/// 事件类型（用于订阅过滤）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Update,
    HostMetrics,
}

impl FleetEvent {
    /// 获取事件类型
    pub fn event_type(&self) -> EventType {
        match self {
            FleetEvent::Update { .. } => EventType::Update,
            FleetEvent::HostMetrics { .. } => EventType::HostMetrics,
        }
    }

    /// 序列化为单行 JSON（JSONL 推送格式）
    pub fn to_json_line(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(format!("{}\n", json)),
            Err(e) => {
                tracing::error!("Failed to serialize event: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_frame() {
        let text = r#"{"type":"event","event":"connect.challenge","payload":{"nonce":"n1"}}"#;
        match Frame::parse(text) {
            Some(Frame::Event { event, payload }) => {
                assert_eq!(event, event_name::CONNECT_CHALLENGE);
                assert_eq!(payload["nonce"], "n1");
            }
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_res_frame_with_numeric_and_string_id() {
        let text = r#"{"type":"res","id":"42","ok":true,"payload":{"status":"ok"}}"#;
        match Frame::parse(text) {
            Some(Frame::Res { id, ok, payload, .. }) => {
                assert_eq!(response_id(&id), Some(42));
                assert!(ok);
                assert_eq!(payload["status"], "ok");
            }
            other => panic!("Expected Res, got {:?}", other),
        }

        let text = r#"{"type":"res","id":7,"ok":false,"error":{"code":"AUTH","message":"bad token"}}"#;
        match Frame::parse(text) {
            Some(Frame::Res { id, ok, error, .. }) => {
                assert_eq!(response_id(&id), Some(7));
                assert!(!ok);
                assert_eq!(error_message(error.as_ref()), "bad token");
            }
            other => panic!("Expected Res, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames_are_discarded() {
        assert!(Frame::parse("not json").is_none());
        assert!(Frame::parse(r#"{"type":"bogus"}"#).is_none());
        assert!(Frame::parse(r#"{"event":"tick"}"#).is_none());
    }

    #[test]
    fn test_request_frame_shape() {
        let text = Frame::request(3, method::SESSIONS_LIST, json!({"limit": 50})).to_text();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "req");
        assert_eq!(value["id"], "3");
        assert_eq!(value["method"], "sessions.list");
        assert_eq!(value["params"]["limit"], 50);
    }

    #[test]
    fn test_connect_params() {
        let params = connect_params("gateway-client", "backend", "tok");
        assert_eq!(params["minProtocol"], 3);
        assert_eq!(params["maxProtocol"], 3);
        assert_eq!(params["client"]["id"], "gateway-client");
        assert_eq!(params["client"]["mode"], "backend");
        assert_eq!(params["auth"]["token"], "tok");
    }

    #[test]
    fn test_error_message_fallbacks() {
        assert_eq!(error_message(None), "request rejected");
        assert_eq!(error_message(Some(&json!("denied"))), "denied");
        assert_eq!(error_message(Some(&json!({"code": 1}))), r#"{"code":1}"#);
    }

    #[test]
    fn test_fleet_event_serialization() {
        let event = FleetEvent::Update {
            id: "alice".to_string(),
            state: None,
            removed: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["removed"], true);
        assert!(json["state"].is_null());
        assert_eq!(event.event_type(), EventType::Update);
    }
}
