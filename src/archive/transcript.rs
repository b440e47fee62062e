//! 会话 transcript 扫描（NDJSON，逐行读取）
//!
//! 只关心两类记录：
//! - `model_change`：切换当前模型
//! - `message`：角色、时间戳、用量（`usage.cost.total` 等）
//!
//! 无法解析的行直接跳过；早于截止时间的消息不计入，但继续扫描后续行。

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde_json::Value;

use crate::types::{TokenUsage, TraceStep};

/// 预览最大字符数
const PREVIEW_CHARS: usize = 100;

/// 单个 transcript 的扫描结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptScan {
    pub cost: f64,
    pub tokens: TokenUsage,
    pub message_count: usize,
    /// 用户消息数
    pub api_calls: usize,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// 最后使用的模型
    pub model: Option<String>,
    /// 仅在 `with_steps` 时填充
    pub steps: Vec<TraceStep>,
}

/// 解析时间戳为毫秒（RFC 3339 字符串、数字字符串或毫秒数）
pub fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => parse_timestamp_to_millis(s),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

fn parse_timestamp_to_millis(ts: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(ts) {
        return Some(dt.timestamp_millis());
    }
    ts.parse::<i64>().ok()
}

/// 按 Unicode 字符截断
fn truncate_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// 扫描 transcript 文件；文件不存在时返回空结果
pub fn scan_file(path: &Path, cutoff: Option<i64>, with_steps: bool) -> TranscriptScan {
    match File::open(path) {
        Ok(file) => scan(BufReader::new(file), cutoff, with_steps),
        Err(e) => {
            tracing::debug!("Transcript unavailable {:?}: {}", path, e);
            TranscriptScan::default()
        }
    }
}

/// 扫描 transcript 内容
pub fn scan<R: BufRead>(reader: R, cutoff: Option<i64>, with_steps: bool) -> TranscriptScan {
    let mut result = TranscriptScan::default();
    let mut current_model: Option<String> = None;

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::debug!("Transcript read error: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        match record.get("type").and_then(|t| t.as_str()) {
            Some("model_change") => {
                if let Some(model) = record
                    .get("modelId")
                    .or_else(|| record.get("model"))
                    .and_then(|m| m.as_str())
                {
                    current_model = Some(model.to_string());
                }
            }
            Some("message") => {
                let Some(message) = record.get("message") else {
                    continue;
                };
                if let Some(model) = message.get("model").and_then(|m| m.as_str()) {
                    current_model = Some(model.to_string());
                }

                let timestamp = record
                    .get("timestamp")
                    .or_else(|| message.get("timestamp"))
                    .and_then(timestamp_millis);
                // 没有时间戳的消息视为在窗口内
                if let (Some(cutoff), Some(ts)) = (cutoff, timestamp) {
                    if ts < cutoff {
                        continue;
                    }
                }

                let role = message
                    .get("role")
                    .and_then(|r| r.as_str())
                    .unwrap_or("unknown");
                let usage = message.get("usage");
                let cost = usage.map(usage_cost).unwrap_or(0.0);
                let tokens = usage.map(usage_tokens).unwrap_or_default();

                result.cost += cost;
                result.tokens.add(&tokens);
                result.message_count += 1;
                if role == "user" {
                    result.api_calls += 1;
                }
                if let Some(ts) = timestamp {
                    result.start_time = Some(result.start_time.map_or(ts, |s| s.min(ts)));
                    result.end_time = Some(result.end_time.map_or(ts, |e| e.max(ts)));
                }
                if current_model.is_some() {
                    result.model = current_model.clone();
                }

                if with_steps {
                    let content = message.get("content");
                    result.steps.push(TraceStep {
                        timestamp,
                        role: role.to_string(),
                        model: current_model.clone(),
                        cost,
                        tokens,
                        stop_reason: message
                            .get("stopReason")
                            .and_then(|s| s.as_str())
                            .map(String::from),
                        tools: content.map(tool_names).unwrap_or_default(),
                        preview: content.map(preview).unwrap_or_default(),
                    });
                }
            }
            _ => {}
        }
    }

    result
}

/// `usage.cost.total`，也接受直接给出数字的 `usage.cost`
fn usage_cost(usage: &Value) -> f64 {
    match usage.get("cost") {
        Some(Value::Object(cost)) => cost.get("total").and_then(|t| t.as_f64()).unwrap_or(0.0),
        Some(cost) => cost.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

fn usage_tokens(usage: &Value) -> TokenUsage {
    let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
    TokenUsage::new(
        field("input"),
        field("output"),
        field("cacheRead"),
        field("cacheWrite"),
    )
}

/// content 中调用的工具名
fn tool_names(content: &Value) -> Vec<String> {
    let Some(blocks) = content.as_array() else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| {
            matches!(
                b.get("type").and_then(|t| t.as_str()),
                Some("toolCall") | Some("tool_use")
            )
        })
        .filter_map(|b| b.get("name").and_then(|n| n.as_str()).map(String::from))
        .collect()
}

/// 文本预览：字符串内容直接截断，content blocks 拼接 text 块
fn preview(content: &Value) -> String {
    match content {
        Value::String(text) => truncate_chars(text, PREVIEW_CHARS),
        Value::Array(blocks) => {
            let text = blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(" ");
            truncate_chars(&text, PREVIEW_CHARS)
        }
        _ => String::new(),
    }
}
