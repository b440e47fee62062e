//! sessions.json 索引解析
//!
//! 索引是一个对象：会话 key → `{ sessionId, sessionFile, updatedAt, displayName, spawnedBy }`。

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use super::transcript::timestamp_millis;

const INDEX_FILE: &str = "sessions.json";

/// 索引中的单个会话
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub key: String,
    pub session_id: String,
    /// 已解析为绝对路径的 transcript 文件
    pub session_file: PathBuf,
    pub updated_at: Option<i64>,
    pub display_name: Option<String>,
    pub spawned_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    session_id: Option<String>,
    session_file: Option<String>,
    #[serde(default)]
    updated_at: Value,
    display_name: Option<String>,
    spawned_by: Option<String>,
}

/// 查找 agent 目录下的索引：优先 `sessions/sessions.json`，其次 `sessions.json`
pub fn find_index(agent_dir: &Path) -> Option<PathBuf> {
    [
        agent_dir.join("sessions").join(INDEX_FILE),
        agent_dir.join(INDEX_FILE),
    ]
    .into_iter()
    .find(|p| p.is_file())
}

/// 读取并解析索引；文件缺失或格式错误时返回空列表
pub fn load_index(path: &Path) -> Vec<IndexEntry> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!("Cannot read session index {:?}: {}", path, e);
            return Vec::new();
        }
    };
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_index(&content, base)
}

/// 解析索引内容，相对路径按 `base` 解析
pub fn parse_index(content: &str, base: &Path) -> Vec<IndexEntry> {
    let map = match serde_json::from_str::<serde_json::Map<String, Value>>(content) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Malformed session index: {}", e);
            return Vec::new();
        }
    };

    let mut entries = Vec::new();
    for (key, value) in map {
        let raw: RawEntry = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Skipping index entry {}: {}", key, e);
                continue;
            }
        };

        let session_id = match (&raw.session_id, &raw.session_file) {
            (Some(id), _) if !id.is_empty() => id.clone(),
            (_, Some(file)) => match Path::new(file).file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            },
            _ => continue,
        };

        let session_file = match &raw.session_file {
            Some(file) if Path::new(file).is_absolute() => PathBuf::from(file),
            Some(file) => base.join(file),
            None => base.join(format!("{}.jsonl", session_id)),
        };

        entries.push(IndexEntry {
            key,
            session_id,
            session_file,
            updated_at: timestamp_millis(&raw.updated_at),
            display_name: raw.display_name,
            spawned_by: raw.spawned_by.filter(|s| !s.is_empty()),
        });
    }
    entries
}
