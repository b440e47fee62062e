//! 会话归档分析
//!
//! 离线读取 agents 目录（每个 agent 一个子目录，内含 `sessions.json` 索引和 transcript），
//! 重新计算每个会话的成本/token，并还原主会话与子会话的委派关系。
//!
//! 纯读取、无缓存：每次查询都重新扫描磁盘。目录或索引缺失时返回空结果，不报错。

pub mod delegation;
pub mod index;
pub mod transcript;

use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{DelegationReport, SessionRecord, SessionTrace};

use index::IndexEntry;

/// 会话归档分析器
#[derive(Debug, Clone)]
pub struct SessionArchive {
    agents_dir: PathBuf,
    /// 截止时间（毫秒时间戳），更早的消息不计入
    cutoff: Option<i64>,
}

impl SessionArchive {
    pub fn new(agents_dir: impl Into<PathBuf>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            cutoff: None,
        }
    }

    /// 只统计 `cutoff_ms` 之后的消息
    pub fn with_cutoff(mut self, cutoff_ms: i64) -> Self {
        self.cutoff = Some(cutoff_ms);
        self
    }

    /// 只统计最近 `window` 内的消息
    pub fn with_window(self, window: chrono::Duration) -> Self {
        let cutoff = chrono::Utc::now() - window;
        self.with_cutoff(cutoff.timestamp_millis())
    }

    pub fn agents_dir(&self) -> &Path {
        &self.agents_dir
    }

    pub fn cutoff(&self) -> Option<i64> {
        self.cutoff
    }

    /// 所有会话，最近更新的在前
    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> =
            self.entries().iter().filter_map(|e| self.record(e)).collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records
    }

    /// 单个会话的逐条轨迹
    pub fn get_session_trace(&self, key: &str) -> Option<SessionTrace> {
        let entries = self.entries();
        let entry = entries.iter().find(|e| e.key == key)?;

        let scan = transcript::scan_file(&entry.session_file, self.cutoff, true);
        let steps = scan.steps.clone();
        let session = build_record(entry, scan);

        let mut children: Vec<(Option<i64>, String)> = entries
            .iter()
            .filter(|e| e.key != key && resolve_parent(e).as_deref() == Some(key))
            .map(|e| (e.updated_at, e.key.clone()))
            .collect();
        children.sort_by(|a, b| b.0.cmp(&a.0));

        Some(SessionTrace {
            session,
            children: children.into_iter().map(|(_, k)| k).collect(),
            steps,
        })
    }

    /// 委派森林及汇总
    pub fn get_delegation_traces(&self) -> DelegationReport {
        let records = self.list_sessions();
        let roots = delegation::build_forest(records);
        let summary = delegation::summarize(&roots);
        tracing::debug!(
            "Delegation report: {} sessions, {} subagents, depth {}",
            summary.total_sessions,
            summary.subagent_sessions,
            summary.max_depth
        );
        DelegationReport { roots, summary }
    }

    /// 扫描并汇总单个会话
    ///
    /// 设置了截止时间时，窗口内没有消息且更新时间早于截止时间的会话被排除。
    fn record(&self, entry: &IndexEntry) -> Option<SessionRecord> {
        let scan = transcript::scan_file(&entry.session_file, self.cutoff, false);
        if let Some(cutoff) = self.cutoff {
            let stale = entry.updated_at.map(|t| t < cutoff).unwrap_or(false);
            if scan.message_count == 0 && stale {
                return None;
            }
        }
        Some(build_record(entry, scan))
    }

    /// 枚举所有 agent 目录下的索引条目
    fn entries(&self) -> Vec<IndexEntry> {
        let mut entries = Vec::new();

        let dirs = match fs::read_dir(&self.agents_dir) {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!("Agents dir unavailable {:?}: {}", self.agents_dir, e);
                return entries;
            }
        };

        let mut agent_dirs: Vec<PathBuf> = dirs
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !n.is_empty() && !n.starts_with('.'))
                    .unwrap_or(false)
            })
            .collect();
        agent_dirs.sort();

        for dir in agent_dirs {
            if let Some(index) = index::find_index(&dir) {
                entries.extend(index::load_index(&index));
            }
        }
        entries
    }
}

/// 父会话：`spawnedBy` 优先，否则从 key 推导；根会话没有父节点
fn resolve_parent(entry: &IndexEntry) -> Option<String> {
    if delegation::is_root_key(&entry.key) {
        return None;
    }
    entry
        .spawned_by
        .clone()
        .or_else(|| delegation::parent_key(&entry.key))
}

/// key 的第二段（`agent:<id>:...`）
fn agent_id_of(key: &str) -> String {
    let mut parts = key.split(':');
    match (parts.next(), parts.next()) {
        (Some("agent"), Some(id)) if !id.is_empty() => id.to_string(),
        _ => String::new(),
    }
}

fn build_record(entry: &IndexEntry, scan: transcript::TranscriptScan) -> SessionRecord {
    SessionRecord {
        key: entry.key.clone(),
        agent_id: agent_id_of(&entry.key),
        session_id: entry.session_id.clone(),
        display_name: entry.display_name.clone(),
        model: scan.model,
        cost: scan.cost,
        tokens: scan.tokens,
        message_count: scan.message_count,
        api_calls: scan.api_calls,
        start_time: scan.start_time,
        end_time: scan.end_time,
        updated_at: entry.updated_at.or(scan.end_time),
        is_main: entry.key.ends_with(":main"),
        parent_key: resolve_parent(entry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_of() {
        assert_eq!(agent_id_of("agent:coder:main"), "coder");
        assert_eq!(agent_id_of("agent:coder:subagent:1"), "coder");
        assert_eq!(agent_id_of("global"), "");
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let archive = SessionArchive::new("/nonexistent/agents");
        assert!(archive.list_sessions().is_empty());
        assert!(archive.get_session_trace("agent:x:main").is_none());

        let report = archive.get_delegation_traces();
        assert!(report.roots.is_empty());
        assert_eq!(report.summary.max_depth, 0);
    }

    #[test]
    fn test_resolve_parent_prefers_spawned_by() {
        let entry = IndexEntry {
            key: "agent:x:subagent:1".to_string(),
            session_id: "s".to_string(),
            session_file: PathBuf::from("s.jsonl"),
            updated_at: None,
            display_name: None,
            spawned_by: Some("agent:x:cron:daily".to_string()),
        };
        assert_eq!(resolve_parent(&entry).as_deref(), Some("agent:x:cron:daily"));

        let derived = IndexEntry {
            spawned_by: None,
            ..entry.clone()
        };
        assert_eq!(resolve_parent(&derived).as_deref(), Some("agent:x:main"));

        let root = IndexEntry {
            key: "agent:x:main".to_string(),
            ..entry
        };
        assert!(resolve_parent(&root).is_none());
    }

    #[test]
    fn test_with_window_sets_cutoff() {
        let before = chrono::Utc::now().timestamp_millis();
        let archive = SessionArchive::new("/tmp").with_window(chrono::Duration::days(7));
        let cutoff = archive.cutoff().unwrap();
        assert!(cutoff <= before - 7 * 24 * 3600 * 1000 + 1000);
        assert!(cutoff >= before - 7 * 24 * 3600 * 1000 - 1000);
    }
}
