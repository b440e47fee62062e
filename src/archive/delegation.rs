//! 委派树
//!
//! 会话 key 形如 `agent:<id>:main` / `agent:<id>:subagent:<n>`，
//! 子会话的父节点优先取索引里的 `spawnedBy`，否则从 key 推导。

use std::collections::{HashMap, HashSet};

use crate::types::{DelegationNode, DelegationSummary, SessionRecord};

const SUBAGENT_MARKER: &str = ":subagent:";

/// 根会话：以 `:main` 结尾或不含 `:subagent:`
pub fn is_root_key(key: &str) -> bool {
    key.ends_with(":main") || !key.contains(SUBAGENT_MARKER)
}

/// 从 key 推导父会话
///
/// 去掉最后一段 `:subagent:<n>`；只剩 `agent:<id>` 时补上 `:main`。
/// 嵌套的 `agent:x:subagent:1:subagent:2` 挂到 `agent:x:subagent:1` 下，而不是直接挂到 `:main`。
pub fn parent_key(key: &str) -> Option<String> {
    if is_root_key(key) {
        return None;
    }
    let idx = key.rfind(SUBAGENT_MARKER)?;
    let base = &key[..idx];
    if base.is_empty() {
        return None;
    }
    if base.split(':').count() <= 2 {
        Some(format!("{}:main", base))
    } else {
        Some(base.to_string())
    }
}

/// 构建委派森林
///
/// 父节点不在集合中的子会话成为孤立根；根和兄弟节点按 `updated_at` 降序。
pub fn build_forest(records: Vec<SessionRecord>) -> Vec<DelegationNode> {
    let keys: HashSet<String> = records.iter().map(|r| r.key.clone()).collect();

    let mut children: HashMap<String, Vec<SessionRecord>> = HashMap::new();
    let mut roots: Vec<SessionRecord> = Vec::new();
    for record in records {
        match &record.parent_key {
            Some(parent) if parent != &record.key && keys.contains(parent) => {
                children.entry(parent.clone()).or_default().push(record);
            }
            _ => roots.push(record),
        }
    }

    sort_by_recency(&mut roots);
    let mut forest: Vec<DelegationNode> = roots
        .into_iter()
        .map(|r| attach(r, &mut children))
        .collect();

    // spawnedBy 成环时没有根可达，剩余节点作为根
    if !children.is_empty() {
        let mut rest: Vec<SessionRecord> = children.drain().flat_map(|(_, v)| v).collect();
        sort_by_recency(&mut rest);
        for record in rest {
            forest.push(DelegationNode {
                session: record,
                children: Vec::new(),
            });
        }
        forest.sort_by(|a, b| b.session.updated_at.cmp(&a.session.updated_at));
    }

    forest
}

fn attach(
    session: SessionRecord,
    children: &mut HashMap<String, Vec<SessionRecord>>,
) -> DelegationNode {
    let mut kids = children.remove(&session.key).unwrap_or_default();
    sort_by_recency(&mut kids);
    let kids = kids.into_iter().map(|k| attach(k, children)).collect();
    DelegationNode {
        session,
        children: kids,
    }
}

fn sort_by_recency(records: &mut [SessionRecord]) {
    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

/// 深度优先汇总（单个根深度为 1，空森林为 0）
pub fn summarize(roots: &[DelegationNode]) -> DelegationSummary {
    let mut summary = DelegationSummary::default();
    for root in roots {
        visit(root, 1, true, &mut summary);
    }
    summary
}

fn visit(node: &DelegationNode, depth: usize, is_root: bool, summary: &mut DelegationSummary) {
    summary.total_sessions += 1;
    if !is_root {
        summary.subagent_sessions += 1;
    }
    summary.total_cost += node.session.cost;
    summary.max_depth = summary.max_depth.max(depth);
    for child in &node.children {
        visit(child, depth + 1, false, summary);
    }
}
