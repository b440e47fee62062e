//! gateway-fleet-monitor - Gateway Agent 集群监控
//!
//! 监控运行在 Gateway 后面的一组 Logical Agent。
//!
//! # 核心功能
//!
//! - **遥测采集**: 每个唯一的 (host, port, token) 维持一条 WebSocket 连接，握手后定期轮询
//! - **状态拆分**: 共享同一 Gateway 的多个 agent 按 `gatewayAgentId` 拆分 health / sessions
//! - **事件推送**: 每次状态合并推送 `update`，主机指标推送 `hostMetrics`
//! - **归档分析**: 离线读取会话 transcript，重建成本 / token 和委派树
//!
//! # Feature Flags
//!
//! - `collector`: Gateway 遥测采集（WebSocket + 轮询 + 主机指标）
//! - `archive`: 会话归档分析
//!
//! # 架构
//!
//! Collector 是单个 actor 任务，独占所有连接和状态；socket、定时器、轮询只向它投递命令。
//! 归档分析是纯读取，和 Collector 不共享任何状态。

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

#[cfg(feature = "collector")]
pub mod collector;

#[cfg(feature = "archive")]
pub mod archive;

// Re-exports
pub use config::{CollectorConfig, GatewayKey, LogicalAgent, MonitorConfig};
pub use error::{Error, Result};
pub use protocol::{EventType, FleetEvent};
pub use types::*;

#[cfg(feature = "collector")]
pub use collector::{spawn as spawn_collector, CollectorHandle, LinkStatus, Subscription};

#[cfg(feature = "archive")]
pub use archive::SessionArchive;
