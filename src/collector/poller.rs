//! 轮询调度
//!
//! - Agent 轮询：每个周期向 Collector 投递一次 `PollAll`
//! - 主机指标：每个周期在阻塞线程上采集一次，失败则跳过本轮
//!
//! 没有背压：上一轮 RPC 未完成时下一轮照常发出。

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

use super::host;
use super::Command;
use crate::config::GatewayKey;

/// 一轮轮询的结果（None 表示该字段不可用）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollRound {
    pub health: Option<Value>,
    pub sessions: Option<Value>,
    pub usage: Option<Value>,
    pub heartbeat: Option<Value>,
    pub channels: Option<Value>,
    pub cron: Option<Value>,
}

impl PollRound {
    /// 成功返回的字段数
    pub fn resolved_count(&self) -> usize {
        [
            &self.health,
            &self.sessions,
            &self.usage,
            &self.heartbeat,
            &self.channels,
            &self.cron,
        ]
        .iter()
        .filter(|v| v.is_some())
        .count()
    }
}

/// 延迟投递一条命令
pub(crate) fn schedule(
    delay: Duration,
    tx: mpsc::UnboundedSender<Command>,
    command: Command,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = tx.send(command);
    })
}

/// Agent 轮询定时器
pub(crate) fn spawn_agent_ticker(
    period: Duration,
    tx: mpsc::UnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if tx.send(Command::PollAll).is_err() {
                break;
            }
        }
    })
}

/// 主机指标定时器（启动时立即采集一次）
pub(crate) fn spawn_host_ticker(
    period: Duration,
    tx: mpsc::UnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }
            match tokio::task::spawn_blocking(host::collect).await {
                Ok(Some(metrics)) => {
                    if tx.send(Command::HostMetrics(metrics)).is_err() {
                        break;
                    }
                }
                Ok(None) => tracing::debug!("Host metrics unavailable, keeping previous value"),
                Err(e) => tracing::debug!("Host metrics collection failed: {}", e),
            }
        }
    })
}

/// 等待一轮六个 RPC 全部结束，再作为一次合并投递回 Collector
pub(crate) fn spawn_round(
    key: GatewayKey,
    receivers: [oneshot::Receiver<Option<Value>>; 6],
    tx: mpsc::UnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let [health, sessions, usage, heartbeat, channels, cron] = receivers;
        let (health, sessions, usage, heartbeat, channels, cron) = tokio::join!(
            reply(health),
            reply(sessions),
            reply(usage),
            reply(heartbeat),
            reply(channels),
            reply(cron),
        );
        let round = PollRound {
            health,
            sessions,
            usage,
            heartbeat,
            channels,
            cron,
        };
        let _ = tx.send(Command::RoundComplete { key, round });
    })
}

/// 通道被丢弃（连接被移除）与超时同样视为无数据
async fn reply(rx: oneshot::Receiver<Option<Value>>) -> Option<Value> {
    rx.await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolved_count() {
        let round = PollRound {
            health: Some(json!({})),
            cron: Some(json!([])),
            ..Default::default()
        };
        assert_eq!(round.resolved_count(), 2);
        assert_eq!(PollRound::default().resolved_count(), 0);
    }

    #[tokio::test]
    async fn test_round_waits_for_all_replies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = GatewayKey {
            host: "h".to_string(),
            port: 1,
            token: "t".to_string(),
        };

        let mut senders = Vec::new();
        let receivers: [oneshot::Receiver<Option<Value>>; 6] = std::array::from_fn(|_| {
            let (s, r) = oneshot::channel();
            senders.push(s);
            r
        });
        spawn_round(key.clone(), receivers, tx);

        let mut senders = senders.into_iter();
        let health = senders.next().unwrap();
        health.send(Some(json!({"ok": true}))).unwrap();
        // sessions 超时
        senders.next().unwrap().send(None).unwrap();
        // 其余通道直接丢弃
        drop(senders);

        match rx.recv().await {
            Some(Command::RoundComplete { key: k, round }) => {
                assert_eq!(k, key);
                assert_eq!(round.health, Some(json!({"ok": true})));
                assert!(round.sessions.is_none());
                assert_eq!(round.resolved_count(), 1);
            }
            _ => panic!("Expected RoundComplete"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_ticker_fires_every_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let handle = spawn_agent_ticker(Duration::from_secs(15), tx);

        assert!(matches!(rx.recv().await, Some(Command::PollAll)));
        assert!(start.elapsed() >= Duration::from_secs(15));
        assert!(matches!(rx.recv().await, Some(Command::PollAll)));
        assert!(start.elapsed() >= Duration::from_secs(30));

        handle.abort();
    }
}
