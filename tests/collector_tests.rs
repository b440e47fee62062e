//! Collector 集成测试
//!
//! 用 `accept_async` 在本地起一个假的 Gateway，走真实的 WebSocket 握手和轮询。

#[cfg(feature = "collector")]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use gateway_fleet_monitor::{
        spawn_collector, CollectorConfig, CollectorHandle, EventType, FleetEvent, LogicalAgent,
        Snapshot,
    };
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{sleep, timeout, Instant};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    const TOKEN: &str = "shared-token-abcdef";

    /// 假 Gateway 的行为
    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Behavior {
        /// 正常握手并应答轮询
        Normal,
        /// 拒绝 connect
        Reject,
        /// 接受连接但从不发送 challenge
        Silent,
        /// 第一条连接在 hello 后直接断开 TCP（无 close 帧），之后正常
        DropAfterHello,
    }

    struct FakeGateway {
        port: u16,
        accepted: Arc<AtomicUsize>,
    }

    impl FakeGateway {
        async fn start(behavior: Behavior) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let accepted = Arc::new(AtomicUsize::new(0));

            let count = accepted.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let n = count.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, behavior, n));
                }
            });

            Self { port, accepted }
        }

        fn agent(&self, id: &str, token: &str) -> LogicalAgent {
            LogicalAgent::new(id, "127.0.0.1", self.port, token)
        }

        fn accepted(&self) -> usize {
            self.accepted.load(Ordering::SeqCst)
        }
    }

    async fn send(ws: &mut WebSocketStream<TcpStream>, value: Value) {
        let _ = ws.send(Message::Text(value.to_string().into())).await;
    }

    async fn serve(stream: TcpStream, behavior: Behavior, n: usize) {
        let Ok(mut ws) = accept_async(stream).await else {
            return;
        };

        if behavior == Behavior::Silent {
            while let Some(Ok(_)) = ws.next().await {}
            return;
        }

        send(
            &mut ws,
            json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "n1"}}),
        )
        .await;

        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            let req: Value = serde_json::from_str(text.as_str()).unwrap();
            let id = req["id"].clone();
            let method = req["method"].as_str().unwrap_or_default().to_string();

            let response = match (method.as_str(), behavior) {
                ("connect", Behavior::Reject) => json!({
                    "type": "res", "id": id, "ok": false,
                    "error": {"message": "invalid token"}
                }),
                ("connect", _) => {
                    assert_eq!(req["params"]["auth"]["token"], TOKEN);
                    json!({
                        "type": "res", "id": id, "ok": true,
                        "payload": {
                            "type": "hello-ok",
                            "protocol": 3,
                            "snapshot": {"presence": [{"host": "gateway-box"}]}
                        }
                    })
                }
                ("health", _) => json!({
                    "type": "res", "id": id, "ok": true,
                    "payload": {"ok": true, "agents": [
                        {"agentId": "a", "status": "idle"},
                        {"agentId": "b", "status": "busy"}
                    ]}
                }),
                ("sessions.list", _) => json!({
                    "type": "res", "id": id, "ok": true,
                    "payload": {"sessions": [
                        {"key": "agent:a:main", "totalTokens": 10},
                        {"key": "agent:b:main", "totalTokens": 20}
                    ]}
                }),
                ("usage.cost", _) => json!({
                    "type": "res", "id": id, "ok": true,
                    "payload": {"totalCost": 1.25}
                }),
                ("cron.list", _) => json!({
                    "type": "res", "id": id, "ok": false,
                    "error": {"message": "unknown method"}
                }),
                _ => json!({"type": "res", "id": id, "ok": true, "payload": {}}),
            };
            send(&mut ws, response).await;

            if method == "connect" && behavior == Behavior::DropAfterHello && n == 0 {
                sleep(Duration::from_millis(100)).await;
                // 直接丢弃连接，不发送 close 帧
                return;
            }
        }
    }

    fn test_config() -> CollectorConfig {
        CollectorConfig {
            poll_interval: Duration::from_secs(60),
            host_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(300),
            settle_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    /// 轮询快照直到满足条件
    async fn wait_for<F>(handle: &CollectorHandle, condition: F) -> Snapshot
    where
        F: Fn(&Snapshot) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = handle.snapshot().await.unwrap();
                if condition(&snapshot) {
                    return snapshot;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    }

    fn online(snapshot: &Snapshot, id: &str) -> bool {
        snapshot.agents.get(id).map(|s| s.online).unwrap_or(false)
    }

    // ==================== 握手 ====================

    #[tokio::test]
    async fn test_shared_gateway_uses_one_connection() {
        let gateway = FakeGateway::start(Behavior::Normal).await;
        let handle = spawn_collector(
            test_config(),
            vec![gateway.agent("a", TOKEN), gateway.agent("b", TOKEN)],
        );

        let snapshot = wait_for(&handle, |s| online(s, "a") && online(s, "b")).await;
        assert_eq!(gateway.accepted(), 1);

        let a = &snapshot.agents["a"];
        assert!(a.error.is_none());
        assert_eq!(a.presence, Some(json!([{"host": "gateway-box"}])));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_rejected_handshake_reports_server_message() {
        let gateway = FakeGateway::start(Behavior::Reject).await;
        let handle = spawn_collector(test_config(), vec![gateway.agent("a", TOKEN)]);

        let snapshot = wait_for(&handle, |s| s.agents["a"].error.is_some()).await;
        let a = &snapshot.agents["a"];
        assert!(!a.online);
        assert_eq!(a.error.as_deref(), Some("invalid token"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_gateway_marks_agent_offline() {
        // 绑定后立即释放端口，连接会被拒绝
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let handle = spawn_collector(
            test_config(),
            vec![LogicalAgent::new("a", "127.0.0.1", port, TOKEN)],
        );

        let snapshot = wait_for(&handle, |s| s.agents["a"].error.is_some()).await;
        assert!(!snapshot.agents["a"].online);
        assert!(!snapshot.agents["a"].error.as_deref().unwrap().is_empty());

        handle.shutdown();
    }

    // ==================== 断线重连 ====================

    #[tokio::test]
    async fn test_abnormal_close_marks_sharing_agents_offline_and_reconnects() {
        let gateway = FakeGateway::start(Behavior::DropAfterHello).await;
        let handle = spawn_collector(
            test_config(),
            vec![gateway.agent("a", TOKEN), gateway.agent("b", TOKEN)],
        );
        let mut events = handle.subscribe(&[EventType::Update]);

        // 等待两个 agent 都收到带 1006 的离线更新
        let mut offline = std::collections::HashSet::new();
        timeout(Duration::from_secs(5), async {
            while offline.len() < 2 {
                if let Some(FleetEvent::Update {
                    id,
                    state: Some(state),
                    ..
                }) = events.recv().await
                {
                    let reason = state.error.clone().unwrap_or_default();
                    if !state.online && reason.contains("1006") {
                        offline.insert(id);
                    }
                }
            }
        })
        .await
        .expect("offline updates not received");

        // 固定延迟后重连成功
        let dropped_at = Instant::now();
        wait_for(&handle, |s| online(s, "a") && online(s, "b")).await;
        assert!(dropped_at.elapsed() >= Duration::from_millis(200));
        assert_eq!(gateway.accepted(), 2);

        handle.shutdown();
    }

    // ==================== 轮询与拆分 ====================

    #[tokio::test]
    async fn test_first_poll_splits_sessions_per_agent() {
        let gateway = FakeGateway::start(Behavior::Normal).await;
        let handle = spawn_collector(
            test_config(),
            vec![gateway.agent("a", TOKEN), gateway.agent("b", TOKEN)],
        );

        let snapshot = wait_for(&handle, |s| {
            s.agents["a"].sessions.is_some() && s.agents["b"].sessions.is_some()
        })
        .await;

        let a = &snapshot.agents["a"];
        let b = &snapshot.agents["b"];
        let a_keys: Vec<&str> = a
            .sessions
            .as_ref()
            .unwrap()
            .iter()
            .map(|s| s["key"].as_str().unwrap())
            .collect();
        let b_keys: Vec<&str> = b
            .sessions
            .as_ref()
            .unwrap()
            .iter()
            .map(|s| s["key"].as_str().unwrap())
            .collect();
        assert_eq!(a_keys, vec!["agent:a:main"]);
        assert_eq!(b_keys, vec!["agent:b:main"]);

        assert_eq!(
            a.health.as_ref().unwrap().agent,
            Some(json!({"agentId": "a", "status": "idle"}))
        );
        assert!(a.usage.as_ref().unwrap().shared);
        // cron.list 被拒绝：字段保持为空
        assert!(a.cron.is_none());
        assert!(a.last_seen.is_some());

        handle.shutdown();
    }

    // ==================== RPC ====================

    #[tokio::test]
    async fn test_request_while_connecting_returns_none_immediately() {
        let gateway = FakeGateway::start(Behavior::Silent).await;
        let handle = spawn_collector(test_config(), vec![gateway.agent("a", TOKEN)]);

        // 等待 socket 建立（停留在 connecting）
        timeout(Duration::from_secs(5), async {
            while gateway.accepted() == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let start = Instant::now();
        let reply = handle.request("a", "health", Value::Null).await;
        assert!(reply.is_none());
        assert!(start.elapsed() < Duration::from_secs(1));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_request_through_connected_link() {
        let gateway = FakeGateway::start(Behavior::Normal).await;
        let handle = spawn_collector(test_config(), vec![gateway.agent("a", TOKEN)]);
        wait_for(&handle, |s| online(s, "a")).await;

        let reply = handle.request("a", "usage.cost", json!({"days": 1})).await;
        assert_eq!(reply, Some(json!({"totalCost": 1.25})));

        // 被拒绝的方法
        assert!(handle.request("a", "cron.list", Value::Null).await.is_none());
        // 未知 agent
        assert!(handle.request("nobody", "health", Value::Null).await.is_none());

        handle.shutdown();
    }

    // ==================== 快照与重载 ====================

    #[tokio::test]
    async fn test_snapshot_is_stable_without_events() {
        let gateway = FakeGateway::start(Behavior::Normal).await;
        let handle = spawn_collector(test_config(), vec![gateway.agent("a", TOKEN)]);
        wait_for(&handle, |s| s.agents["a"].sessions.is_some()).await;
        // 等待启动时的主机指标采集落定
        sleep(Duration::from_millis(500)).await;

        // 首轮轮询已合并，之后 60 秒内没有新的数据
        let first = handle.snapshot().await.unwrap();
        let second = handle.snapshot().await.unwrap();
        assert_eq!(first, second);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_reload_emits_removal_and_connects_new_gateway() {
        let gateway = FakeGateway::start(Behavior::Normal).await;
        let other = FakeGateway::start(Behavior::Normal).await;
        let handle = spawn_collector(
            test_config(),
            vec![gateway.agent("a", TOKEN), gateway.agent("b", TOKEN)],
        );
        wait_for(&handle, |s| online(s, "a") && online(s, "b")).await;

        let mut events = handle.subscribe(&[EventType::Update]);
        handle
            .reload(vec![gateway.agent("a", TOKEN), other.agent("c", TOKEN)])
            .await
            .unwrap();

        let removal = timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(FleetEvent::Update {
                        id, removed: true, state,
                    }) => return (id, state),
                    Some(_) => continue,
                    None => panic!("subscription closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(removal.0, "b");
        assert!(removal.1.is_none());

        let snapshot = wait_for(&handle, |s| online(s, "c")).await;
        assert!(!snapshot.agents.contains_key("b"));
        assert!(online(&snapshot, "a"));
        assert_eq!(other.accepted(), 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_handle_errors_after_shutdown() {
        let handle = spawn_collector(test_config(), Vec::new());
        let mut events = handle.subscribe(&[EventType::Update]);
        handle.shutdown();

        let end = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert!(end.is_none());
        assert!(handle.snapshot().await.is_err());

        // 停止后的新订阅立即结束
        let mut late = handle.subscribe(&[EventType::Update, EventType::HostMetrics]);
        let end = timeout(Duration::from_secs(5), late.recv()).await.unwrap();
        assert!(end.is_none());
    }
}
