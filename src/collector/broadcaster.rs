//! 事件广播器
//!
//! 维护订阅列表，将状态变化推送给订阅者。
//! 每个订阅者一个有界通道，推送为 fire-and-forget，不缓存、不重放。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{EventType, FleetEvent};

/// 订阅者 ID
pub type ConnId = u64;

/// 事件发送通道
pub type EventSender = mpsc::Sender<FleetEvent>;

/// 事件广播器
pub struct Broadcaster {
    /// 订阅关系：ConnId → 订阅的事件类型
    subscriptions: RwLock<HashMap<ConnId, HashSet<EventType>>>,
    /// 发送通道：ConnId → 发送通道
    senders: RwLock<HashMap<ConnId, EventSender>>,
    /// 下一个订阅者 ID
    next_conn_id: RwLock<ConnId>,
    /// 每个订阅者的通道容量
    buffer: usize,
    /// close_all 之后不再接受订阅
    closed: AtomicBool,
}

impl Broadcaster {
    /// 创建新的广播器
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
            next_conn_id: RwLock::new(1),
            buffer: buffer.max(1),
            closed: AtomicBool::new(false),
        })
    }

    /// 注册新订阅者，返回订阅者 ID；广播器已关闭时返回 None
    pub fn register(&self, sender: EventSender) -> Option<ConnId> {
        // 加锁顺序与 broadcast 一致：subscriptions → senders
        let mut subscriptions = self.subscriptions.write();
        let mut senders = self.senders.write();
        if self.is_closed() {
            return None;
        }
        let mut next_id = self.next_conn_id.write();
        let conn_id = *next_id;
        *next_id += 1;

        senders.insert(conn_id, sender);
        subscriptions.insert(conn_id, HashSet::new());

        tracing::debug!("📡 Subscriber registered: conn_id={}", conn_id);
        Some(conn_id)
    }

    /// 注销订阅者
    pub fn unregister(&self, conn_id: ConnId) {
        self.senders.write().remove(&conn_id);
        self.subscriptions.write().remove(&conn_id);
        tracing::debug!("📡 Subscriber unregistered: conn_id={}", conn_id);
    }

    /// 订阅事件
    pub fn subscribe(&self, conn_id: ConnId, events: &[EventType]) {
        if let Some(sub) = self.subscriptions.write().get_mut(&conn_id) {
            sub.extend(events.iter().copied());
            tracing::debug!("📡 Subscribed: conn_id={}, events={:?}", conn_id, events);
        }
    }

    /// 取消订阅
    pub fn unsubscribe(&self, conn_id: ConnId, events: &[EventType]) {
        if let Some(sub) = self.subscriptions.write().get_mut(&conn_id) {
            for event in events {
                sub.remove(event);
            }
            tracing::debug!("📡 Unsubscribed: conn_id={}, events={:?}", conn_id, events);
        }
    }

    /// 创建订阅（注册 + 订阅），drop 时自动注销
    ///
    /// 广播器已关闭时返回的订阅立即结束（`recv` 返回 None）。
    pub fn open(self: &Arc<Self>, events: &[EventType]) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        // 关闭后 tx 随 register 返回被 drop，通道立即结束
        let conn_id = match self.register(tx) {
            Some(conn_id) => {
                self.subscribe(conn_id, events);
                conn_id
            }
            None => 0,
        };
        Subscription {
            conn_id,
            rx,
            broadcaster: Arc::clone(self),
        }
    }

    /// 广播事件给所有订阅者（非阻塞，fire-and-forget）
    pub fn broadcast(&self, event: FleetEvent) {
        let event_type = event.event_type();

        // 获取需要推送的订阅者
        let targets: Vec<(ConnId, EventSender)> = {
            let subs = self.subscriptions.read();
            let senders = self.senders.read();

            subs.iter()
                .filter(|(_, subscribed)| subscribed.contains(&event_type))
                .filter_map(|(conn_id, _)| senders.get(conn_id).map(|s| (*conn_id, s.clone())))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: event_type={:?}", event_type);
            return;
        }

        tracing::trace!(
            "📡 Broadcasting event: event_type={:?}, subscribers={}",
            event_type,
            targets.len()
        );

        for (conn_id, sender) in targets {
            if let Err(e) = sender.try_send(event.clone()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::warn!("📡 Channel full, dropping event: conn_id={}", conn_id);
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        tracing::debug!("📡 Channel closed: conn_id={}", conn_id);
                    }
                }
            }
        }
    }

    /// 关闭所有订阅通道（Collector 停止时调用，订阅者的 recv 随之返回 None）
    pub fn close_all(&self) {
        let mut subscriptions = self.subscriptions.write();
        let mut senders = self.senders.write();
        self.closed.store(true, Ordering::SeqCst);
        senders.clear();
        subscriptions.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 获取当前订阅者数
    pub fn connection_count(&self) -> usize {
        self.senders.read().len()
    }

    /// 检查是否有订阅者
    pub fn has_connections(&self) -> bool {
        !self.senders.read().is_empty()
    }
}

/// 订阅句柄
pub struct Subscription {
    conn_id: ConnId,
    rx: mpsc::Receiver<FleetEvent>,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// 等待下一个事件；Collector 停止后返回 None
    pub async fn recv(&mut self) -> Option<FleetEvent> {
        self.rx.recv().await
    }

    /// 非阻塞读取
    pub fn try_recv(&mut self) -> Option<FleetEvent> {
        self.rx.try_recv().ok()
    }

    /// 追加订阅的事件类型
    pub fn subscribe(&self, events: &[EventType]) {
        self.broadcaster.subscribe(self.conn_id, events);
    }

    /// 取消订阅的事件类型
    pub fn unsubscribe(&self, events: &[EventType]) {
        self.broadcaster.unsubscribe(self.conn_id, events);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unregister(self.conn_id);
    }
}
