/// 快照订阅
///
/// 每次状态转换都会在驱动任务内同步地把新快照交给所有当前订阅者，不合并、不跳过。
use super::state::Snapshot;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

type Callback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// 订阅标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    callback: Callback,
}

/// 订阅者注册表与最新快照
pub struct ObserverHub {
    latest: RwLock<Snapshot>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl ObserverHub {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            latest: RwLock::new(initial),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 最新快照
    pub fn latest(&self) -> Snapshot {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 注册回调，从下一次状态变化开始接收
    pub fn subscribe(&self, callback: impl Fn(&Snapshot) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                active: Arc::new(AtomicBool::new(true)),
                callback: Arc::new(callback),
            });
        debug!("新增订阅: {:?}", id);
        id
    }

    /// 取消订阅；正在进行的投递中它也不会再被调用
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match subscribers.iter().position(|s| s.id == id) {
            Some(index) => {
                let removed = subscribers.remove(index);
                removed.active.store(false, Ordering::SeqCst);
                debug!("取消订阅: {:?}", id);
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 更新最新快照并投递给所有订阅者
    ///
    /// 回调执行时不持有任何锁，回调内可以订阅或取消订阅。
    pub fn publish(&self, snapshot: Snapshot) {
        *self
            .latest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot.clone();

        let targets: Vec<(Arc<AtomicBool>, Callback)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| (s.active.clone(), s.callback.clone()))
            .collect();

        for (active, callback) in targets {
            if active.load(Ordering::SeqCst) {
                callback(&snapshot);
            }
        }
    }

    /// 以 Stream 形式接收每一个快照
    pub fn stream(self: &Arc<Self>) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |snapshot| {
            let _ = tx.send(snapshot.clone());
        });
        SnapshotStream {
            rx,
            id,
            hub: Arc::downgrade(self),
        }
    }
}

/// 快照流，丢弃时自动取消订阅
pub struct SnapshotStream {
    rx: mpsc::UnboundedReceiver<Snapshot>,
    id: SubscriptionId,
    hub: std::sync::Weak<ObserverHub>,
}

impl Stream for SnapshotStream {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SnapshotStream {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::CallPhase;
    use futures_util::StreamExt;
    use std::sync::atomic::AtomicUsize;

    fn snapshot(revision: u64) -> Snapshot {
        Snapshot {
            revision,
            ..Snapshot::default()
        }
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let hub = ObserverHub::new(Snapshot::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            hub.subscribe(move |s| seen.lock().unwrap().push((tag, s.revision)));
        }

        hub.publish(snapshot(1));
        hub.publish(snapshot(2));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]
        );
        assert_eq!(hub.latest().revision, 2);
    }

    #[test]
    fn test_unsubscribe_during_delivery() {
        let hub = Arc::new(ObserverHub::new(Snapshot::default()));
        let count = Arc::new(AtomicUsize::new(0));

        // 第一个订阅者在回调里取消自己和第二个订阅者
        let victim = Arc::new(Mutex::new(None::<SubscriptionId>));
        let first = {
            let hub = hub.clone();
            let victim = victim.clone();
            let count = count.clone();
            let me = Arc::new(Mutex::new(None::<SubscriptionId>));
            let me_inner = me.clone();
            let id = hub.clone().subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *me_inner.lock().unwrap() {
                    hub.unsubscribe(id);
                }
                if let Some(id) = *victim.lock().unwrap() {
                    hub.unsubscribe(id);
                }
            });
            *me.lock().unwrap() = Some(id);
            id
        };
        let second = {
            let count = count.clone();
            hub.subscribe(move |_| {
                count.fetch_add(100, Ordering::SeqCst);
            })
        };
        let third = {
            let count = count.clone();
            hub.subscribe(move |_| {
                count.fetch_add(10, Ordering::SeqCst);
            })
        };
        *victim.lock().unwrap() = Some(second);

        hub.publish(snapshot(1));
        // 第二个被取消，第三个照常收到
        assert_eq!(count.load(Ordering::SeqCst), 11);
        assert_eq!(hub.subscriber_count(), 1);

        hub.publish(snapshot(2));
        assert_eq!(count.load(Ordering::SeqCst), 21);

        assert!(!hub.unsubscribe(first));
        assert!(hub.unsubscribe(third));
    }

    #[tokio::test]
    async fn test_stream_receives_every_snapshot() {
        let hub = Arc::new(ObserverHub::new(Snapshot::default()));
        let mut stream = hub.stream();

        hub.publish(Snapshot {
            revision: 1,
            call_phase: CallPhase::Ongoing,
            ..Snapshot::default()
        });
        hub.publish(snapshot(2));

        assert_eq!(stream.next().await.map(|s| s.call_phase), Some(CallPhase::Ongoing));
        assert_eq!(stream.next().await.map(|s| s.revision), Some(2));

        drop(stream);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
