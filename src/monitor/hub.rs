use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use super::events::MonitorEvent;

struct HubInner {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<MonitorEvent>>>,
    all: broadcast::Sender<MonitorEvent>,
}

/// 事件分发中心
///
/// 每个执行一条 broadcast 通道，外加一条全局通道。没有订阅者的执行通道在下一次发布时回收
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(HubInner {
                capacity,
                channels: RwLock::new(HashMap::new()),
                all,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// 订阅单个执行
    pub fn subscribe(&self, execution_id: &str) -> broadcast::Receiver<MonitorEvent> {
        if let Some(sender) = self.inner.channels.read().get(execution_id) {
            return sender.subscribe();
        }
        self.inner
            .channels
            .write()
            .entry(execution_id.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe()
    }

    /// 订阅所有执行的事件
    pub fn subscribe_all(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.all.subscribe()
    }

    pub fn subscriber_count(&self, execution_id: &str) -> usize {
        self.inner
            .channels
            .read()
            .get(execution_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn publish(&self, event: MonitorEvent) {
        trace!(
            execution_id = event.execution_id(),
            kind = event.kind(),
            "publishing monitor event"
        );
        let execution_id = event.execution_id().to_string();
        let mut orphaned = false;
        if let Some(sender) = self.inner.channels.read().get(&execution_id) {
            orphaned = sender.send(event.clone()).is_err();
        }
        if orphaned {
            let mut channels = self.inner.channels.write();
            if channels
                .get(&execution_id)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                channels.remove(&execution_id);
            }
        }
        let _ = self.inner.all.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs(id: &str) -> MonitorEvent {
        MonitorEvent::Logs {
            execution_id: id.to_string(),
            steps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_routes_by_execution() {
        let hub = EventHub::new(8);
        let mut first = hub.subscribe("e1");
        let mut all = hub.subscribe_all();

        hub.publish(logs("e2"));
        hub.publish(logs("e1"));

        assert_eq!(first.recv().await.unwrap().execution_id(), "e1");
        assert_eq!(all.recv().await.unwrap().execution_id(), "e2");
        assert_eq!(all.recv().await.unwrap().execution_id(), "e1");
    }

    #[tokio::test]
    async fn test_orphaned_channel_is_dropped() {
        let hub = EventHub::new(8);
        let receiver = hub.subscribe("e1");
        assert_eq!(hub.subscriber_count("e1"), 1);
        drop(receiver);
        hub.publish(logs("e1"));
        assert_eq!(hub.subscriber_count("e1"), 0);
        assert!(hub.inner.channels.read().is_empty());
    }
}
