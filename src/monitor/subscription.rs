use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use super::events::MonitorEvent;
use super::hub::EventHub;
use crate::error::Result;
use crate::runtime::ExecutionStore;

/// 单个执行的事件订阅
///
/// 先返回快照，再按顺序返回增量事件。订阅先于快照建立，快照之后到达的事件可能与快照重复，
/// 由客户端去重。落后于广播缓冲区时重新发送一份快照
pub struct ExecutionSubscription {
    execution_id: String,
    store: Arc<dyn ExecutionStore>,
    receiver: broadcast::Receiver<MonitorEvent>,
    pending_snapshot: Option<MonitorEvent>,
}

impl ExecutionSubscription {
    pub async fn open(
        hub: &EventHub,
        store: Arc<dyn ExecutionStore>,
        execution_id: &str,
    ) -> Result<Self> {
        let receiver = hub.subscribe(execution_id);
        let snapshot = snapshot(store.as_ref(), execution_id).await?;
        Ok(Self {
            execution_id: execution_id.to_string(),
            store,
            receiver,
            pending_snapshot: Some(snapshot),
        })
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// 下一个事件；事件中心关闭时返回 None
    pub async fn next_event(&mut self) -> Option<MonitorEvent> {
        if let Some(snapshot) = self.pending_snapshot.take() {
            return Some(snapshot);
        }
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    execution_id = %self.execution_id,
                    skipped,
                    "monitor subscriber lagged, resending snapshot"
                );
                match snapshot(self.store.as_ref(), &self.execution_id).await {
                    Ok(event) => Some(event),
                    Err(error) => {
                        warn!(execution_id = %self.execution_id, %error, "snapshot reload failed");
                        None
                    }
                }
            }
            Err(RecvError::Closed) => None,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = MonitorEvent> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .next_event()
                .await
                .map(|event| (event, subscription))
        })
    }
}

async fn snapshot(store: &dyn ExecutionStore, execution_id: &str) -> Result<MonitorEvent> {
    let execution = store.get(execution_id).await?;
    let steps = store.steps(execution_id).await?;
    Ok(MonitorEvent::Snapshot { execution, steps })
}
