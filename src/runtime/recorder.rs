use std::sync::Arc;

use super::store::ExecutionStore;
use super::types::{ExecutionState, ExecutionStep};
use crate::error::Result;
use crate::monitor::events::status_changed;
use crate::monitor::{EventHub, MonitorEvent};

/// 写入执行存储并向监控端发布事件
///
/// 步骤写入先进入缓冲区，攒够一批或状态写入前统一作为 `logs` 事件发出
pub(crate) struct Recorder {
    store: Arc<dyn ExecutionStore>,
    hub: EventHub,
    batch_size: usize,
    pending: Vec<ExecutionStep>,
    published: Option<ExecutionState>,
}

impl Recorder {
    pub fn new(store: Arc<dyn ExecutionStore>, hub: EventHub, batch_size: usize) -> Self {
        Self {
            store,
            hub,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            published: None,
        }
    }

    /// 以已存储的状态作为后续差异计算的基线
    pub fn with_baseline(mut self, state: &ExecutionState) -> Self {
        self.published = Some(state.clone());
        self
    }

    pub async fn insert(&mut self, state: &mut ExecutionState) -> Result<()> {
        let stored = self.store.insert(state.clone()).await?;
        self.announce(stored.clone())?;
        *state = stored;
        Ok(())
    }

    pub async fn save(&mut self, state: &mut ExecutionState) -> Result<()> {
        self.flush();
        let stored = self.store.save(state.clone()).await?;
        self.announce(stored.clone())?;
        *state = stored;
        Ok(())
    }

    /// 发布一个由其他路径写入的状态（例如取消）
    pub fn announce(&mut self, stored: ExecutionState) -> Result<()> {
        let previous = self.published.as_ref();
        let patch = MonitorEvent::patch_between(previous, &stored)?;
        if status_changed(previous, &stored) {
            self.hub.publish(MonitorEvent::status_of(&stored));
        }
        if let Some(patch) = patch {
            self.hub.publish(patch);
        }
        self.published = Some(stored);
        Ok(())
    }

    /// 追加步骤，分配下一个序号
    pub async fn append(
        &mut self,
        state: &mut ExecutionState,
        mut step: ExecutionStep,
    ) -> Result<ExecutionStep> {
        step.step = state.step_count + 1;
        let stored = self.store.append_step(step).await?;
        state.step_count = stored.step;
        self.buffer(stored.clone());
        Ok(stored)
    }

    pub async fn update(&mut self, step: &ExecutionStep) -> Result<()> {
        let stored = self.store.update_step(step.clone()).await?;
        self.buffer(stored);
        Ok(())
    }

    /// 把其他路径已经写入的步骤放进下一批日志
    pub fn record(&mut self, steps: Vec<ExecutionStep>) {
        for step in steps {
            self.buffer(step);
        }
    }

    fn buffer(&mut self, step: ExecutionStep) {
        self.pending.push(step);
        if self.pending.len() >= self.batch_size {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let steps = std::mem::take(&mut self.pending);
        let execution_id = steps[0].execution_id.clone();
        self.hub.publish(MonitorEvent::Logs {
            execution_id,
            steps,
        });
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.flush();
    }
}
