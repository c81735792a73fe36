use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::types::{ExecutionState, ExecutionStatus, ExecutionStep, StepStatus};
use crate::error::{BotFlowError, Result};

/// 执行列表过滤条件
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub flow_id: Option<String>,
    /// 在 id、flow、session、user、当前节点和错误信息中做不区分大小写的子串匹配
    pub search: Option<String>,
    /// 从 1 开始
    pub page: usize,
    pub per_page: usize,
}

impl Default for ExecutionFilter {
    fn default() -> Self {
        Self {
            status: None,
            flow_id: None,
            search: None,
            page: 1,
            per_page: 20,
        }
    }
}

impl ExecutionFilter {
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_flow(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = Some(flow_id.into());
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_page(mut self, page: usize, per_page: usize) -> Self {
        self.page = page.max(1);
        self.per_page = per_page.max(1);
        self
    }

    fn matches(&self, state: &ExecutionState) -> bool {
        if self.status.is_some_and(|status| status != state.status) {
            return false;
        }
        if self.flow_id.as_deref().is_some_and(|flow| flow != state.flow_id) {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(needle) => {
                let needle = needle.to_lowercase();
                [
                    Some(state.id.as_str()),
                    Some(state.flow_id.as_str()),
                    Some(state.session_id.as_str()),
                    state.user_id.as_deref(),
                    Some(state.current_node_id.as_str()),
                    state.error.as_deref(),
                ]
                .into_iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(&needle))
            }
        }
    }
}

/// 分页结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPage {
    pub items: Vec<ExecutionState>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

/// 执行记录存储
///
/// 实现必须保证：终态的执行在同一个 run 内拒绝任何写入（取消可以抢占进行中的推进），
/// `save` 只接受 `revision` 与存储一致的状态，步骤序号严格按 `last + 1` 追加，终态步骤不可修改
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, state: ExecutionState) -> Result<ExecutionState>;
    /// 写入状态并递增 revision，返回存储后的状态
    async fn save(&self, state: ExecutionState) -> Result<ExecutionState>;
    async fn get(&self, id: &str) -> Result<ExecutionState>;
    async fn list(&self, filter: &ExecutionFilter) -> Result<ExecutionPage>;
    /// 原子地把非终态执行标记为 cancelled，返回最新状态以及是否发生了变化
    async fn mark_cancelled(&self, id: &str) -> Result<(ExecutionState, bool)>;
    async fn append_step(&self, step: ExecutionStep) -> Result<ExecutionStep>;
    async fn update_step(&self, step: ExecutionStep) -> Result<ExecutionStep>;
    async fn steps(&self, id: &str) -> Result<Vec<ExecutionStep>>;
    /// 关闭当前 run 中所有未结束的步骤
    async fn close_open_steps(
        &self,
        id: &str,
        status: StepStatus,
        message: &str,
    ) -> Result<Vec<ExecutionStep>>;
    /// 归档一次 run 的最终状态
    async fn archive_run(&self, state: &ExecutionState) -> Result<()>;
    async fn runs(&self, id: &str) -> Result<Vec<ExecutionState>>;
    /// 某个会话在某个 flow 上尚未结束的执行
    async fn find_open(&self, flow_id: &str, session_id: &str) -> Result<Option<ExecutionState>>;
    async fn waiting(&self) -> Result<Vec<ExecutionState>>;
}

#[derive(Default)]
struct Inner {
    states: HashMap<String, ExecutionState>,
    steps: HashMap<String, Vec<ExecutionStep>>,
    runs: HashMap<String, Vec<ExecutionState>>,
}

/// 内存执行存储
#[derive(Default)]
pub struct MemoryExecutionStore {
    inner: RwLock<Inner>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn closed(state: &ExecutionState) -> BotFlowError {
    BotFlowError::ExecutionClosed {
        id: state.id.clone(),
        status: state.status.to_string(),
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, mut state: ExecutionState) -> Result<ExecutionState> {
        let mut inner = self.inner.write();
        if inner.states.contains_key(&state.id) {
            return Err(BotFlowError::Store(format!(
                "execution `{}` already exists",
                state.id
            )));
        }
        state.revision = 1;
        state.updated_at = Utc::now();
        inner.steps.entry(state.id.clone()).or_default();
        inner.states.insert(state.id.clone(), state.clone());
        Ok(state)
    }

    async fn save(&self, mut state: ExecutionState) -> Result<ExecutionState> {
        let mut inner = self.inner.write();
        let stored = inner
            .states
            .get(&state.id)
            .ok_or_else(|| BotFlowError::ExecutionNotFound(state.id.clone()))?;
        if state.run < stored.run || (stored.is_terminal() && state.run == stored.run) {
            return Err(closed(stored));
        }
        // 基于过期副本的写入：期间有取消等其他写入落地
        if state.revision != stored.revision {
            if stored.is_terminal() {
                return Err(closed(stored));
            }
            return Err(BotFlowError::InvalidTransition {
                from: format!("revision {}", stored.revision),
                to: format!("stale revision {}", state.revision),
            });
        }
        state.revision = stored.revision + 1;
        state.updated_at = Utc::now();
        inner.states.insert(state.id.clone(), state.clone());
        Ok(state)
    }

    async fn get(&self, id: &str) -> Result<ExecutionState> {
        self.inner
            .read()
            .states
            .get(id)
            .cloned()
            .ok_or_else(|| BotFlowError::ExecutionNotFound(id.to_string()))
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<ExecutionPage> {
        let inner = self.inner.read();
        let mut matched: Vec<&ExecutionState> = inner
            .states
            .values()
            .filter(|state| filter.matches(state))
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));

        let page = filter.page.max(1);
        let per_page = filter.per_page.max(1);
        let items = matched
            .iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .map(|state| (*state).clone())
            .collect();
        Ok(ExecutionPage {
            items,
            total: matched.len(),
            page,
            per_page,
        })
    }

    async fn mark_cancelled(&self, id: &str) -> Result<(ExecutionState, bool)> {
        let mut inner = self.inner.write();
        let state = inner
            .states
            .get_mut(id)
            .ok_or_else(|| BotFlowError::ExecutionNotFound(id.to_string()))?;
        if state.is_terminal() {
            return Ok((state.clone(), false));
        }
        let now = Utc::now();
        state.status = ExecutionStatus::Cancelled;
        state.clear_wait();
        state.finished_at = Some(now);
        state.updated_at = now;
        state.revision += 1;
        Ok((state.clone(), true))
    }

    async fn append_step(&self, step: ExecutionStep) -> Result<ExecutionStep> {
        let mut inner = self.inner.write();
        let state = inner
            .states
            .get(&step.execution_id)
            .ok_or_else(|| BotFlowError::ExecutionNotFound(step.execution_id.clone()))?;
        if state.is_terminal() && state.run == step.run {
            return Err(closed(state));
        }
        let steps = inner.steps.entry(step.execution_id.clone()).or_default();
        let expected = steps.last().map(|last| last.step + 1).unwrap_or(1);
        if step.step != expected {
            return Err(BotFlowError::Concurrency(format!(
                "{}: expected step {expected}, got {}",
                step.execution_id, step.step
            )));
        }
        steps.push(step.clone());
        Ok(step)
    }

    async fn update_step(&self, step: ExecutionStep) -> Result<ExecutionStep> {
        let mut inner = self.inner.write();
        let steps = inner
            .steps
            .get_mut(&step.execution_id)
            .ok_or_else(|| BotFlowError::ExecutionNotFound(step.execution_id.clone()))?;
        let existing = steps
            .iter_mut()
            .find(|existing| existing.step == step.step)
            .ok_or_else(|| {
                BotFlowError::Store(format!(
                    "execution `{}` has no step {}",
                    step.execution_id, step.step
                ))
            })?;
        if existing.status.is_final() {
            return Err(BotFlowError::InvalidTransition {
                from: format!("step {} {:?}", existing.step, existing.status).to_lowercase(),
                to: format!("{:?}", step.status).to_lowercase(),
            });
        }
        *existing = step.clone();
        Ok(step)
    }

    async fn steps(&self, id: &str) -> Result<Vec<ExecutionStep>> {
        self.inner
            .read()
            .steps
            .get(id)
            .cloned()
            .ok_or_else(|| BotFlowError::ExecutionNotFound(id.to_string()))
    }

    async fn close_open_steps(
        &self,
        id: &str,
        status: StepStatus,
        message: &str,
    ) -> Result<Vec<ExecutionStep>> {
        let mut inner = self.inner.write();
        let steps = inner
            .steps
            .get_mut(id)
            .ok_or_else(|| BotFlowError::ExecutionNotFound(id.to_string()))?;
        let mut closed_steps = Vec::new();
        for step in steps.iter_mut().filter(|step| !step.status.is_final()) {
            step.finish(status, Some(message.to_string()));
            closed_steps.push(step.clone());
        }
        Ok(closed_steps)
    }

    async fn archive_run(&self, state: &ExecutionState) -> Result<()> {
        self.inner
            .write()
            .runs
            .entry(state.id.clone())
            .or_default()
            .push(state.clone());
        Ok(())
    }

    async fn runs(&self, id: &str) -> Result<Vec<ExecutionState>> {
        let inner = self.inner.read();
        if !inner.states.contains_key(id) {
            return Err(BotFlowError::ExecutionNotFound(id.to_string()));
        }
        Ok(inner.runs.get(id).cloned().unwrap_or_default())
    }

    async fn find_open(&self, flow_id: &str, session_id: &str) -> Result<Option<ExecutionState>> {
        Ok(self
            .inner
            .read()
            .states
            .values()
            .filter(|state| {
                state.flow_id == flow_id && state.session_id == session_id && !state.is_terminal()
            })
            .max_by(|a, b| a.started_at.cmp(&b.started_at))
            .cloned())
    }

    async fn waiting(&self) -> Result<Vec<ExecutionState>> {
        Ok(self
            .inner
            .read()
            .states
            .values()
            .filter(|state| state.status == ExecutionStatus::Waiting)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowBuilder, Node, NodeConfig};
    use crate::runtime::types::SessionInfo;

    fn state(id: &str) -> ExecutionState {
        let doc = FlowBuilder::new("t")
            .start("start")
            .end("done")
            .connect("start", "done")
            .build_document("flow-1", "project-1");
        ExecutionState::new(id, &doc, "start", &SessionInfo::new("chat-1"))
    }

    fn step(state: &ExecutionState, n: u64) -> ExecutionStep {
        let mut step = ExecutionStep::running(state, &Node::new("start", NodeConfig::End));
        step.step = n;
        step
    }

    #[tokio::test]
    async fn test_revision_increments_and_terminal_guard() {
        let store = MemoryExecutionStore::new();
        let mut current = store.insert(state("e1")).await.unwrap();
        assert_eq!(current.revision, 1);

        current.status = ExecutionStatus::Completed;
        let current = store.save(current).await.unwrap();
        assert_eq!(current.revision, 2);

        let mut late = current.clone();
        late.status = ExecutionStatus::Running;
        assert!(matches!(
            store.save(late).await,
            Err(BotFlowError::ExecutionClosed { .. })
        ));

        let mut next_run = current;
        next_run.run = 2;
        next_run.status = ExecutionStatus::Running;
        assert_eq!(store.save(next_run).await.unwrap().revision, 3);
    }

    #[tokio::test]
    async fn test_save_rejects_copy_older_than_cancel() {
        let store = MemoryExecutionStore::new();
        let current = store.insert(state("e1")).await.unwrap();

        let (cancelled, changed) = store.mark_cancelled("e1").await.unwrap();
        assert!(changed);
        assert_eq!(cancelled.revision, 2);

        // 下一轮 run 的写入基于取消之前读到的副本
        let mut restarted = current.clone();
        restarted.run = 2;
        restarted.status = ExecutionStatus::Running;
        assert!(matches!(
            store.save(restarted).await,
            Err(BotFlowError::ExecutionClosed { .. })
        ));
        assert_eq!(store.get("e1").await.unwrap().status, ExecutionStatus::Cancelled);

        let other = store.insert(state("e2")).await.unwrap();
        let fresh = store.save(other.clone()).await.unwrap();
        assert_eq!(fresh.revision, 2);
        assert!(matches!(
            store.save(other).await,
            Err(BotFlowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_steps_must_be_contiguous() {
        let store = MemoryExecutionStore::new();
        let current = store.insert(state("e1")).await.unwrap();
        store.append_step(step(&current, 1)).await.unwrap();
        assert!(matches!(
            store.append_step(step(&current, 3)).await,
            Err(BotFlowError::Concurrency(_))
        ));
        store.append_step(step(&current, 2)).await.unwrap();

        let mut finished = step(&current, 2);
        finished.finish(StepStatus::Completed, None);
        store.update_step(finished.clone()).await.unwrap();
        assert!(store.update_step(finished).await.is_err());
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let store = MemoryExecutionStore::new();
        for i in 0..5 {
            let mut s = state(&format!("e{i}"));
            if i % 2 == 0 {
                s.status = ExecutionStatus::Waiting;
            }
            store.insert(s).await.unwrap();
        }
        let waiting = store
            .list(&ExecutionFilter::default().with_status(ExecutionStatus::Waiting))
            .await
            .unwrap();
        assert_eq!(waiting.total, 3);

        let page = store
            .list(&ExecutionFilter::default().with_page(2, 2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);

        let search = store
            .list(&ExecutionFilter::default().with_search("E3"))
            .await
            .unwrap();
        assert_eq!(search.items.len(), 1);
        assert_eq!(search.items[0].id, "e3");
    }
}
