use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::events::{to_object, MonitorEvent};
use crate::error::Result;
use crate::runtime::{ExecutionState, ExecutionStep};

/// 客户端侧的执行视图
///
/// 事件可以重复或在重新同步后重放：步骤按序号去重，已结束的步骤不会被旧的 running 版本覆盖，
/// 执行状态只接受不低于当前 revision 的更新
#[derive(Clone, Debug, Default)]
pub struct ExecutionProjection {
    execution: Option<ExecutionState>,
    steps: BTreeMap<u64, ExecutionStep>,
}

impl ExecutionProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution(&self) -> Option<&ExecutionState> {
        self.execution.as_ref()
    }

    /// 按步骤序号排列
    pub fn steps(&self) -> Vec<&ExecutionStep> {
        self.steps.values().collect()
    }

    /// 应用一个事件，返回视图是否变化
    pub fn apply(&mut self, event: &MonitorEvent) -> Result<bool> {
        match event {
            MonitorEvent::Snapshot { execution, steps } => {
                let mut changed = self.accept_state(execution.clone());
                for step in steps {
                    changed |= self.accept_step(step);
                }
                Ok(changed)
            }
            MonitorEvent::Status {
                revision,
                status,
                current_node_id,
                wait_type,
                error,
                ..
            } => {
                let Some(state) = self.execution.as_mut() else {
                    return Ok(false);
                };
                if *revision < state.revision {
                    return Ok(false);
                }
                let changed = state.status != *status
                    || state.current_node_id != *current_node_id
                    || state.wait_type != *wait_type
                    || state.error != *error;
                state.status = *status;
                state.current_node_id = current_node_id.clone();
                state.wait_type = *wait_type;
                state.error = error.clone();
                Ok(changed)
            }
            MonitorEvent::Logs { steps, .. } => {
                let mut changed = false;
                for step in steps {
                    changed |= self.accept_step(step);
                }
                Ok(changed)
            }
            MonitorEvent::Execution {
                revision, patch, ..
            } => self.accept_patch(*revision, patch),
        }
    }

    fn accept_state(&mut self, next: ExecutionState) -> bool {
        match &self.execution {
            Some(current) if next.revision < current.revision => false,
            Some(current) if *current == next => false,
            _ => {
                self.execution = Some(next);
                true
            }
        }
    }

    fn accept_step(&mut self, step: &ExecutionStep) -> bool {
        match self.steps.get(&step.step) {
            Some(existing) if existing == step => false,
            Some(existing) if existing.status.is_final() && !step.status.is_final() => false,
            _ => {
                self.steps.insert(step.step, step.clone());
                true
            }
        }
    }

    fn accept_patch(&mut self, revision: u64, patch: &Map<String, Value>) -> Result<bool> {
        let mut fields = match &self.execution {
            Some(current) if revision < current.revision => return Ok(false),
            Some(current) => to_object(current)?,
            None => Map::new(),
        };
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }
        fields.insert("revision".into(), Value::from(revision));
        // 没有基线时只有完整的首个 patch 能构成状态
        let Ok(next) = serde_json::from_value::<ExecutionState>(Value::Object(fields)) else {
            return Ok(false);
        };
        Ok(self.accept_state(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowBuilder;
    use crate::runtime::{ExecutionStatus, SessionInfo, StepStatus};

    fn state() -> ExecutionState {
        let doc = FlowBuilder::new("projection")
            .start("start")
            .end("end")
            .connect("start", "end")
            .build_document("flow-1", "project-1");
        let mut state = ExecutionState::new("exec-1", &doc, "start", &SessionInfo::new("s1"));
        state.revision = 1;
        state
    }

    #[test]
    fn test_final_step_is_not_overwritten_by_replay() -> anyhow::Result<()> {
        let state = state();
        let doc = FlowBuilder::new("projection")
            .start("start")
            .build_document("flow-1", "project-1");
        let node = doc.node("start").cloned().ok_or_else(|| anyhow::anyhow!("missing node"))?;
        let mut running = ExecutionStep::running(&state, &node);
        running.step = 1;
        let mut done = running.clone();
        done.finish(StepStatus::Completed, None);

        let mut projection = ExecutionProjection::new();
        projection.apply(&MonitorEvent::Snapshot {
            execution: state.clone(),
            steps: vec![running.clone()],
        })?;
        assert!(projection.apply(&MonitorEvent::Logs {
            execution_id: state.id.clone(),
            steps: vec![done.clone()],
        })?);
        assert!(!projection.apply(&MonitorEvent::Logs {
            execution_id: state.id.clone(),
            steps: vec![running, done.clone()],
        })?);
        assert_eq!(projection.steps(), vec![&done]);
        Ok(())
    }

    #[test]
    fn test_stale_patch_is_ignored() -> anyhow::Result<()> {
        let mut state = state();
        let mut projection = ExecutionProjection::new();
        state.revision = 3;
        projection.apply(&MonitorEvent::Snapshot {
            execution: state.clone(),
            steps: Vec::new(),
        })?;

        let mut patch = Map::new();
        patch.insert("status".into(), serde_json::json!("completed"));
        assert!(!projection.apply(&MonitorEvent::Execution {
            execution_id: state.id.clone(),
            revision: 2,
            patch: patch.clone(),
        })?);
        assert!(projection.apply(&MonitorEvent::Execution {
            execution_id: state.id.clone(),
            revision: 4,
            patch,
        })?);
        let current = projection.execution().ok_or_else(|| anyhow::anyhow!("no state"))?;
        assert_eq!(current.status, ExecutionStatus::Completed);
        Ok(())
    }
}
