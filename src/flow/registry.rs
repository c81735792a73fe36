use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{BotFlowError, Result};
use crate::flow::types::{FlowDocument, FlowDraft};
use crate::flow::validation::validate_graph;

/// Flow 列表摘要
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow_id: String,
    pub project_id: String,
    pub name: String,
    pub latest_version: u32,
    pub live_version: Option<u32>,
}

struct FlowEntry {
    project_id: String,
    versions: Vec<Arc<FlowDocument>>,
    live: Option<u32>,
    deleted: bool,
}

impl FlowEntry {
    fn latest(&self) -> Option<&Arc<FlowDocument>> {
        self.versions.last()
    }

    fn version(&self, version: u32) -> Option<&Arc<FlowDocument>> {
        self.versions.iter().find(|doc| doc.version == version)
    }
}

/// Flow 文档存储
///
/// 每次保存都产生新版本，已有版本永不修改；删除只会把 flow 从列表和
/// 自动触发中移除，已绑定到旧版本的执行仍能读取它
#[derive(Default)]
pub struct FlowStore {
    flows: RwLock<HashMap<String, FlowEntry>>,
}

impl FlowStore {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
        }
    }

    pub fn create(&self, project_id: &str, draft: FlowDraft) -> Result<Arc<FlowDocument>> {
        self.create_with_id(&Uuid::new_v4().to_string(), project_id, draft)
    }

    pub fn create_with_id(
        &self,
        flow_id: &str,
        project_id: &str,
        draft: FlowDraft,
    ) -> Result<Arc<FlowDocument>> {
        let mut flows = self.flows.write();
        if flows.contains_key(flow_id) {
            return Err(BotFlowError::Store(format!("flow `{flow_id}` already exists")));
        }
        let doc = Arc::new(FlowDocument::from_draft(flow_id, project_id, 1, draft));
        flows.insert(
            flow_id.to_string(),
            FlowEntry {
                project_id: project_id.to_string(),
                versions: vec![Arc::clone(&doc)],
                live: None,
                deleted: false,
            },
        );
        info!(flow_id, project_id, "flow created");
        Ok(doc)
    }

    /// 保存编辑结果为新版本
    pub fn update(&self, flow_id: &str, draft: FlowDraft) -> Result<Arc<FlowDocument>> {
        let mut flows = self.flows.write();
        let entry = flows
            .get_mut(flow_id)
            .filter(|entry| !entry.deleted)
            .ok_or_else(|| BotFlowError::FlowNotFound(flow_id.to_string()))?;
        let version = entry.latest().map(|doc| doc.version + 1).unwrap_or(1);
        let doc = Arc::new(FlowDocument::from_draft(
            flow_id,
            entry.project_id.clone(),
            version,
            draft,
        ));
        entry.versions.push(Arc::clone(&doc));
        info!(flow_id, version, "flow version saved");
        Ok(doc)
    }

    pub fn get(&self, flow_id: &str, version: u32) -> Result<Arc<FlowDocument>> {
        let flows = self.flows.read();
        let entry = flows
            .get(flow_id)
            .ok_or_else(|| BotFlowError::FlowNotFound(flow_id.to_string()))?;
        entry
            .version(version)
            .cloned()
            .ok_or_else(|| BotFlowError::FlowVersionNotFound {
                flow_id: flow_id.to_string(),
                version,
            })
    }

    pub fn latest(&self, flow_id: &str) -> Result<Arc<FlowDocument>> {
        let flows = self.flows.read();
        flows
            .get(flow_id)
            .filter(|entry| !entry.deleted)
            .and_then(|entry| entry.latest().cloned())
            .ok_or_else(|| BotFlowError::FlowNotFound(flow_id.to_string()))
    }

    pub fn versions(&self, flow_id: &str) -> Result<Vec<u32>> {
        let flows = self.flows.read();
        let entry = flows
            .get(flow_id)
            .ok_or_else(|| BotFlowError::FlowNotFound(flow_id.to_string()))?;
        Ok(entry.versions.iter().map(|doc| doc.version).collect())
    }

    pub fn list(&self, project_id: &str) -> Vec<FlowSummary> {
        let flows = self.flows.read();
        let mut summaries: Vec<FlowSummary> = flows
            .iter()
            .filter(|(_, entry)| !entry.deleted && entry.project_id == project_id)
            .filter_map(|(flow_id, entry)| {
                entry.latest().map(|doc| FlowSummary {
                    flow_id: flow_id.clone(),
                    project_id: entry.project_id.clone(),
                    name: doc.name.clone(),
                    latest_version: doc.version,
                    live_version: entry.live,
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then(a.flow_id.cmp(&b.flow_id)));
        summaries
    }

    pub fn delete(&self, flow_id: &str) -> Result<()> {
        let mut flows = self.flows.write();
        let entry = flows
            .get_mut(flow_id)
            .filter(|entry| !entry.deleted)
            .ok_or_else(|| BotFlowError::FlowNotFound(flow_id.to_string()))?;
        entry.deleted = true;
        entry.live = None;
        info!(flow_id, "flow deleted");
        Ok(())
    }

    /// 校验并发布指定版本；同一项目只允许一个 live flow
    pub fn publish(&self, flow_id: &str, version: u32) -> Result<Arc<FlowDocument>> {
        let mut flows = self.flows.write();
        let (project_id, doc) = {
            let entry = flows
                .get(flow_id)
                .filter(|entry| !entry.deleted)
                .ok_or_else(|| BotFlowError::FlowNotFound(flow_id.to_string()))?;
            let doc = entry
                .version(version)
                .cloned()
                .ok_or_else(|| BotFlowError::FlowVersionNotFound {
                    flow_id: flow_id.to_string(),
                    version,
                })?;
            (entry.project_id.clone(), doc)
        };

        validate_graph(&doc)?;

        for (id, entry) in flows.iter_mut() {
            if entry.project_id == project_id {
                entry.live = if id == flow_id { Some(version) } else { None };
            }
        }
        info!(flow_id, version, project_id = %project_id, "flow published");
        Ok(doc)
    }

    pub fn unpublish(&self, flow_id: &str) -> Result<()> {
        let mut flows = self.flows.write();
        let entry = flows
            .get_mut(flow_id)
            .ok_or_else(|| BotFlowError::FlowNotFound(flow_id.to_string()))?;
        entry.live = None;
        Ok(())
    }

    pub fn live(&self, flow_id: &str) -> Result<Arc<FlowDocument>> {
        let flows = self.flows.read();
        let entry = flows
            .get(flow_id)
            .filter(|entry| !entry.deleted)
            .ok_or_else(|| BotFlowError::FlowNotFound(flow_id.to_string()))?;
        entry
            .live
            .and_then(|version| entry.version(version).cloned())
            .ok_or_else(|| BotFlowError::FlowNotPublished(flow_id.to_string()))
    }

    pub fn live_version(&self, flow_id: &str) -> Option<u32> {
        self.flows
            .read()
            .get(flow_id)
            .filter(|entry| !entry.deleted)
            .and_then(|entry| entry.live)
    }

    pub fn active_for_project(&self, project_id: &str) -> Option<Arc<FlowDocument>> {
        let flows = self.flows.read();
        flows
            .values()
            .filter(|entry| !entry.deleted && entry.project_id == project_id)
            .find_map(|entry| entry.live.and_then(|version| entry.version(version).cloned()))
    }
}
