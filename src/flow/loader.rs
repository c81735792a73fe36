use std::path::Path;

use serde_json::Value;

use crate::error::{BotFlowError, Result};
use crate::flow::types::{FlowDocument, FlowDraft};

/// 从 JSON 字符串加载编辑器保存的图
///
/// 同时接受完整的 `FlowDocument` 和只有 `{nodes, connections, ...}` 的草稿
pub fn load_draft_from_str(json: &str) -> Result<FlowDraft> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| BotFlowError::Config(format!("failed to parse flow json: {e}")))?;
    load_draft_from_value(value)
}

pub fn load_draft_from_value(value: Value) -> Result<FlowDraft> {
    if value.get("flow_id").is_some() && value.get("version").is_some() {
        let doc: FlowDocument = serde_json::from_value(value)
            .map_err(|e| BotFlowError::Config(format!("failed to parse flow document: {e}")))?;
        return Ok(doc.to_draft());
    }
    let mut value = value;
    if let Value::Object(map) = &mut value {
        map.entry("name")
            .or_insert_with(|| Value::String("untitled".to_string()));
    }
    serde_json::from_value(value)
        .map_err(|e| BotFlowError::Config(format!("failed to parse flow draft: {e}")))
}

pub fn load_draft_from_file(path: impl AsRef<Path>) -> Result<FlowDraft> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| BotFlowError::Config(format!("failed to read {}: {e}", path.display())))?;
    load_draft_from_str(&content)
}
