use std::collections::HashSet;

use regex::Regex;

use crate::error::GraphError;
use crate::flow::nodes::{CallbackMatch, InputRule, MiddlewareKind, NodeConfig, NodeType};
use crate::flow::types::{ConnectionKind, FlowDocument};

/// 校验 Flow 图结构
///
/// 收集所有问题一次性返回，空列表表示图可以发布
pub fn validate_graph(doc: &FlowDocument) -> Result<(), GraphError> {
    let mut problems = Vec::new();

    if doc.nodes.is_empty() {
        problems.push("flow has no nodes".to_string());
        return Err(GraphError::new(problems));
    }

    let mut node_ids = HashSet::new();
    for node in &doc.nodes {
        if node.id.trim().is_empty() {
            problems.push("node with empty id".to_string());
        }
        if !node_ids.insert(node.id.as_str()) {
            problems.push(format!("duplicate node id `{}`", node.id));
        }
    }

    let mut connection_ids = HashSet::new();
    for connection in &doc.connections {
        if !connection_ids.insert(connection.id.as_str()) {
            problems.push(format!("duplicate connection id `{}`", connection.id));
        }
        if !node_ids.contains(connection.source.as_str()) {
            problems.push(format!(
                "connection `{}` references unknown source `{}`",
                connection.id, connection.source
            ));
        }
        if !node_ids.contains(connection.target.as_str()) {
            problems.push(format!(
                "connection `{}` references unknown target `{}`",
                connection.id, connection.target
            ));
        }
    }

    let starts: Vec<_> = doc
        .nodes
        .iter()
        .filter(|node| node.node_type() == NodeType::Start)
        .collect();
    match starts.len() {
        0 => problems.push("flow has no start node".to_string()),
        1 => {
            if doc.incoming(&starts[0].id).next().is_some() {
                problems.push(format!(
                    "start node `{}` must not have incoming connections",
                    starts[0].id
                ));
            }
        }
        n => problems.push(format!("flow has {n} start nodes, expected exactly one")),
    }

    for node in &doc.nodes {
        let count = |kind: ConnectionKind| {
            doc.outgoing(&node.id)
                .filter(|connection| connection.effective_kind() == kind)
                .count()
        };
        match &node.config {
            NodeConfig::End => {
                if doc.outgoing(&node.id).next().is_some() {
                    problems.push(format!(
                        "end node `{}` must not have outgoing connections",
                        node.id
                    ));
                }
            }
            NodeConfig::Condition(_) => {
                let (t, f) = (count(ConnectionKind::True), count(ConnectionKind::False));
                if t != 1 || f != 1 {
                    problems.push(format!(
                        "condition node `{}` needs exactly one true and one false connection (found {t} true, {f} false)",
                        node.id
                    ));
                }
            }
            NodeConfig::Action(config) => {
                if count(ConnectionKind::Default) > 1 {
                    problems.push(format!(
                        "action node `{}` has more than one default connection",
                        node.id
                    ));
                }
                let errors = count(ConnectionKind::Error);
                if config.handle_errors && errors != 1 {
                    problems.push(format!(
                        "action node `{}` handles errors but has {errors} error connections, expected exactly one",
                        node.id
                    ));
                }
                if !config.handle_errors && errors > 1 {
                    problems.push(format!(
                        "action node `{}` has more than one error connection",
                        node.id
                    ));
                }
            }
            NodeConfig::Callback(config) => {
                if config.match_type == CallbackMatch::Regex {
                    if let Err(e) = Regex::new(&config.pattern) {
                        problems.push(format!(
                            "callback node `{}` has invalid pattern: {e}",
                            node.id
                        ));
                    }
                }
                check_single_default(doc, &node.id, &mut problems);
            }
            NodeConfig::Command(config) => {
                if config.command.trim().is_empty() {
                    problems.push(format!("command node `{}` has empty command", node.id));
                }
                check_single_default(doc, &node.id, &mut problems);
            }
            NodeConfig::Input(config) => {
                if config.variable.trim().is_empty() {
                    problems.push(format!("input node `{}` has no target variable", node.id));
                }
                check_rule(&node.id, &config.validation, &mut problems);
                check_single_default(doc, &node.id, &mut problems);
            }
            NodeConfig::Middleware(config) => {
                if let MiddlewareKind::Validation { rule, .. } = &config.kind {
                    check_rule(&node.id, rule, &mut problems);
                }
                if count(ConnectionKind::Error) > 1 {
                    problems.push(format!(
                        "middleware node `{}` has more than one error connection",
                        node.id
                    ));
                }
                check_single_default(doc, &node.id, &mut problems);
            }
            NodeConfig::Start(_) | NodeConfig::Message(_) | NodeConfig::Session(_) => {
                check_single_default(doc, &node.id, &mut problems);
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(GraphError::new(problems))
    }
}

fn check_single_default(doc: &FlowDocument, node_id: &str, problems: &mut Vec<String>) {
    let defaults = doc
        .outgoing(node_id)
        .filter(|connection| connection.effective_kind() == ConnectionKind::Default)
        .count();
    if defaults > 1 {
        problems.push(format!(
            "node `{node_id}` has {defaults} default connections, expected at most one"
        ));
    }
}

fn check_rule(node_id: &str, rule: &InputRule, problems: &mut Vec<String>) {
    if let InputRule::Regex(pattern) = rule {
        if let Err(e) = Regex::new(pattern) {
            problems.push(format!("node `{node_id}` has invalid regex rule: {e}"));
        }
    }
}
