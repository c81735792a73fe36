use std::collections::BTreeMap;

use super::scope::VariableScope;
use super::session::ScopedVariables;
use crate::error::Result;

const SESSION_PREFIX: &str = "session.";
const FLOW_PREFIX: &str = "flow.";

/// 执行期间的变量视图
///
/// 节点执行前加载 session + flow 两个作用域的快照，用于模板渲染、
/// 条件求值和表达式计算。查找顺序：session 优先，其次 flow；
/// `session.x` / `flow.x` 可以强制作用域
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariableView {
    session: BTreeMap<String, String>,
    flow: BTreeMap<String, String>,
}

impl VariableView {
    pub fn new(session: BTreeMap<String, String>, flow: BTreeMap<String, String>) -> Self {
        Self { session, flow }
    }

    pub async fn load(session: &ScopedVariables, flow: &ScopedVariables) -> Result<Self> {
        Ok(Self {
            session: session.snapshot().await?,
            flow: flow.snapshot().await?,
        })
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        if let Some(rest) = name.strip_prefix(SESSION_PREFIX) {
            return self.session.get(rest).map(String::as_str);
        }
        if let Some(rest) = name.strip_prefix(FLOW_PREFIX) {
            return self.flow.get(rest).map(String::as_str);
        }
        self.session
            .get(name)
            .or_else(|| self.flow.get(name))
            .map(String::as_str)
    }

    /// 缺失的变量视为空字符串
    pub fn resolve_or_empty(&self, name: &str) -> String {
        self.resolve(name).unwrap_or_default().to_string()
    }

    /// 替换文本中的 `{{name}}` 引用
    pub fn render(&self, template: &str) -> String {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            output.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            match after.find("}}") {
                Some(close) => {
                    output.push_str(self.resolve(&after[..close]).unwrap_or_default());
                    rest = &after[close + 2..];
                }
                None => {
                    output.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        output.push_str(rest);
        output
    }

    pub fn scope(&self, scope: VariableScope) -> &BTreeMap<String, String> {
        match scope {
            VariableScope::Session => &self.session,
            VariableScope::Flow => &self.flow,
        }
    }

    /// 合并后的变量表（session 覆盖 flow），并附带带前缀的完整键
    pub fn merged(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for (key, value) in &self.flow {
            merged.insert(format!("{FLOW_PREFIX}{key}"), value.clone());
            merged.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.session {
            merged.insert(format!("{SESSION_PREFIX}{key}"), value.clone());
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> VariableView {
        let mut session = BTreeMap::new();
        session.insert("name".to_string(), "Alice".to_string());
        session.insert("balance".to_string(), "50".to_string());
        let mut flow = BTreeMap::new();
        flow.insert("balance".to_string(), "999".to_string());
        flow.insert("campaign".to_string(), "spring".to_string());
        VariableView::new(session, flow)
    }

    #[test]
    fn test_session_shadows_flow() {
        let view = view();
        assert_eq!(view.resolve("balance"), Some("50"));
        assert_eq!(view.resolve("flow.balance"), Some("999"));
        assert_eq!(view.resolve("campaign"), Some("spring"));
        assert_eq!(view.resolve("session.campaign"), None);
    }

    #[test]
    fn test_render_template() {
        let view = view();
        assert_eq!(
            view.render("Hi {{ name }}, campaign {{campaign}}{{missing}}!"),
            "Hi Alice, campaign spring!"
        );
        assert_eq!(view.render("unclosed {{name"), "unclosed {{name");
    }
}
