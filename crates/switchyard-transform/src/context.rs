use std::collections::HashMap;

/// Mapping from minted `toolu_…` ids to the upstream function names they were
/// translated from. Scoped to one conversation; the orchestrator carries it in
/// the request context and it is never persisted.
#[derive(Debug, Clone, Default)]
pub struct ToolNameMap {
    by_id: HashMap<String, String>,
}

impl ToolNameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, tool_use_id: impl Into<String>, function_name: impl Into<String>) {
        self.by_id.insert(tool_use_id.into(), function_name.into());
    }

    pub fn function_name(&self, tool_use_id: &str) -> Option<&str> {
        self.by_id.get(tool_use_id).map(String::as_str)
    }

    /// Reverse lookup for legacy function-role results, which carry only the
    /// function name.
    pub fn id_for_function(&self, function_name: &str) -> Option<&str> {
        self.by_id
            .iter()
            .find(|(_, name)| name.as_str() == function_name)
            .map(|(id, _)| id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
