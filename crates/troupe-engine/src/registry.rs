use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use troupe_core::tools::{Tool, ToolDefinition, ToolProvider};

use crate::context::CallContext;
use crate::error::EngineError;

/// Source of a registered tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolSource {
    Local,
    Skill(String),
    Remote(String),
}

#[derive(Clone)]
struct ToolEntry {
    tool: Arc<dyn Tool>,
    definition: ToolDefinition,
    source: ToolSource,
}

type MetadataPredicate = dyn Fn(&ToolDefinition, &CallContext) -> bool + Send + Sync;

/// Per-call tool visibility, applied after skill activation and before the model sees
/// the tool set.
#[derive(Clone)]
pub enum ToolFilter {
    All,
    /// Every tool except these names.
    Except(HashSet<String>),
    /// Only these names.
    Only(HashSet<String>),
    /// Keep tools whose descriptor passes the predicate for this call.
    Metadata(Arc<MetadataPredicate>),
}

impl ToolFilter {
    pub fn metadata(
        predicate: impl Fn(&ToolDefinition, &CallContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Metadata(Arc::new(predicate))
    }

    /// Tools tagged with a `role` are visible only to callers whose `role` attribute matches.
    /// Untagged tools are visible to everyone.
    pub fn role_visibility() -> Self {
        Self::metadata(|def, ctx| match def.metadata.get("role") {
            None => true,
            Some(required) => {
                let caller = ctx.attribute_str("role");
                match required {
                    serde_json::Value::String(r) => caller == Some(r.as_str()),
                    serde_json::Value::Array(roles) => roles
                        .iter()
                        .any(|r| r.as_str().is_some() && r.as_str() == caller),
                    _ => false,
                }
            }
        })
    }

    /// Hide tools whose metadata flag is set, e.g. `destructive`.
    pub fn without_flag(flag: &'static str) -> Self {
        Self::metadata(move |def, _| !def.flag(flag))
    }

    fn allows(&self, def: &ToolDefinition, ctx: &CallContext) -> bool {
        match self {
            Self::All => true,
            Self::Except(excluded) => !excluded.contains(&def.name),
            Self::Only(included) => included.contains(&def.name),
            Self::Metadata(predicate) => predicate(def, ctx),
        }
    }
}

impl fmt::Debug for ToolFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Except(names) => f.debug_tuple("Except").field(names).finish(),
            Self::Only(names) => f.debug_tuple("Only").field(names).finish(),
            Self::Metadata(_) => f.write_str("Metadata(..)"),
        }
    }
}

/// Registry of callable tools. Descriptors are validated once, at registration.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Malformed descriptors and duplicate names are rejected.
    pub fn register(&mut self, tool: Arc<dyn Tool>, source: ToolSource) -> Result<(), EngineError> {
        let definition = tool.to_definition();
        definition.validate()?;
        if let Some(existing) = self.tools.get(&definition.name) {
            return Err(EngineError::Config(format!(
                "tool {} already registered from {:?}",
                definition.name, existing.source
            )));
        }
        let _ = self.tools.insert(
            definition.name.clone(),
            ToolEntry {
                tool,
                definition,
                source,
            },
        );
        Ok(())
    }

    /// Register every tool a provider lists.
    pub fn register_provider(
        &mut self,
        provider: &dyn ToolProvider,
        source: ToolSource,
    ) -> Result<(), EngineError> {
        for tool in provider.list_tools() {
            self.register(tool, source.clone())?;
        }
        Ok(())
    }

    /// Union with another registry. Names already present keep their first entry.
    pub fn extend_from(&mut self, other: &ToolRegistry) {
        for (name, entry) in &other.tools {
            if self.tools.contains_key(name) {
                debug!(tool = %name, "tool already in candidate set, keeping first");
                continue;
            }
            let _ = self.tools.insert(name.clone(), entry.clone());
        }
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|e| &e.definition)
    }

    pub fn source(&self, name: &str) -> Option<&ToolSource> {
        self.tools.get(name).map(|e| &e.source)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions for the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|e| e.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Copy keeping only tools every filter allows for this call.
    pub fn filtered(&self, filters: &[ToolFilter], ctx: &CallContext) -> Self {
        let tools = self
            .tools
            .iter()
            .filter(|(_, e)| filters.iter().all(|f| f.allows(&e.definition, ctx)))
            .map(|(name, e)| (name.clone(), e.clone()))
            .collect();
        Self { tools }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use troupe_core::tools::{ToolContext, ToolError, ToolMetadata, ToolResult};

    struct DummyTool {
        name: String,
        metadata: ToolMetadata,
        schema: Value,
    }

    impl DummyTool {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                metadata: ToolMetadata::new(),
                schema: json!({"type": "object"}),
            }
        }

        fn with_meta(mut self, key: &str, value: Value) -> Self {
            self.metadata.insert(key.into(), value);
            self
        }
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "dummy"
        }
        fn parameters_schema(&self) -> Value {
            self.schema.clone()
        }
        fn metadata(&self) -> ToolMetadata {
            self.metadata.clone()
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::text("ok"))
        }
    }

    fn registry(tools: Vec<DummyTool>) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        for t in tools {
            reg.register(Arc::new(t), ToolSource::Local).unwrap();
        }
        reg
    }

    #[test]
    fn register_and_lookup() {
        let reg = registry(vec![DummyTool::new("b"), DummyTool::new("a")]);
        assert_eq!(reg.count(), 2);
        assert!(reg.contains("a"));
        assert_eq!(reg.names(), vec!["a", "b"]);
        assert_eq!(reg.definitions()[0].name, "a");
        assert_eq!(reg.source("a"), Some(&ToolSource::Local));
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn malformed_schema_is_fatal_at_registration() {
        let mut reg = ToolRegistry::new();
        let mut tool = DummyTool::new("bad");
        tool.schema = json!({"type": "array"});
        let err = reg.register(Arc::new(tool), ToolSource::Local).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTool(_)));
        assert!(reg.is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut reg = registry(vec![DummyTool::new("a")]);
        let err = reg
            .register(Arc::new(DummyTool::new("a")), ToolSource::Skill("s".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn extend_from_keeps_first_entry() {
        let mut base = registry(vec![DummyTool::new("a")]);
        let mut other = ToolRegistry::new();
        other
            .register(Arc::new(DummyTool::new("a")), ToolSource::Skill("s".into()))
            .unwrap();
        other
            .register(Arc::new(DummyTool::new("c")), ToolSource::Skill("s".into()))
            .unwrap();
        base.extend_from(&other);
        assert_eq!(base.names(), vec!["a", "c"]);
        assert_eq!(base.source("a"), Some(&ToolSource::Local));
        assert_eq!(base.source("c"), Some(&ToolSource::Skill("s".into())));
    }

    #[test]
    fn provider_registration() {
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(DummyTool::new("x")), Arc::new(DummyTool::new("y"))];
        let mut reg = ToolRegistry::new();
        reg.register_provider(&tools, ToolSource::Remote("mcp".into()))
            .unwrap();
        assert_eq!(reg.source("y"), Some(&ToolSource::Remote("mcp".into())));
    }

    #[test]
    fn name_filters() {
        let reg = registry(vec![DummyTool::new("a"), DummyTool::new("b"), DummyTool::new("c")]);
        let ctx = CallContext::new("hi");
        let except = reg.filtered(&[ToolFilter::Except(HashSet::from(["b".to_string()]))], &ctx);
        assert_eq!(except.names(), vec!["a", "c"]);
        let only = reg.filtered(&[ToolFilter::Only(HashSet::from(["b".to_string()]))], &ctx);
        assert_eq!(only.names(), vec!["b"]);
        assert_eq!(reg.filtered(&[ToolFilter::All], &ctx).count(), 3);
    }

    #[test]
    fn role_visibility_filter() {
        let reg = registry(vec![
            DummyTool::new("public"),
            DummyTool::new("admin_only").with_meta("role", json!("admin")),
            DummyTool::new("ops_or_admin").with_meta("role", json!(["ops", "admin"])),
        ]);
        let filters = [ToolFilter::role_visibility()];

        let guest = CallContext::new("hi");
        assert_eq!(reg.filtered(&filters, &guest).names(), vec!["public"]);

        let ops = CallContext::new("hi").with_attribute("role", "ops");
        assert_eq!(reg.filtered(&filters, &ops).names(), vec!["ops_or_admin", "public"]);

        let admin = CallContext::new("hi").with_attribute("role", "admin");
        assert_eq!(reg.filtered(&filters, &admin).count(), 3);
    }

    #[test]
    fn filters_compose() {
        let reg = registry(vec![
            DummyTool::new("read"),
            DummyTool::new("wipe").with_meta("destructive", json!(true)),
            DummyTool::new("secret").with_meta("role", json!("admin")),
        ]);
        let filters = [ToolFilter::without_flag("destructive"), ToolFilter::role_visibility()];
        let ctx = CallContext::new("hi");
        assert_eq!(reg.filtered(&filters, &ctx).names(), vec!["read"]);
    }
}
