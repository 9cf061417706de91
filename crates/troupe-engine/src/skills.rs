use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use troupe_core::tools::Tool;

use crate::context::CallContext;
use crate::error::EngineError;
use crate::registry::{ToolRegistry, ToolSource};

/// A conditionally activated bundle of instructions and tools.
///
/// Skills hold no per-call state; they are re-evaluated on every turn.
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Whether this skill applies to the call.
    fn is_supported(&self, ctx: &CallContext) -> bool;

    /// Instruction text appended to the system prompt when active.
    fn instruction(&self, ctx: &CallContext) -> String;

    fn list_tools(&self) -> Vec<Arc<dyn Tool>> {
        Vec::new()
    }
}

type Predicate = dyn Fn(&CallContext) -> bool + Send + Sync;

/// Activation rule for a [`StaticSkill`].
#[derive(Clone)]
pub enum Activation {
    Always,
    /// Any keyword appears in the prompt (case-insensitive).
    Keywords(Vec<String>),
    /// The prompt mentions `@skill-name`.
    Mention,
    Custom(Arc<Predicate>),
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Keywords(k) => f.debug_tuple("Keywords").field(k).finish(),
            Self::Mention => f.write_str("Mention"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A skill with fixed instruction text and a declarative activation rule.
pub struct StaticSkill {
    name: String,
    description: String,
    instruction: String,
    activation: Activation,
    tools: Vec<Arc<dyn Tool>>,
}

impl StaticSkill {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: instruction.into(),
            activation: Activation::Mention,
            tools: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn always(mut self) -> Self {
        self.activation = Activation::Always;
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.activation = Activation::Keywords(
            keywords.into_iter().map(|k| k.into().to_lowercase()).collect(),
        );
        self
    }

    pub fn on_mention(mut self) -> Self {
        self.activation = Activation::Mention;
        self
    }

    pub fn when(mut self, predicate: impl Fn(&CallContext) -> bool + Send + Sync + 'static) -> Self {
        self.activation = Activation::Custom(Arc::new(predicate));
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }
}

impl Skill for StaticSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn is_supported(&self, ctx: &CallContext) -> bool {
        match &self.activation {
            Activation::Always => true,
            Activation::Keywords(words) => {
                let prompt = ctx.prompt.to_lowercase();
                words.iter().any(|w| prompt.contains(w.as_str()))
            }
            Activation::Mention => extract_mentions(&ctx.prompt).contains(&self.name),
            Activation::Custom(predicate) => predicate(ctx),
        }
    }

    fn instruction(&self, _ctx: &CallContext) -> String {
        self.instruction.clone()
    }

    fn list_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }
}

/// `@name` references in text. A mention must start the text or follow whitespace.
pub fn extract_mentions(text: &str) -> HashSet<String> {
    let mut mentions = HashSet::new();
    let mut prev: Option<char> = None;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let at_boundary = prev.map_or(true, char::is_whitespace);
        if c == '@' && at_boundary {
            let start = i + 1;
            let mut end = start;
            while let Some(&(j, n)) = chars.peek() {
                if n.is_ascii_alphanumeric() || n == '-' || n == '_' {
                    end = j + n.len_utf8();
                    let _ = chars.next();
                } else {
                    break;
                }
            }
            if end > start {
                let _ = mentions.insert(text[start..end].to_string());
            }
            prev = text[..end].chars().next_back();
            continue;
        }
        prev = Some(c);
    }
    mentions
}

/// Result of evaluating the registry against one call.
#[derive(Default)]
pub struct ActiveSkills {
    pub names: Vec<String>,
    /// Rendered `<skills>` block, empty when nothing activated.
    pub instructions: String,
    pub tools: ToolRegistry,
}

impl ActiveSkills {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Skills in registration order.
#[derive(Clone, Default)]
pub struct SkillRegistry {
    skills: Vec<Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a skill. Duplicate names and malformed tool descriptors are rejected.
    pub fn register(&mut self, skill: Arc<dyn Skill>) -> Result<(), EngineError> {
        if self.skills.iter().any(|s| s.name() == skill.name()) {
            return Err(EngineError::Config(format!(
                "skill {} already registered",
                skill.name()
            )));
        }
        let mut tools = ToolRegistry::new();
        for tool in skill.list_tools() {
            tools.register(tool, ToolSource::Skill(skill.name().to_string()))?;
        }
        self.skills.push(skill);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.skills.iter().map(|s| s.name()).collect()
    }

    /// Evaluate every skill for this call.
    pub fn activate(&self, ctx: &CallContext) -> ActiveSkills {
        let mut active = ActiveSkills::default();
        let mut blocks = Vec::new();
        for skill in &self.skills {
            if !skill.is_supported(ctx) {
                continue;
            }
            let name = skill.name().to_string();
            let text = skill.instruction(ctx);
            if !text.trim().is_empty() {
                blocks.push(format!("<skill name=\"{name}\">\n{}\n</skill>", text.trim()));
            }
            for tool in skill.list_tools() {
                if active.tools.contains(tool.name()) {
                    debug!(skill = %name, tool = %tool.name(), "tool already contributed");
                    continue;
                }
                // Validated in register.
                if let Err(e) = active.tools.register(tool, ToolSource::Skill(name.clone())) {
                    debug!(skill = %name, error = %e, "skipping skill tool");
                }
            }
            active.names.push(name);
        }
        if !blocks.is_empty() {
            active.instructions = format!("<skills>\n{}\n</skills>", blocks.join("\n"));
        }
        debug!(active = ?active.names, "skills evaluated");
        active
    }
}
