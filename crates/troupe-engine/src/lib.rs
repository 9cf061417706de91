//! The troupe engine: skill activation, the tool pipeline, the reasoning loop and team
//! orchestration over a shared [`Runtime`].

pub mod agent;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod planner;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod settings;
pub mod skills;
pub mod stream;
pub mod team;
pub mod truncate;

#[cfg(test)]
pub(crate) mod testutil;

pub use agent::{Agent, AgentBuilder, CallOptions};
pub use context::CallContext;
pub use error::EngineError;
pub use pipeline::{HitlGate, InterceptContext, Interception, Interceptor, ToolPipeline};
pub use planner::PlanStrategy;
pub use registry::{ToolFilter, ToolRegistry, ToolSource};
pub use runner::{extract_json, CANCELLED_NOTICE};
pub use runtime::{ActiveRuns, Runtime};
pub use settings::{load_settings_from_path, EngineSettings};
pub use skills::{Activation, Skill, SkillRegistry, StaticSkill};
pub use stream::AgentStream;
pub use team::{Team, TeamBuilder, TeamMode};
