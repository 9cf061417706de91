//! Engine settings, layered lowest to highest: compiled defaults, an optional JSON
//! settings file, then `TROUPE_*` environment variables. Unknown file keys and invalid
//! env values are logged and skipped.

use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use troupe_telemetry::TelemetryConfig;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Root settings. All fields are optional in JSON; missing ones take their default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub agent: AgentSettings,
    pub session: SessionSettings,
    pub team: TeamSettings,
    pub telemetry: TelemetryConfig,
}

/// Reasoning loop defaults, applied to every agent unless its builder overrides them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Maximum REASON→ACT cycles per call.
    pub max_steps: u32,
    pub planning: bool,
    pub tool_timeout_ms: u64,
    pub model_timeout_ms: u64,
    /// Observations longer than this are cut with a truncation marker.
    pub max_observation_bytes: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 10,
            planning: false,
            tool_timeout_ms: 60_000,
            model_timeout_ms: 120_000,
            max_observation_bytes: 64 * 1024,
        }
    }
}

impl AgentSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// History bound for sessions created on first reference.
    pub max_history: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { max_history: 50 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeamSettings {
    /// Maximum member invocations per team call.
    pub turn_budget: u32,
}

impl Default for TeamSettings {
    fn default() -> Self {
        Self { turn_budget: 8 }
    }
}

impl EngineSettings {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_steps == 0 {
            return Err(SettingsError::InvalidValue("agent.maxSteps must be at least 1".into()));
        }
        if self.session.max_history == 0 {
            return Err(SettingsError::InvalidValue(
                "session.maxHistory must be at least 1".into(),
            ));
        }
        if self.team.turn_budget == 0 {
            return Err(SettingsError::InvalidValue(
                "team.turnBudget must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load settings from a file (if present) with env var overrides.
pub fn load_settings_from_path(path: &Path) -> Result<EngineSettings> {
    let mut merged = serde_json::to_value(EngineSettings::default())?;

    if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let layer: Value = serde_json::from_str(&content)?;
        overlay(&mut merged, layer, "");
    } else {
        debug!(?path, "settings file not found, using defaults");
    }

    let mut settings: EngineSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Lay a settings file over the serialized defaults in place.
///
/// The defaults name every known key, so keys absent from them are reported and
/// dropped. Nested sections merge per key; arrays and scalars replace; nulls keep the
/// default.
fn overlay(base: &mut Value, layer: Value, path: &str) {
    match (base, layer) {
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                let key_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match base_map.get_mut(&key) {
                    None => warn!(key = %key_path, "unknown setting, ignoring"),
                    Some(_) if value.is_null() => {}
                    Some(slot) => overlay(slot, value, &key_path),
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

type Setter = fn(&mut EngineSettings, &str) -> std::result::Result<(), String>;

/// `TROUPE_*` variables and the setting each one replaces.
const ENV_OVERRIDES: &[(&str, Setter)] = &[
    ("TROUPE_MAX_STEPS", |s: &mut EngineSettings, raw: &str| {
        s.agent.max_steps = bounded(raw, 1..=10_000)?;
        Ok(())
    }),
    ("TROUPE_PLANNING", |s: &mut EngineSettings, raw: &str| {
        s.agent.planning = switch(raw)?;
        Ok(())
    }),
    ("TROUPE_TOOL_TIMEOUT_MS", |s: &mut EngineSettings, raw: &str| {
        s.agent.tool_timeout_ms = bounded(raw, 1..=86_400_000)?;
        Ok(())
    }),
    ("TROUPE_MODEL_TIMEOUT_MS", |s: &mut EngineSettings, raw: &str| {
        s.agent.model_timeout_ms = bounded(raw, 1..=86_400_000)?;
        Ok(())
    }),
    ("TROUPE_MAX_HISTORY", |s: &mut EngineSettings, raw: &str| {
        s.session.max_history = bounded(raw, 1..=1_000_000)?;
        Ok(())
    }),
    ("TROUPE_TEAM_BUDGET", |s: &mut EngineSettings, raw: &str| {
        s.team.turn_budget = bounded(raw, 1..=10_000)?;
        Ok(())
    }),
    ("TROUPE_LOG_LEVEL", |s: &mut EngineSettings, raw: &str| {
        s.telemetry.log_level = raw.to_lowercase();
        Ok(())
    }),
];

/// Apply `TROUPE_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut EngineSettings) {
    apply_overrides_with(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from any variable lookup. Invalid values are ignored with a warning.
pub fn apply_overrides_with(settings: &mut EngineSettings, lookup: impl Fn(&str) -> Option<String>) {
    for &(var, set) in ENV_OVERRIDES {
        let Some(raw) = lookup(var) else { continue };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match set(settings, raw) {
            Ok(()) => debug!(key = %var, "env override applied"),
            Err(reason) => warn!(key = %var, value = %raw, %reason, "invalid env override, ignoring"),
        }
    }
}

fn bounded<T: TryFrom<u64>>(raw: &str, range: RangeInclusive<u64>) -> std::result::Result<T, String> {
    let n: u64 = raw
        .parse()
        .map_err(|_| format!("expected a whole number, got {raw:?}"))?;
    if !range.contains(&n) {
        return Err(format!("{n} is outside {}..={}", range.start(), range.end()));
    }
    T::try_from(n).map_err(|_| format!("{n} does not fit the setting"))
}

fn switch(raw: &str) -> std::result::Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(format!("expected true or false, got {raw:?}")),
    }
}
