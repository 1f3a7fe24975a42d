//! Runtime configuration types.

use serde::Deserialize;
use std::fs;
use std::path::Path;

/// What `/` and `\` do when the divisor is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DivisionPolicy {
    /// Abort with "division by zero"
    #[default]
    Fatal,
    /// Float division yields inf/NaN; integer division stays fatal
    Ieee,
}

/// What `CallForeign` does with an unregistered name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForeignPolicy {
    /// Abort with "unknown foreign function"
    #[default]
    Fatal,
    /// Push Nil and continue
    Nil,
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Log coroutine lifecycle to stderr with a `[SCHED]` prefix
    pub trace_scheduler: bool,
    /// Log event registration and dispatch with an `[EVENT]` prefix
    pub trace_events: bool,
    /// Log user and foreign calls with a `[CALL]` prefix
    pub trace_calls: bool,
    pub division: DivisionPolicy,
    pub unknown_foreign: ForeignPolicy,
    /// Give up after this many scheduling passes (None = unlimited)
    pub max_passes: Option<u64>,
    /// Operand stack depth limit per context
    pub stack_limit: usize,
    /// Call frame depth limit per context
    pub frame_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trace_scheduler: false,
            trace_events: false,
            trace_calls: false,
            division: DivisionPolicy::Fatal,
            unknown_foreign: ForeignPolicy::Fatal,
            max_passes: None,
            stack_limit: 4096,
            frame_limit: 256,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    runtime: RuntimeConfig,
}

impl RuntimeConfig {
    /// Load the `[runtime]` table from a TOML file. Missing keys keep their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml(&content)
            .map_err(|e| format!("failed to parse {}: {}", path.display(), e))
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| e.to_string())?;
        Ok(file.runtime)
    }
}
