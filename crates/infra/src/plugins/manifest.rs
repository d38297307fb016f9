use serde::{Deserialize, Serialize};

use storefront_hooks::DEFAULT_PRIORITY;

/// Declarative description of a plugin, loaded when the plugin is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub hooks: Vec<HookDecl>,
    #[serde(default)]
    pub schedules: Vec<ScheduleDecl>,
    #[serde(default)]
    pub default_config: serde_json::Map<String, serde_json::Value>,
}

/// A hook subscription: a bare name, or a name with an explicit priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookDecl {
    Name(String),
    Detailed {
        name: String,
        #[serde(default = "default_priority")]
        priority: i32,
    },
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl HookDecl {
    pub fn name(&self) -> &str {
        match self {
            HookDecl::Name(name) | HookDecl::Detailed { name, .. } => name,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            HookDecl::Name(_) => DEFAULT_PRIORITY,
            HookDecl::Detailed { priority, .. } => *priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDecl {
    pub id: String,
    /// Interval shorthand (`5m`) or a cron expression.
    pub schedule: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl PluginManifest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: None,
            is_system: false,
            hooks: Vec::new(),
            schedules: Vec::new(),
            default_config: serde_json::Map::new(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
