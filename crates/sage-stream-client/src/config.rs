//! Client configuration and per-request agent settings.
//!
//! Two unrelated kinds of configuration live here:
//!
//! - [`ClientConfig`]: where the backend is and how the client talks to it.
//! - [`ConfigResolver`]: the agent settings sent with every request, resolved
//!   from three layers. User overrides win over the selected agent's declared
//!   defaults, which win over hard-coded fallbacks.

use std::time::Duration;

use sage_stream_core::{AgentId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::grouping::GroupingConfig;

// =============================================================================
// Client configuration
// =============================================================================

/// Configuration for the stream client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientConfig {
    /// Backend base URL (e.g., `http://localhost:8080`).
    #[serde(default = "ClientConfig::default_base_url")]
    pub base_url: String,

    /// Path of the streaming endpoint.
    #[serde(default = "ClientConfig::default_stream_path")]
    pub stream_path: String,

    /// Path prefix of the session endpoints; `/{id}/interrupt` is appended.
    #[serde(default = "ClientConfig::default_interrupt_path_prefix")]
    pub interrupt_path_prefix: String,

    /// Connect timeout in seconds.
    #[serde(default = "ClientConfig::default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Capacity of the channel between the reader task and the session.
    #[serde(default = "ClientConfig::default_event_buffer")]
    pub event_buffer: usize,

    /// Text appended to messages cut short by an interrupt.
    #[serde(default = "ClientConfig::default_interrupt_notice")]
    pub interrupt_notice: String,

    /// Reason sent to the backend with an interrupt.
    #[serde(default = "ClientConfig::default_interrupt_reason")]
    pub interrupt_reason: String,

    /// Turn grouping for display.
    #[serde(default)]
    pub grouping: GroupingConfig,
}

impl ClientConfig {
    fn default_base_url() -> String {
        "http://localhost:8080".to_string()
    }

    fn default_stream_path() -> String {
        "/api/stream".to_string()
    }

    fn default_interrupt_path_prefix() -> String {
        "/api/sessions".to_string()
    }

    const fn default_connect_timeout() -> u64 {
        5
    }

    const fn default_event_buffer() -> usize {
        128
    }

    fn default_interrupt_notice() -> String {
        "\n\n[Interrupted by user]".to_string()
    }

    fn default_interrupt_reason() -> String {
        "User requested interruption".to_string()
    }

    /// Create a configuration for the given backend with defaults elsewhere.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Get the connect timeout as a `Duration`.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Full URL of the streaming endpoint.
    #[must_use]
    pub fn stream_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.stream_path)
    }

    /// Full URL of the interrupt endpoint for a session.
    #[must_use]
    pub fn interrupt_url(&self, session_id: &SessionId) -> String {
        format!(
            "{}{}/{session_id}/interrupt",
            self.base_url.trim_end_matches('/'),
            self.interrupt_path_prefix.trim_end_matches('/'),
        )
    }

    /// Text appended to messages that end because of a failure.
    #[must_use]
    pub fn error_notice(detail: &str) -> String {
        format!("\n\n[Stream error: {detail}]")
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            stream_path: Self::default_stream_path(),
            interrupt_path_prefix: Self::default_interrupt_path_prefix(),
            connect_timeout_seconds: Self::default_connect_timeout(),
            event_buffer: Self::default_event_buffer(),
            interrupt_notice: Self::default_interrupt_notice(),
            interrupt_reason: Self::default_interrupt_reason(),
            grouping: GroupingConfig::default(),
        }
    }
}

// =============================================================================
// Agent settings
// =============================================================================

/// Names one agent setting, for clearing a single override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    /// `system_context`
    SystemContext,
    /// `available_workflows`
    AvailableWorkflows,
    /// `llm_model_config`
    LlmModelConfig,
    /// `system_prefix`
    SystemPrefix,
    /// `available_tools`
    AvailableTools,
    /// `available_skills`
    AvailableSkills,
    /// `deep_thinking`
    DeepThinking,
    /// `multi_agent`
    MultiAgent,
    /// `more_suggest`
    MoreSuggest,
    /// `max_loop_count`
    MaxLoopCount,
}

impl ConfigField {
    /// Every field, in request order.
    pub const ALL: [Self; 10] = [
        Self::SystemContext,
        Self::AvailableWorkflows,
        Self::LlmModelConfig,
        Self::SystemPrefix,
        Self::AvailableTools,
        Self::AvailableSkills,
        Self::DeepThinking,
        Self::MultiAgent,
        Self::MoreSuggest,
        Self::MaxLoopCount,
    ];
}

/// One layer of agent settings. Unset fields fall through to the layer below.
///
/// Agent definitions use camelCase keys (`deepThinking`, `llmConfig`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    /// Free-form context passed to the agent's system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_context: Option<Map<String, Value>>,
    /// Workflows the agent may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_workflows: Option<Map<String, Value>>,
    /// Model selection and sampling parameters.
    #[serde(default, rename = "llmConfig", skip_serializing_if = "Option::is_none")]
    pub llm_model_config: Option<Map<String, Value>>,
    /// Text prepended to the system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prefix: Option<String>,
    /// Tools the agent may call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_tools: Option<Vec<String>>,
    /// Skills the agent may use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_skills: Option<Vec<String>>,
    /// Enable the extended reasoning phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_thinking: Option<bool>,
    /// Enable multi-agent task decomposition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_agent: Option<bool>,
    /// Ask for follow-up suggestions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more_suggest: Option<bool>,
    /// Upper bound on agent loop iterations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loop_count: Option<u32>,
}

impl AgentSettings {
    /// Overwrite every field that `partial` sets.
    pub fn apply(&mut self, partial: Self) {
        macro_rules! take_set {
            ($($field:ident),*) => {
                $(if partial.$field.is_some() {
                    self.$field = partial.$field;
                })*
            };
        }
        take_set!(
            system_context,
            available_workflows,
            llm_model_config,
            system_prefix,
            available_tools,
            available_skills,
            deep_thinking,
            multi_agent,
            more_suggest,
            max_loop_count
        );
    }

    /// Unset one field.
    pub fn clear(&mut self, field: ConfigField) {
        match field {
            ConfigField::SystemContext => self.system_context = None,
            ConfigField::AvailableWorkflows => self.available_workflows = None,
            ConfigField::LlmModelConfig => self.llm_model_config = None,
            ConfigField::SystemPrefix => self.system_prefix = None,
            ConfigField::AvailableTools => self.available_tools = None,
            ConfigField::AvailableSkills => self.available_skills = None,
            ConfigField::DeepThinking => self.deep_thinking = None,
            ConfigField::MultiAgent => self.multi_agent = None,
            ConfigField::MoreSuggest => self.more_suggest = None,
            ConfigField::MaxLoopCount => self.max_loop_count = None,
        }
    }

    /// Returns true if this layer sets `field`.
    #[must_use]
    pub const fn is_set(&self, field: ConfigField) -> bool {
        match field {
            ConfigField::SystemContext => self.system_context.is_some(),
            ConfigField::AvailableWorkflows => self.available_workflows.is_some(),
            ConfigField::LlmModelConfig => self.llm_model_config.is_some(),
            ConfigField::SystemPrefix => self.system_prefix.is_some(),
            ConfigField::AvailableTools => self.available_tools.is_some(),
            ConfigField::AvailableSkills => self.available_skills.is_some(),
            ConfigField::DeepThinking => self.deep_thinking.is_some(),
            ConfigField::MultiAgent => self.multi_agent.is_some(),
            ConfigField::MoreSuggest => self.more_suggest.is_some(),
            ConfigField::MaxLoopCount => self.max_loop_count.is_some(),
        }
    }

    /// Fields this layer sets.
    #[must_use]
    pub fn fields_set(&self) -> Vec<ConfigField> {
        ConfigField::ALL
            .into_iter()
            .filter(|field| self.is_set(*field))
            .collect()
    }
}

/// An agent the user can select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Agent identity, sent as `agent_id`.
    pub id: AgentId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// The agent's declared defaults.
    #[serde(default)]
    pub config: AgentSettings,
}

impl Agent {
    /// Create an agent with no declared defaults.
    #[must_use]
    pub fn new(id: AgentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            config: AgentSettings::default(),
        }
    }

    /// Set the agent's declared defaults.
    #[must_use]
    pub fn with_config(mut self, config: AgentSettings) -> Self {
        self.config = config;
        self
    }
}

/// Fully resolved settings for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    /// See [`AgentSettings::system_context`].
    pub system_context: Map<String, Value>,
    /// See [`AgentSettings::available_workflows`].
    pub available_workflows: Map<String, Value>,
    /// See [`AgentSettings::llm_model_config`].
    pub llm_model_config: Map<String, Value>,
    /// See [`AgentSettings::system_prefix`].
    pub system_prefix: String,
    /// See [`AgentSettings::available_tools`].
    pub available_tools: Vec<String>,
    /// See [`AgentSettings::available_skills`].
    pub available_skills: Vec<String>,
    /// See [`AgentSettings::deep_thinking`].
    pub deep_thinking: bool,
    /// See [`AgentSettings::multi_agent`].
    pub multi_agent: bool,
    /// See [`AgentSettings::more_suggest`].
    pub more_suggest: bool,
    /// See [`AgentSettings::max_loop_count`].
    pub max_loop_count: u32,
}

impl ResolvedConfig {
    /// Loop bound used when neither the user nor the agent sets one.
    pub const DEFAULT_MAX_LOOP_COUNT: u32 = 10;
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            system_context: Map::new(),
            available_workflows: Map::new(),
            llm_model_config: Map::new(),
            system_prefix: String::new(),
            available_tools: Vec::new(),
            available_skills: Vec::new(),
            deep_thinking: false,
            multi_agent: false,
            more_suggest: false,
            max_loop_count: Self::DEFAULT_MAX_LOOP_COUNT,
        }
    }
}

/// Resolves request settings from user overrides, agent defaults and fallbacks.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    overrides: AgentSettings,
    agent: Option<Agent>,
}

impl ConfigResolver {
    /// Create a resolver with no agent and no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The selected agent.
    #[must_use]
    pub const fn agent(&self) -> Option<&Agent> {
        self.agent.as_ref()
    }

    /// The user's overrides.
    #[must_use]
    pub const fn overrides(&self) -> &AgentSettings {
        &self.overrides
    }

    /// Select an agent. Overrides are kept.
    pub fn select_agent(&mut self, agent: Agent) {
        self.agent = Some(agent);
    }

    /// Record user overrides for every field `partial` sets.
    pub fn update(&mut self, partial: AgentSettings) {
        self.overrides.apply(partial);
    }

    /// Drop one override so the field follows the agent again.
    pub fn clear_override(&mut self, field: ConfigField) {
        self.overrides.clear(field);
    }

    /// Drop every override.
    pub fn clear_overrides(&mut self) {
        self.overrides = AgentSettings::default();
    }

    /// Returns true if the user has overridden `field`.
    #[must_use]
    pub const fn is_overridden(&self, field: ConfigField) -> bool {
        self.overrides.is_set(field)
    }

    /// Resolve every field.
    #[must_use]
    pub fn resolve(&self) -> ResolvedConfig {
        let empty = AgentSettings::default();
        let user = &self.overrides;
        let agent = self.agent.as_ref().map_or(&empty, |agent| &agent.config);
        let fallback = ResolvedConfig::default();

        macro_rules! layer {
            ($field:ident) => {
                user.$field
                    .clone()
                    .or_else(|| agent.$field.clone())
                    .unwrap_or(fallback.$field)
            };
        }

        ResolvedConfig {
            system_context: layer!(system_context),
            available_workflows: layer!(available_workflows),
            llm_model_config: layer!(llm_model_config),
            system_prefix: layer!(system_prefix),
            available_tools: layer!(available_tools),
            available_skills: layer!(available_skills),
            deep_thinking: layer!(deep_thinking),
            multi_agent: layer!(multi_agent),
            more_suggest: layer!(more_suggest),
            max_loop_count: layer!(max_loop_count),
        }
    }
}
