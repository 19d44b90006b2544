use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::{AgentConfig, DEFAULT_SYSTEM_PROMPT, ProviderConfig, ProviderKind, ProviderSpec};
use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub agent: AgentSettings,

    /// Per-provider overrides keyed by provider name (`openai`, `ollama`, ...)
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,

    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub client: ClientSettings,

    #[serde(default)]
    pub tools: ToolSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_true")]
    pub use_history: bool,

    #[serde(default = "default_true")]
    pub stream: bool,

    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Overrides the built-in system prompt; empty string disables it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Missing fields fall back to the provider's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Seconds a tool call waits for the host (0 = wait forever)
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_secs: u64,

    /// Host tick interval in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Command queue poll interval in milliseconds
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Tool packages hidden from the model
    #[serde(default)]
    pub disabled_packages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_provider() -> String {
    ProviderKind::OpenAi.as_str().to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_rounds() -> usize {
    20
}
fn default_dispatch_timeout() -> u64 {
    60
}
fn default_tick_ms() -> u64 {
    16
}
fn default_idle_poll_ms() -> u64 {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            use_history: default_true(),
            stream: default_true(),
            max_rounds: default_max_rounds(),
            system_prompt: None,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_dispatch_timeout(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        Self::load_from(paths)
    }

    /// Load `config.toml` under `paths`, creating it from the template on
    /// first run.
    pub fn load_from(paths: Paths) -> Result<Self> {
        let path = paths.config_file();

        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.paths = paths;

        // Expand environment variables in provider settings
        config.expand_env_vars();

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    fn expand_env_vars(&mut self) {
        for settings in self.providers.values_mut() {
            if let Some(ref mut api_key) = settings.api_key {
                *api_key = expand_env(api_key);
            }
            if let Some(ref mut base_url) = settings.base_url {
                *base_url = expand_env(base_url);
            }
        }
    }

    pub fn provider_kind(&self) -> Result<ProviderKind> {
        self.agent.provider.parse()
    }

    /// Connection settings for `spec`, with unset fields taken from its
    /// defaults.
    pub fn provider_config(&self, spec: &dyn ProviderSpec) -> ProviderConfig {
        let defaults = spec.default_config();
        let Some(settings) = self.providers.get(spec.kind().as_str()) else {
            return defaults;
        };
        let pick = |value: &Option<String>, fallback: String| {
            value.clone().filter(|v| !v.is_empty()).unwrap_or(fallback)
        };
        ProviderConfig {
            base_url: pick(&settings.base_url, defaults.base_url),
            api_key: pick(&settings.api_key, defaults.api_key),
            model: pick(&settings.model, defaults.model),
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            use_history: self.agent.use_history,
            stream: self.agent.stream,
            max_rounds: self.agent.max_rounds,
            system_prompt: self
                .agent
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        (self.dispatch.timeout_secs > 0).then(|| Duration::from_secs(self.dispatch.timeout_secs))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch.tick_ms.max(1))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.client.idle_poll_ms.max(1))
    }
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Default config template with helpful comments (used for first-time setup)
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Genesis Configuration
# Auto-created on first run. Edit as needed.

[agent]
# openai | deepseek | siliconflow | openrouter | oneapi | ollama
provider = "openai"
# Keep the conversation between commands
use_history = true
stream = true
# Upper bound on request/response rounds per command
max_rounds = 20
# system_prompt = "You are a helpful 3D scene assistant."

# Unset fields use the provider's defaults
[providers.openai]
api_key = "${OPENAI_API_KEY}"
# base_url = "https://api.openai.com"
# model = "gpt-4o-mini"

# [providers.deepseek]
# api_key = "${DEEPSEEK_API_KEY}"
# model = "deepseek-chat"

# [providers.ollama]
# base_url = "http://localhost:11434"
# model = "qwen2.5"

[dispatch]
# Seconds a tool call waits for the host thread (0 = wait forever)
timeout_secs = 60
tick_ms = 16

[client]
idle_poll_ms = 100

[tools]
# Tool packages hidden from the model, e.g. ["object"]
disabled_packages = []

[logging]
level = "info"
"#;
