use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

// ---------------------------------------------------------------------------
// Provider selection
// ---------------------------------------------------------------------------

/// Which backend a model entry talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Bedrock,
    OpenaiCompatible,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Bedrock => write!(f, "bedrock"),
            ProviderKind::OpenaiCompatible => write!(f, "openai_compatible"),
        }
    }
}

// ---------------------------------------------------------------------------
// Model configuration
// ---------------------------------------------------------------------------

/// Configuration for a single model entry.
///
/// Bedrock entries require `model_id`; OpenAI-compatible entries require
/// `base_url` and `model`. `validate()` enforces both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    /// Display name shown to the user and embedded in error messages.
    pub name: String,

    #[serde(default)]
    pub supports_images: bool,
    #[serde(default)]
    pub supports_documents: bool,
    #[serde(default)]
    pub supports_reasoning: bool,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    // Bedrock fields
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,

    // OpenAI-compatible fields
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,

    /// Bearer credential for either backend. Bedrock falls back to the
    /// AWS_BEARER_TOKEN_BEDROCK environment variable when unset.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

// ---------------------------------------------------------------------------
// Agents and knowledge sources
// ---------------------------------------------------------------------------

/// A remote reference an agent can pull into its system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
}

fn default_cache_ttl_hours() -> u64 {
    24
}

/// A named bundle of system instructions and optional knowledge sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub inject_knowledge_automatically: bool,
    #[serde(default)]
    pub knowledge_sources: Vec<KnowledgeSource>,
}

// ---------------------------------------------------------------------------
// App / storage / logging sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_title")]
    pub title: String,
    pub default_model: String,
    pub default_agent: String,
}

fn default_title() -> String {
    "Murmur".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub enabled: bool,
    pub data_directory: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            data_directory: "./data".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// Log directory; empty means console only.
    pub directory: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            directory: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Root config
// ---------------------------------------------------------------------------

/// Root configuration, loaded from `murmur.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    pub models: HashMap<String, ModelConfig>,
    pub agents: HashMap<String, AgentConfig>,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the first existing file in the search path.
    pub fn load(custom_path: Option<&Path>) -> Result<Self> {
        let candidates = config_search_paths(custom_path);
        let path = candidates.iter().find(|p| p.exists()).with_context(|| {
            let searched = candidates
                .iter()
                .map(|p| format!("  {}", p.display()))
                .collect::<Vec<_>>()
                .join("\n");
            format!("No configuration file found. Searched:\n{searched}")
        })?;

        info!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&text)
    }

    /// Enforce field constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            bail!("Configuration must define at least one model");
        }

        for (key, model) in &self.models {
            if model.max_tokens == 0 {
                bail!("Model '{key}': max_tokens must be positive");
            }
            if !(0.0..=2.0).contains(&model.temperature) {
                bail!("Model '{key}': temperature must be between 0.0 and 2.0");
            }
            match model.provider {
                ProviderKind::Bedrock => {
                    if model.model_id.as_deref().unwrap_or("").is_empty() {
                        bail!("Model '{key}': bedrock models require model_id");
                    }
                }
                ProviderKind::OpenaiCompatible => {
                    if model.base_url.as_deref().unwrap_or("").is_empty() {
                        bail!("Model '{key}': openai_compatible models require base_url");
                    }
                    if model.model.as_deref().unwrap_or("").is_empty() {
                        bail!("Model '{key}': openai_compatible models require model");
                    }
                }
            }
        }

        if !self.models.contains_key(&self.app.default_model) {
            let available = sorted_keys(&self.models);
            bail!(
                "default_model '{}' not found in models. Available: {}",
                self.app.default_model,
                available.join(", ")
            );
        }
        if !self.agents.contains_key(&self.app.default_agent) {
            let available = sorted_keys(&self.agents);
            bail!(
                "default_agent '{}' not found in agents. Available: {}",
                self.app.default_agent,
                available.join(", ")
            );
        }

        Ok(())
    }
}

/// Sorted key list, used for stable error messages.
pub fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

/// Candidate config file paths, highest priority first.
pub fn config_search_paths(custom_path: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(custom) = custom_path {
        paths.push(custom.to_path_buf());
    }
    paths.push(PathBuf::from("config").join("murmur.toml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config").join("murmur").join("murmur.toml"));
    }
    paths
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_TOML: &str = r#"
        [app]
        title = "Murmur"
        default_model = "local"
        default_agent = "general"

        [models.local]
        provider = "openai_compatible"
        name = "Local Llama"
        base_url = "http://localhost:11434/v1"
        model = "llama3"
        max_tokens = 2048
        temperature = 0.7

        [models.claude]
        provider = "bedrock"
        name = "Claude Sonnet"
        model_id = "anthropic.claude-3-5-sonnet-20241022-v2:0"
        region = "us-east-1"
        supports_images = true
        supports_documents = true

        [agents.general]
        name = "General Assistant"
        instructions = "You are a helpful assistant."
    "#;

    #[test]
    fn parses_valid_config() {
        let config = Config::from_toml(VALID_TOML).expect("should parse");
        assert_eq!(config.app.default_model, "local");
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.agents.len(), 1);

        let local = &config.models["local"];
        assert_eq!(local.provider, ProviderKind::OpenaiCompatible);
        assert_eq!(local.max_tokens, 2048);
        assert!(!local.supports_images);

        let claude = &config.models["claude"];
        assert_eq!(claude.provider, ProviderKind::Bedrock);
        assert!(claude.supports_images);
        // Defaults apply where omitted.
        assert_eq!(claude.max_tokens, 4096);
        assert!((claude.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn storage_and_logging_default() {
        let config = Config::from_toml(VALID_TOML).unwrap();
        assert!(config.storage.enabled);
        assert_eq!(config.storage.data_directory, "./data");
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.directory.is_empty());
    }

    #[test]
    fn rejects_unknown_default_model() {
        let toml = VALID_TOML.replace("default_model = \"local\"", "default_model = \"missing\"");
        let err = Config::from_toml(&toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing"));
        assert!(msg.contains("claude") && msg.contains("local"), "lists available: {msg}");
    }

    #[test]
    fn rejects_unknown_default_agent() {
        let toml = VALID_TOML.replace("default_agent = \"general\"", "default_agent = \"nope\"");
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("general"));
    }

    #[test]
    fn rejects_bedrock_without_model_id() {
        let toml = VALID_TOML.replace(
            "model_id = \"anthropic.claude-3-5-sonnet-20241022-v2:0\"\n",
            "",
        );
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("model_id"));
    }

    #[test]
    fn rejects_openai_without_base_url() {
        let toml = VALID_TOML.replace("base_url = \"http://localhost:11434/v1\"\n", "");
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let toml = VALID_TOML.replace("temperature = 0.7", "temperature = 3.5");
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn rejects_zero_max_tokens() {
        let toml = VALID_TOML.replace("max_tokens = 2048", "max_tokens = 0");
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("max_tokens"));
    }

    #[test]
    fn rejects_invalid_provider_kind() {
        let toml = VALID_TOML.replace("provider = \"bedrock\"", "provider = \"mystery\"");
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn agent_knowledge_sources_parse() {
        let toml = format!(
            "{VALID_TOML}\n\
             [[agents.general.knowledge_sources]]\n\
             name = \"Docs\"\n\
             url = \"https://example.com/docs\"\n\
             keywords = [\"api\", \"endpoint\"]\n\
             topics = [\"reference\"]\n"
        );
        let config = Config::from_toml(&toml).unwrap();
        let sources = &config.agents["general"].knowledge_sources;
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].keywords, vec!["api", "endpoint"]);
        assert_eq!(sources[0].cache_ttl_hours, 24);
    }

    #[test]
    fn search_paths_prefer_custom() {
        let custom = PathBuf::from("/tmp/custom.toml");
        let paths = config_search_paths(Some(&custom));
        assert_eq!(paths[0], custom);
        assert!(paths.len() >= 2);
    }

    #[test]
    fn load_reports_searched_paths_when_missing() {
        let err = Config::load(Some(Path::new("/nonexistent/murmur.toml"))).unwrap_err();
        assert!(err.to_string().contains("No configuration file found"));
    }

    #[test]
    fn load_reads_custom_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("murmur.toml");
        std::fs::write(&path, VALID_TOML).unwrap();
        let config = Config::load(Some(&path)).expect("should load");
        assert_eq!(config.app.title, "Murmur");
    }
}
