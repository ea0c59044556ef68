//! Configuration Vault – reads/writes `~/.solmem/config.toml`.

use serde::{Deserialize, Serialize};
use solmem_runtime::{CallPolicy, PipelineSettings};
use solmem_types::PipelineError;
use std::env::VarError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The `[pipeline]` table: options every stage run recognises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum photos processed per run.
    #[serde(default = "default_sampled_image_count")]
    pub sampled_image_count: usize,

    /// Percentage a detected label must exceed to be kept.
    #[serde(default = "default_min_label_confidence")]
    pub min_label_confidence: f32,

    /// Earth days per sol, used for date → sol conversion.
    #[serde(default = "default_sol_length_in_days")]
    pub sol_length_in_days: f64,

    /// Per-photo workers inside Generate and Embed.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Timeout of every collaborator call, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Attempts per collaborator call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sampled_image_count: default_sampled_image_count(),
            min_label_confidence: default_min_label_confidence(),
            sol_length_in_days: default_sol_length_in_days(),
            max_concurrency: default_max_concurrency(),
            call_timeout_secs: default_call_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Persisted user configuration stored in `~/.solmem/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database holding the clock, pipeline log and vector index.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory generated memory text is written to.
    #[serde(default = "default_content_root")]
    pub content_root: PathBuf,

    /// Base URL of the Mars Rover Photos API.
    #[serde(default = "default_imagery_base_url")]
    pub imagery_base_url: String,

    /// api.nasa.gov key (stored as plain text – the file is written 0o600).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub imagery_api_key: String,

    #[serde(default = "default_rover")]
    pub rover: String,

    /// Only photos from this camera are considered.
    #[serde(default = "default_camera")]
    pub camera: String,

    /// Client-side limit on imagery API requests; `0` disables it.
    #[serde(default = "default_imagery_requests_per_second")]
    pub imagery_requests_per_second: u32,

    /// URL that accepts image bytes and returns detected labels.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label_endpoint: String,

    /// OpenAI-compatible server for text generation and embeddings.
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub llm_api_key: String,

    #[serde(default = "default_text_model")]
    pub text_model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("content_root", &self.content_root)
            .field("imagery_base_url", &self.imagery_base_url)
            .field(
                "imagery_api_key",
                if self.imagery_api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("rover", &self.rover)
            .field("camera", &self.camera)
            .field("imagery_requests_per_second", &self.imagery_requests_per_second)
            .field("label_endpoint", &self.label_endpoint)
            .field("llm_base_url", &self.llm_base_url)
            .field(
                "llm_api_key",
                if self.llm_api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("text_model", &self.text_model)
            .field("embedding_model", &self.embedding_model)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

fn data_dir() -> PathBuf {
    home_dir().join(".solmem")
}

fn default_database_path() -> PathBuf {
    data_dir().join("solmem.db")
}
fn default_content_root() -> PathBuf {
    data_dir().join("content")
}
fn default_imagery_base_url() -> String {
    solmem_runtime::nasa::DEFAULT_BASE_URL.to_string()
}
fn default_rover() -> String {
    solmem_runtime::nasa::DEFAULT_ROVER.to_string()
}
fn default_camera() -> String {
    solmem_runtime::nasa::DEFAULT_CAMERA.to_string()
}
fn default_imagery_requests_per_second() -> u32 {
    2
}
fn default_llm_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_text_model() -> String {
    solmem_runtime::llm_driver::DEFAULT_TEXT_MODEL.to_string()
}
fn default_embedding_model() -> String {
    solmem_runtime::llm_driver::DEFAULT_EMBEDDING_MODEL.to_string()
}
fn default_sampled_image_count() -> usize {
    5
}
fn default_min_label_confidence() -> f32 {
    95.0
}
fn default_sol_length_in_days() -> f64 {
    solmem_types::sol::SOL_LENGTH_IN_DAYS
}
fn default_max_concurrency() -> usize {
    4
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            content_root: default_content_root(),
            imagery_base_url: default_imagery_base_url(),
            imagery_api_key: String::new(),
            rover: default_rover(),
            camera: default_camera(),
            imagery_requests_per_second: default_imagery_requests_per_second(),
            label_endpoint: String::new(),
            llm_base_url: default_llm_base_url(),
            llm_api_key: String::new(),
            text_model: default_text_model(),
            embedding_model: default_embedding_model(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Check that every option a pipeline run needs is present and sane.
    ///
    /// Runs before any store is opened, so a failure never reaches the
    /// pipeline log.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let missing = |name: &str| {
            PipelineError::Configuration(format!(
                "{name} is not set (add it to {} or set SOLMEM_{})",
                config_path().display(),
                name.to_ascii_uppercase()
            ))
        };
        if self.imagery_api_key.trim().is_empty() {
            return Err(missing("imagery_api_key"));
        }
        if self.label_endpoint.trim().is_empty() {
            return Err(missing("label_endpoint"));
        }
        if self.llm_base_url.trim().is_empty() {
            return Err(missing("llm_base_url"));
        }
        self.pipeline_settings().validate()
    }

    /// Runtime view of the `[pipeline]` table.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        let p = &self.pipeline;
        PipelineSettings {
            sampled_image_count: p.sampled_image_count,
            min_label_confidence: p.min_label_confidence,
            sol_length_in_days: p.sol_length_in_days,
            max_concurrency: p.max_concurrency,
            call_policy: CallPolicy::new(Duration::from_secs(p.call_timeout_secs), p.max_attempts),
        }
    }
}

/// Return the path to `~/.solmem/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &Path) -> PathBuf {
    home.join(".solmem").join("config.toml")
}

/// Load the config from disk (defaults when the file is absent), then apply
/// environment overrides.
pub fn load() -> Result<Config, String> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg).map_err(|e| e.to_string())?;
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `SOLMEM_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SOLMEM_DATABASE_PATH` | `database_path` |
/// | `SOLMEM_CONTENT_ROOT` | `content_root` |
/// | `SOLMEM_IMAGERY_API_KEY` | `imagery_api_key` |
/// | `SOLMEM_LABEL_ENDPOINT` | `label_endpoint` |
/// | `SOLMEM_LLM_BASE_URL` | `llm_base_url` |
/// | `SOLMEM_LLM_API_KEY` | `llm_api_key` |
/// | `SOLMEM_TEXT_MODEL` | `text_model` |
/// | `SOLMEM_EMBEDDING_MODEL` | `embedding_model` |
/// | `SOLMEM_SAMPLED_IMAGE_COUNT` | `pipeline.sampled_image_count` |
/// | `SOLMEM_MAX_CONCURRENCY` | `pipeline.max_concurrency` |
///
/// # Errors
///
/// [`PipelineError::Configuration`] when a variable is set but unusable
/// (not unicode, or not a whole number for the counts).
pub fn apply_env_overrides(cfg: &mut Config) -> Result<(), PipelineError> {
    apply_overrides(cfg, |name| std::env::var(name))
}

pub(crate) fn apply_overrides(
    cfg: &mut Config,
    lookup: impl Fn(&str) -> Result<String, VarError>,
) -> Result<(), PipelineError> {
    let var = |name: &str| match lookup(name) {
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(PipelineError::Configuration(format!(
            "{name} is not valid unicode"
        ))),
    };
    let count = |name: &str| -> Result<Option<usize>, PipelineError> {
        var(name)?
            .map(|v| {
                v.trim().parse::<usize>().map_err(|e| {
                    PipelineError::Configuration(format!("{name}={v:?} is not a whole number: {e}"))
                })
            })
            .transpose()
    };

    if let Some(v) = var("SOLMEM_DATABASE_PATH")? {
        cfg.database_path = PathBuf::from(v);
    }
    if let Some(v) = var("SOLMEM_CONTENT_ROOT")? {
        cfg.content_root = PathBuf::from(v);
    }
    if let Some(v) = var("SOLMEM_IMAGERY_API_KEY")? {
        cfg.imagery_api_key = v;
    }
    if let Some(v) = var("SOLMEM_LABEL_ENDPOINT")? {
        cfg.label_endpoint = v;
    }
    if let Some(v) = var("SOLMEM_LLM_BASE_URL")? {
        cfg.llm_base_url = v;
    }
    if let Some(v) = var("SOLMEM_LLM_API_KEY")? {
        cfg.llm_api_key = v;
    }
    if let Some(v) = var("SOLMEM_TEXT_MODEL")? {
        cfg.text_model = v;
    }
    if let Some(v) = var("SOLMEM_EMBEDDING_MODEL")? {
        cfg.embedding_model = v;
    }
    if let Some(n) = count("SOLMEM_SAMPLED_IMAGE_COUNT")? {
        cfg.pipeline.sampled_image_count = n;
    }
    if let Some(n) = count("SOLMEM_MAX_CONCURRENCY")? {
        cfg.pipeline.max_concurrency = n;
    }
    Ok(())
}

/// Save the config to disk, creating `~/.solmem/` if necessary.
pub fn save(cfg: &Config) -> Result<PathBuf, String> {
    let path = config_path();
    save_to(cfg, &path)?;
    Ok(path)
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Restrict the config directory to the owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write (rw-------) on Unix: the file holds API keys.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
