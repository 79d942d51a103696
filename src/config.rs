use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Status of config file loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLoadStatus {
    /// Config loaded successfully from existing file
    Loaded,
    /// Created default config file (first run)
    Created,
    /// Error occurred during loading, using defaults.
    Error(String),
}

/// Image generation service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageConfig {
    pub api_host: String,
    pub api_key: String,
    pub engine: String,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    /// How strongly the previous image shapes a regenerated one (0.0..=1.0).
    pub regenerate_strength: f32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            api_host: "https://api.stability.ai".to_string(),
            api_key: String::new(),
            engine: "stable-diffusion-v1-6".to_string(),
            cfg_scale: 7.0,
            width: 512,
            height: 512,
            steps: 15,
            regenerate_strength: 0.75,
        }
    }
}

/// Text generation service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TextConfig {
    pub base_url: String,
    pub api_key: String,
    pub assistant_id: String,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            assistant_id: String::new(),
        }
    }
}

/// Input bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Total word budget of the image wizard, also the bound of a regenerate prompt.
    pub description_words: usize,
    /// Character bound of the backstory description.
    pub backstory_characters: usize,
    pub max_image_styles: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            description_words: 75,
            backstory_characters: 500,
            max_image_styles: 2,
        }
    }
}

/// Where downloads are written
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: ".".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub text: TextConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Expand `~` to home directory in a path string
    pub fn expand_tilde(path: &str) -> PathBuf {
        if let Some(stripped) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(stripped);
        }
        PathBuf::from(path)
    }

    /// Get the expanded download directory
    pub fn output_dir(&self) -> PathBuf {
        Self::expand_tilde(&self.output.directory)
    }
}

/// Loaded configuration with metadata
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_path: PathBuf,
    pub status: ConfigLoadStatus,
}

/// Get the platform-appropriate config directory
fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("dev", "character-designer", "character-designer")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the full path to the config file
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

/// Load configuration from file, environment, and defaults.
///
/// An explicit path (from `--config`) takes precedence over the platform path.
pub fn load_config(explicit: Option<PathBuf>) -> LoadedConfig {
    let config_path = match explicit.or_else(get_config_path) {
        Some(path) => path,
        None => {
            warn!("Could not determine config directory, using defaults");
            return LoadedConfig {
                config: apply_env_overrides(Config::default()),
                config_path: PathBuf::from("config.toml"),
                status: ConfigLoadStatus::Error("Could not determine config directory".to_string()),
            };
        }
    };

    debug!("Config path: {:?}", config_path);

    let (config, status) = load_or_create_config(&config_path);
    let config = apply_env_overrides(config);

    LoadedConfig {
        config,
        config_path,
        status,
    }
}

/// Save a config to the given file path.
pub fn save_config(config: &Config, config_path: &Path) -> Result<(), String> {
    let toml_content = toml::to_string_pretty(config).map_err(|e| {
        warn!(error = %e, "config_save_serialize_failed");
        format!("Failed to serialize config: {}", e)
    })?;

    fs::write(config_path, &toml_content).map_err(|e| {
        warn!(path = ?config_path, error = %e, "config_save_write_failed");
        format!("Failed to write config: {}", e)
    })?;

    info!(path = ?config_path, "config_saved");
    Ok(())
}

/// Load config from file, or create default if not exists
fn load_or_create_config(config_path: &Path) -> (Config, ConfigLoadStatus) {
    match fs::read_to_string(config_path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                info!(path = ?config_path, "config_loaded");
                (config, ConfigLoadStatus::Loaded)
            }
            Err(e) => {
                warn!(path = ?config_path, error = %e, "config_parse_failed");
                (
                    Config::default(),
                    ConfigLoadStatus::Error(format!("Malformed TOML: {}", e)),
                )
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => create_default_config(config_path),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            warn!(path = ?config_path, "config_permission_denied");
            (
                Config::default(),
                ConfigLoadStatus::Error("Permission denied reading config".to_string()),
            )
        }
        Err(e) => {
            warn!(path = ?config_path, error = %e, "config_read_failed");
            (
                Config::default(),
                ConfigLoadStatus::Error(format!("Read error: {}", e)),
            )
        }
    }
}

/// Create the default config file
fn create_default_config(config_path: &Path) -> (Config, ConfigLoadStatus) {
    let config = Config::default();

    if let Some(parent) = config_path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        warn!(dir = ?parent, error = %e, "config_dir_create_failed");
        return (
            config,
            ConfigLoadStatus::Error(format!("Could not create config directory: {}", e)),
        );
    }

    match save_config(&config, config_path) {
        Ok(()) => {
            info!(path = ?config_path, "config_created");
            (config, ConfigLoadStatus::Created)
        }
        Err(e) => (config, ConfigLoadStatus::Error(e)),
    }
}

/// Apply environment variable overrides to config
fn apply_env_overrides(config: Config) -> Config {
    apply_overrides(config, |key| env::var(key).ok())
}

fn apply_overrides(mut config: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(host) = var("IMAGE_API_HOST") {
        debug!("Overriding image.api_host from IMAGE_API_HOST");
        config.image.api_host = host;
    }

    if let Some(key) = var("IMAGE_API_KEY") {
        debug!("Overriding image.api_key from IMAGE_API_KEY");
        config.image.api_key = key;
    }

    if let Some(key) = var("OPENAI_API_KEY") {
        debug!("Overriding text.api_key from OPENAI_API_KEY");
        config.text.api_key = key;
    }

    if let Some(id) = var("OPENAI_ASSISTANT_ID") {
        debug!("Overriding text.assistant_id from OPENAI_ASSISTANT_ID");
        config.text.assistant_id = id;
    }

    if let Some(level) = var("CHARACTER_DESIGNER_LOG") {
        debug!("Overriding logging.level from CHARACTER_DESIGNER_LOG");
        config.logging.level = level;
    }

    config
}
