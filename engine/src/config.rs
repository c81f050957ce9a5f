use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf};

use gee_providers::openai::DEFAULT_BASE_URL;

use crate::driver::{DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_FUNCTION_CALLS, DEFAULT_MODEL, DriverConfig};

const DATA_DIR_NAME: &str = ".gee";
const CONFIG_FILE_NAME: &str = "config.toml";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

// Default value function for serde (bool::default() is false, so only true needs a fn)
pub(crate) const fn default_true() -> bool {
    true
}

/// Contents of `~/.gee/config.toml`. Every section and key is optional.
///
/// ```toml
/// [app]
/// model = "gpt-4"
/// system_prompt = "You are terse."
/// data_dir = "~/notes/gee"
/// log = true
///
/// [context]
/// max_tokens = 6000
///
/// [request]
/// max_attempts = 3
/// max_function_calls = 10
///
/// [openai]
/// api_key = "${OPENAI_API_KEY}"
/// base_url = "https://api.openai.com/v1"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeeConfig {
    pub app: Option<AppConfig>,
    pub context: Option<ContextConfig>,
    pub request: Option<RequestConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub data_dir: Option<String>,
    /// Write a timestamped log after every turn.
    #[serde(default = "default_true")]
    pub log: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    /// Token budget per request; `<= 0` sends the whole history.
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestConfig {
    pub max_attempts: Option<u32>,
    pub max_function_calls: Option<u32>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAIConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

// Manual Debug impl to prevent leaking API keys in logs.
impl std::fmt::Debug for OpenAIConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIConfig")
            .field(
                "api_key",
                &if self.api_key.is_some() { "[REDACTED]" } else { "None" },
            )
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Replace `${VAR}` references with the variable's value. Unset variables
/// become empty; an unclosed `${` is kept as written.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Expand `~/` against the home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| expand_env_vars(v)).filter(|v| !v.is_empty())
}

impl GeeConfig {
    /// Load the config from the default location. A missing file yields the
    /// defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file; using defaults");
            return Ok(Self::default());
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        warn_if_readable_by_others(path);

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn model(&self) -> String {
        non_empty(self.app.as_ref().and_then(|a| a.model.as_ref()))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    #[must_use]
    pub fn system_prompt(&self) -> Option<String> {
        non_empty(self.app.as_ref().and_then(|a| a.system_prompt.as_ref()))
    }

    #[must_use]
    pub fn log_enabled(&self) -> bool {
        self.app.as_ref().is_none_or(|a| a.log)
    }

    /// Configured data directory, else `~/.gee`.
    #[must_use]
    pub fn data_dir(&self) -> Option<PathBuf> {
        non_empty(self.app.as_ref().and_then(|a| a.data_dir.as_ref()))
            .map(|dir| expand_home(&dir))
            .or_else(default_data_dir)
    }

    #[must_use]
    pub fn max_tokens(&self) -> i64 {
        self.context
            .as_ref()
            .and_then(|c| c.max_tokens)
            .unwrap_or(-1)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.request
            .as_ref()
            .and_then(|r| r.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    #[must_use]
    pub fn max_function_calls(&self) -> u32 {
        self.request
            .as_ref()
            .and_then(|r| r.max_function_calls)
            .unwrap_or(DEFAULT_MAX_FUNCTION_CALLS)
    }

    /// API key from the config file, falling back to `OPENAI_API_KEY`.
    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        non_empty(self.openai.as_ref().and_then(|o| o.api_key.as_ref()))
            .or_else(|| env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()))
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        non_empty(self.openai.as_ref().and_then(|o| o.base_url.as_ref()))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    /// Driver defaults from this config.
    #[must_use]
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            model: self.model(),
            max_tokens: self.max_tokens(),
            max_attempts: self.max_attempts(),
            max_function_calls: self.max_function_calls(),
            ..DriverConfig::default()
        }
    }
}

/// The config file may hold a literal API key; flag it if others can read it.
#[cfg(unix)]
fn warn_if_readable_by_others(path: &Path) {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let Ok(metadata) = fs::metadata(path) else {
        return;
    };
    // SAFETY: getuid has no preconditions and cannot fail.
    let our_uid = unsafe { libc::getuid() };
    let mode = metadata.permissions().mode() & 0o777;
    if metadata.uid() == our_uid && mode & 0o077 != 0 {
        tracing::warn!(
            path = %path.display(),
            mode = %format!("{mode:o}"),
            "Config file is readable by other users; consider chmod 600"
        );
    }
}

#[cfg(not(unix))]
fn warn_if_readable_by_others(_path: &Path) {}

#[must_use]
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DATA_DIR_NAME))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    default_data_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}
