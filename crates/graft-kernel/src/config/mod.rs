//! Configuration loading
//!
//! Host and reload settings can be written as YAML, TOML, JSON, INI, RON or
//! JSON5; the format follows the file extension. `${VAR}` and `$VAR`
//! references are replaced from the environment before parsing.

use config::builder::DefaultState;
use config::{Config as Cfg, ConfigBuilder, Environment, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::LazyLock;

pub use config::FileFormat as Format;

static BRACED_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("braced variable pattern is valid")
});

static SIMPLE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("simple variable pattern is valid")
});

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detect the configuration format from a file extension.
///
/// ```rust,ignore
/// use graft_kernel::config::{detect_format, Format};
///
/// assert_eq!(detect_format("graft.toml").unwrap(), Format::Toml);
/// ```
pub fn detect_format(path: impl AsRef<Path>) -> ConfigResult<FileFormat> {
    let ext = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Replace `${VAR}` and `$VAR` references with environment values.
///
/// Unset variables are left as written.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });

    SIMPLE_VAR
        .replace_all(&braced, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

fn deserialize<T>(builder: ConfigBuilder<DefaultState>) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let config = builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

/// Load configuration from a file.
///
/// ```rust,ignore
/// use graft_kernel::config::load_config;
/// use graft_kernel::HotReloadConfig;
///
/// let config: HotReloadConfig = load_config("reload.toml")?;
/// ```
pub fn load_config<T>(path: impl AsRef<Path>) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let path = path.as_ref();
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Parse configuration from a string in an explicit format.
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content);
    deserialize(Cfg::builder().add_source(File::from_str(&substituted, format)))
}

/// Load a file, then apply `PREFIX_SECTION__KEY` environment overrides.
pub fn load_with_env<T>(path: impl AsRef<Path>, env_prefix: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let path = path.as_ref();
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&content);

    deserialize(
        Cfg::builder()
            .add_source(File::from_str(&substituted, format))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            ),
    )
}
