use error_stack::Report;
use graft_kernel::config::ConfigError;
use graft_plugins::ReloadError;
use graft_plugins::hot_reload::LoadError;

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Module error: {0}")]
    LoadError(#[from] LoadError),

    #[error("Plugin error: {0}")]
    PluginError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Report<ReloadError>> for CliError {
    fn from(report: Report<ReloadError>) -> Self {
        CliError::PluginError(format!("{report:?}"))
    }
}
