//! Configuration error type. Rich enough for `--validate-configs` to print a
//! useful diagnostic, plain enough not to reimplement the teacher's full
//! KDL-diagnostics machinery for a flat TOML file.

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}")]
    #[diagnostic(help("check the path passed via --config"))]
    Io { path: String, source: std::io::Error },

    #[error("failed to parse TOML configuration: {0}")]
    #[diagnostic(help("check the TOML syntax and table names against the example config"))]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    #[diagnostic(help("fix the offending resource or referrer entry and retry"))]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
