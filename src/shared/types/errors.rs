use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Timed out after {waited_ms}ms waiting for the {resource} lock")]
    LockTimeout {
        resource: &'static str,
        waited_ms: u64,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Authorization log error: {0}")]
    AuthorizationLog(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AdapterError {
    /// Whether this error maps to a `Timeout` outcome rather than `Error`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AdapterError::LockTimeout { .. } | AdapterError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;
