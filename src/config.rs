use std::env::VarError;
use std::fmt;

use crate::error::ConfigError;
use crate::store::DEFAULT_TOMBSTONE_CAPACITY;

/// Environment variable holding the database connection string by default
pub const DEFAULT_CONNECTION_STRING_VAR: &str = "SQLConnectionString";

/// Startup settings of the injection extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConfig {
    pub connection_string_var: String,
    pub tombstone_capacity: usize,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            connection_string_var: DEFAULT_CONNECTION_STRING_VAR.to_string(),
            tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
        }
    }
}

impl ExtensionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_string_var(mut self, name: impl Into<String>) -> Self {
        self.connection_string_var = name.into();
        self
    }

    pub fn with_tombstone_capacity(mut self, capacity: usize) -> Self {
        self.tombstone_capacity = capacity;
        self
    }

    /// Read the connection string from the process environment
    pub fn connection_string(&self) -> Result<ConnectionString, ConfigError> {
        self.connection_string_from(|name| std::env::var(name))
    }

    /// Read the connection string through an arbitrary lookup
    pub fn connection_string_from(
        &self,
        lookup: impl FnOnce(&str) -> Result<String, VarError>,
    ) -> Result<ConnectionString, ConfigError> {
        let name = &self.connection_string_var;
        let value = lookup(name).map_err(|err| match err {
            VarError::NotPresent => ConfigError::MissingVariable { name: name.clone() },
            VarError::NotUnicode(_) => ConfigError::NotUnicode { name: name.clone() },
        })?;
        let value = value.trim();
        if value.is_empty() {
            return Err(ConfigError::EmptyVariable { name: name.clone() });
        }
        Ok(ConnectionString(value.to_string()))
    }
}

/// Connection string of the persistence collaborator.
///
/// Registered as a singleton by the extension. Its value is kept out of `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString(String);

impl ConnectionString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionString(<redacted>)")
    }
}
