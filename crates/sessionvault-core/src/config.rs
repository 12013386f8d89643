//! Configuration for session managers and their store connection.

use std::{fmt, path::Path, time::Duration};

use serde::Deserialize;

use crate::{error::ConfigError, session::DEFAULT_MAX_INACTIVE_INTERVAL};

/// Collection used when none is configured.
pub const DEFAULT_COLLECTION_NAME: &str = "tomcat_user_sessions";

/// Authentication database used when none is configured.
pub const DEFAULT_ADMIN_DATABASE: &str = "admin";

/// Port assumed for hosts given without one.
pub const DEFAULT_PORT: u16 = 27017;

/// Manager and store configuration.
///
/// Idle thresholds are in seconds; a negative value disables the check.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub database_name: String,
    pub collection_name: String,

    /// Hosts as `host` or `host:port`.
    pub hosts: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub admin_database: String,

    /// Run the expiry sweep every this many background ticks.
    pub process_expires_frequency: u32,
    /// Seconds between background ticks. Zero disables the background task.
    pub background_interval_secs: u64,

    /// Back up sessions idle at least this long, keeping them in memory.
    pub max_idle_backup: i64,
    /// Never swap out sessions idle less than this.
    pub min_idle_swap: i64,
    /// Swap out sessions idle at least this long.
    pub max_idle_swap: i64,
    /// Swap out idle sessions once more than this many are active.
    pub max_active_sessions: i64,

    /// Save active sessions on stop so a restart can reload them.
    pub save_on_restart: bool,
    /// Idle timeout given to new sessions.
    pub default_max_inactive_interval: i32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            database_name: String::new(),
            collection_name: DEFAULT_COLLECTION_NAME.to_string(),
            hosts: Vec::new(),
            username: None,
            password: None,
            admin_database: DEFAULT_ADMIN_DATABASE.to_string(),
            process_expires_frequency: 6,
            background_interval_secs: 10,
            max_idle_backup: 5,
            min_idle_swap: -1,
            max_idle_swap: 0,
            max_active_sessions: -1,
            save_on_restart: true,
            default_max_inactive_interval: DEFAULT_MAX_INACTIVE_INTERVAL,
        }
    }
}

impl ManagerConfig {
    /// Create a configuration for the given database with default values.
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML for this type.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!(
            path = %path.display(),
            database = %config.database_name,
            collection = %config.collection_name,
            "Loaded session manager configuration"
        );
        Ok(config)
    }

    #[must_use]
    pub fn with_collection_name(mut self, name: impl Into<String>) -> Self {
        self.collection_name = name.into();
        self
    }

    #[must_use]
    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_admin_database(mut self, name: impl Into<String>) -> Self {
        self.admin_database = name.into();
        self
    }

    #[must_use]
    pub fn with_process_expires_frequency(mut self, ticks: u32) -> Self {
        self.process_expires_frequency = ticks;
        self
    }

    #[must_use]
    pub fn with_background_interval(mut self, interval: Duration) -> Self {
        self.background_interval_secs = interval.as_secs();
        self
    }

    #[must_use]
    pub fn with_max_idle_backup(mut self, seconds: i64) -> Self {
        self.max_idle_backup = seconds;
        self
    }

    #[must_use]
    pub fn with_min_idle_swap(mut self, seconds: i64) -> Self {
        self.min_idle_swap = seconds;
        self
    }

    #[must_use]
    pub fn with_max_idle_swap(mut self, seconds: i64) -> Self {
        self.max_idle_swap = seconds;
        self
    }

    #[must_use]
    pub fn with_max_active_sessions(mut self, max: i64) -> Self {
        self.max_active_sessions = max;
        self
    }

    #[must_use]
    pub fn with_save_on_restart(mut self, enabled: bool) -> Self {
        self.save_on_restart = enabled;
        self
    }

    #[must_use]
    pub fn with_default_max_inactive_interval(mut self, seconds: i32) -> Self {
        self.default_max_inactive_interval = seconds;
        self
    }

    /// Interval between background ticks, if the background task is enabled.
    #[must_use]
    pub const fn background_interval(&self) -> Option<Duration> {
        if self.background_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.background_interval_secs))
        }
    }

    /// Check the settings every manager needs.
    ///
    /// # Errors
    /// Returns error if a required field is empty or out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_name.trim().is_empty() {
            return Err(ConfigError::Missing("database_name"));
        }
        if self.collection_name.trim().is_empty() {
            return Err(ConfigError::Missing("collection_name"));
        }
        if self.process_expires_frequency == 0 {
            return Err(ConfigError::Invalid {
                field: "process_expires_frequency",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Build connection settings for opening a connection of our own.
    ///
    /// # Errors
    /// Returns error if hosts or credentials are missing, or a host is malformed.
    pub fn connection_settings(&self) -> Result<ConnectionSettings, ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Missing("hosts"));
        }
        let username =
            non_empty(self.username.as_deref()).ok_or(ConfigError::Missing("username"))?;
        let password =
            non_empty(self.password.as_deref()).ok_or(ConfigError::Missing("password"))?;
        let hosts = self
            .hosts
            .iter()
            .flat_map(|entry| entry.split(','))
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(ServerAddress::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let admin_database =
            non_empty(Some(self.admin_database.as_str())).unwrap_or(DEFAULT_ADMIN_DATABASE);

        Ok(ConnectionSettings {
            hosts,
            username: username.to_string(),
            password: password.to_string(),
            admin_database: admin_database.to_string(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// A database host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    /// Parse `host` or `host:port`.
    ///
    /// # Errors
    /// Returns error if the host is empty or the port is not a valid number.
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| ConfigError::Invalid {
                    field: "hosts",
                    reason: format!("bad port in {entry:?}: {e}"),
                })?;
                (host, port)
            }
            None => (entry, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(ConfigError::Invalid {
                field: "hosts",
                reason: format!("empty host in {entry:?}"),
            });
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything a driver needs to open its own connection.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub hosts: Vec<ServerAddress>,
    pub username: String,
    pub password: String,
    pub admin_database: String,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("hosts", &self.hosts)
            .field("username", &self.username)
            .field("password", &"***")
            .field("admin_database", &self.admin_database)
            .finish()
    }
}
