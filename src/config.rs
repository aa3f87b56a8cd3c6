//! Configuration manager for accounts.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_PORT: u16 = 8888;
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public URL of current instance, used to build activation links.
    pub url: String,
    /// Listening port.
    pub port: u16,
    #[serde(skip_deserializing)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Session tokens lifetimes and claims.
    #[serde(skip_serializing)]
    pub token: Token,
    /// Email activation links.
    #[serde(skip_serializing)]
    pub activation: Activation,
    /// Password policy.
    #[serde(skip_serializing)]
    pub password: Password,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to automatic mail sending.
    #[serde(skip_serializing)]
    pub mail: Option<Mail>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            url: "http://localhost:8888/".to_owned(),
            port: DEFAULT_PORT,
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            token: Token::default(),
            activation: Activation::default(),
            password: Password::default(),
            argon2: None,
            postgres: None,
            mail: None,
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

/// Json Web Token configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Token {
    /// Access token lifetime, in seconds.
    pub access_lifetime: u64,
    /// Refresh token lifetime, in seconds.
    pub refresh_lifetime: u64,
    /// Update token audience.
    pub audience: String,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            access_lifetime: 60 * 60,
            refresh_lifetime: 60 * 60 * 24,
            audience: env!("CARGO_PKG_NAME").to_owned(),
        }
    }
}

/// Activation links configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Activation {
    /// Number of days an activation link stays usable.
    pub timeout_days: u64,
}

impl Default for Activation {
    fn default() -> Self {
        Self { timeout_days: 3 }
    }
}

/// Password policy configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Password {
    pub min_length: usize,
    pub max_length: usize,
    /// Dropbox password strength measurement, minimum accepted score.
    pub zxcvbn: Option<u8>,
}

impl Default for Password {
    fn default() -> Self {
        Self {
            min_length: 9,
            max_length: 20,
            zxcvbn: None,
        }
    }
}

/// SMTP relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    /// SMTP relay hostname.
    pub host: String,
    /// SMTP relay port. Defaults to the transport default.
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// `From` header of every sent email.
    pub from: String,
    /// Encryption layer.
    pub tls: Option<bool>,
    /// Number of delivery workers.
    pub workers: Option<usize>,
    /// Maximum pending jobs before enqueuing waits.
    pub queue_size: Option<usize>,
    /// Delivery attempts before a job is dropped.
    pub max_attempts: Option<u32>,
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Instance version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let mut config: Configuration =
                    match serde_yaml::from_reader(file) {
                        Ok(config) => config,
                        Err(err) => {
                            return Ok(Arc::new(self.error(err)));
                        },
                    };

                // set app version.
                config.version = VERSION.to_owned();

                // normalize URLs.
                config.url = self.normalize_url(&config.url)?;

                Ok(Arc::new(config))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found or invalid");
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml() {
        let config: Configuration = serde_yaml::from_str(
            "name: test\nurl: example.com\ntoken:\n  access_lifetime: 60\n",
        )
        .unwrap();

        assert_eq!(config.name, "test");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.token.access_lifetime, 60);
        assert_eq!(config.token.refresh_lifetime, 60 * 60 * 24);
        assert_eq!(config.activation.timeout_days, 3);
        assert_eq!(config.password.min_length, 9);
        assert!(config.postgres.is_none());
    }

    #[test]
    fn test_normalize_url() {
        let config = Configuration::default();

        assert_eq!(
            config.normalize_url("example.com").unwrap(),
            "https://example.com/"
        );
        assert_eq!(
            config.normalize_url("http://localhost:8888").unwrap(),
            "http://localhost:8888/"
        );
    }

    #[test]
    fn test_missing_file_fallback() {
        let config = Configuration::default()
            .path(PathBuf::from("does/not/exist.yaml"))
            .read()
            .unwrap();

        assert_eq!(config.version(), VERSION);
    }
}
