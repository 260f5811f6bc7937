use crate::config::env::{self, EnvKey};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const DEFAULT_ENV_DIR: &str = "/app/env";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment profile '{0}', expected 'local' or 'cloud'")]
    InvalidProfile(String),

    #[error("Missing environment variable {key}")]
    Missing {
        key: &'static str,
        #[source]
        source: std::env::VarError,
    },

    #[error("{key} must be at least 1")]
    ZeroCapacity { key: &'static str },
}

/// Deployment profile. Selects which dotenv file seeds the process environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Local,
    Cloud,
}

impl Profile {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim() {
            "local" => Ok(Profile::Local),
            "cloud" => Ok(Profile::Cloud),
            other => Err(ConfigError::InvalidProfile(other.to_string())),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::parse(&env::get_or(EnvKey::Profile, "local"))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Local => "local",
            Profile::Cloud => "cloud",
        }
    }

    pub fn env_file(&self, dir: &Path) -> PathBuf {
        match self {
            Profile::Local => dir.join(".env"),
            Profile::Cloud => dir.join(".env.cloud"),
        }
    }

    pub fn env_path(&self) -> PathBuf {
        self.env_file(Path::new(&env::get_or(EnvKey::EnvDir, DEFAULT_ENV_DIR)))
    }

    /// Loads the profile's dotenv file. Variables already set in the process win.
    pub fn load(&self) -> Result<PathBuf, dotenvy::Error> {
        let path = self.env_path();
        dotenvy::from_path(&path)?;
        Ok(path)
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub profile: Profile,
    pub database: DatabaseConfig,
    pub amqp_url: String,
    pub amqp_queue: String,
    pub amqp_prefetch: u16,
    pub max_concurrent_jobs: usize,
    pub output_dir: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub transcode_timeout: Option<Duration>,
    pub dead_letter_malformed: bool,
}

fn required(key: EnvKey) -> Result<String, ConfigError> {
    let name = key.as_str();
    env::get(key).map_err(|source| ConfigError::Missing { key: name, source })
}

/// One unacked delivery per job slot, so the broker never pushes work the gate must refuse.
fn default_prefetch(max_concurrent_jobs: usize) -> u16 {
    u16::try_from(max_concurrent_jobs).unwrap_or(u16::MAX)
}

impl AppConfig {
    pub fn new(profile: Profile) -> Result<Self, ConfigError> {
        let max_concurrent_jobs = env::get_parsed(EnvKey::MaxConcurrentJobs, 1);
        let config = Self {
            profile,
            database: DatabaseConfig {
                host: required(EnvKey::DatabaseHost)?,
                port: env::get_parsed(EnvKey::DatabasePort, 5432),
                username: required(EnvKey::DatabaseUsername)?,
                password: required(EnvKey::DatabasePassword)?,
                name: required(EnvKey::DatabaseName)?,
                max_connections: env::get_parsed(EnvKey::DatabaseMaxConnections, 5),
            },
            amqp_url: env::get_or(EnvKey::AmqpUrl, "amqp://127.0.0.1:5672/%2f"),
            amqp_queue: env::get_or(EnvKey::AmqpQueue, "converter-subscription"),
            amqp_prefetch: env::get_parsed(
                EnvKey::AmqpPrefetch,
                default_prefetch(max_concurrent_jobs),
            ),
            max_concurrent_jobs,
            output_dir: PathBuf::from(env::get_or(EnvKey::OutputDir, "/app/video_files/out")),
            ffmpeg_bin: PathBuf::from(env::get_or(EnvKey::FfmpegBin, "ffmpeg")),
            transcode_timeout: env::get_optional::<u64>(EnvKey::TranscodeTimeoutSecs)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            dead_letter_malformed: env::get_parsed(EnvKey::DeadLetterMalformed, false),
        };

        config.validate()
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ZeroCapacity {
                key: EnvKey::MaxConcurrentJobs.as_str(),
            });
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::ZeroCapacity {
                key: EnvKey::DatabaseMaxConnections.as_str(),
            });
        }
        // A prefetch of 0 means "unlimited" to RabbitMQ.
        if self.amqp_prefetch == 0 {
            return Err(ConfigError::ZeroCapacity {
                key: EnvKey::AmqpPrefetch.as_str(),
            });
        }
        if usize::from(self.amqp_prefetch) > self.max_concurrent_jobs {
            warn!(
                prefetch = self.amqp_prefetch,
                max_concurrent_jobs = self.max_concurrent_jobs,
                "{} exceeds {}; surplus deliveries will be nacked and redelivered while jobs run",
                EnvKey::AmqpPrefetch.as_str(),
                EnvKey::MaxConcurrentJobs.as_str()
            );
        }
        Ok(self)
    }
}
