use std::env;
use std::str::FromStr;
use tracing::warn;

pub enum EnvKey {
    Profile,
    EnvDir,
    DatabaseHost,
    DatabasePort,
    DatabaseUsername,
    DatabasePassword,
    DatabaseName,
    DatabaseMaxConnections,
    AmqpUrl,
    AmqpQueue,
    AmqpPrefetch,
    MaxConcurrentJobs,
    OutputDir,
    FfmpegBin,
    TranscodeTimeoutSecs,
    DeadLetterMalformed,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::Profile => "ENV",
            EnvKey::EnvDir => "ENV_DIR",
            EnvKey::DatabaseHost => "DATABASE_HOST",
            EnvKey::DatabasePort => "DATABASE_PORT",
            EnvKey::DatabaseUsername => "DATABASE_USERNAME",
            EnvKey::DatabasePassword => "DATABASE_PASSWORD",
            EnvKey::DatabaseName => "DATABASE_NAME",
            EnvKey::DatabaseMaxConnections => "DATABASE_MAX_CONNECTIONS",
            EnvKey::AmqpUrl => "AMQP_URL",
            EnvKey::AmqpQueue => "AMQP_QUEUE",
            EnvKey::AmqpPrefetch => "AMQP_PREFETCH",
            EnvKey::MaxConcurrentJobs => "MAX_CONCURRENT_JOBS",
            EnvKey::OutputDir => "OUTPUT_DIR",
            EnvKey::FfmpegBin => "FFMPEG_BIN",
            EnvKey::TranscodeTimeoutSecs => "TRANSCODE_TIMEOUT_SECS",
            EnvKey::DeadLetterMalformed => "DEAD_LETTER_MALFORMED",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

/// Parses a raw value, warning with the key name when it cannot be read as `T`.
fn parse_value<T: FromStr>(key: &EnvKey, raw: &str) -> Option<T> {
    let parsed = raw.trim().parse::<T>().ok();
    if parsed.is_none() {
        warn!(
            key = key.as_str(),
            value = raw,
            "Ignoring unparsable value for {}",
            key.as_str()
        );
    }
    parsed
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    get_optional(key).unwrap_or(default)
}

/// Like [`get_parsed`] but without a fallback: unset or unparsable means `None`.
pub fn get_optional<T: FromStr>(key: EnvKey) -> Option<T> {
    let raw = env::var(key.as_str()).ok()?;
    parse_value(&key, &raw)
}
