//! Process configuration read from `NOTIFY_*` environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `NOTIFY_DATABASE_PATH` | `notifications.db` |
//! | `NOTIFY_PHONE_KEY` | required, base64 of 32 bytes |
//! | `NOTIFY_SMS_UNIT_COST_CENTS` | 5 |
//! | `NOTIFY_VOICE_UNIT_COST_CENTS` | 20 |
//! | `NOTIFY_SMS_SIGNATURE` | unset |
//! | `NOTIFY_TEMPLATE_CHECK_IN_REMINDER` | unset |
//! | `NOTIFY_TEMPLATE_CHECK_IN_TIMEOUT` | unset |
//! | `NOTIFY_TEMPLATE_JOURNEY_TIMEOUT` | unset |
//! | `NOTIFY_TASK_LEASE_SECS` | 300 |
//! | `NOTIFY_TASK_MAX_ATTEMPTS` | 3 |
//! | `NOTIFY_IDEMPOTENCY_PROCESSING_SECS` | 600 |
//! | `NOTIFY_IDEMPOTENCY_COMPLETED_SECS` | 86400 |
//! | `NOTIFY_LOCK_TTL_SECS` | 60 |
//!
//! Unset and empty variables take their defaults. A variable that is set but
//! does not parse is an error rather than silently defaulted.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::cache::{DEFAULT_COMPLETED_TTL, DEFAULT_LOCK_TTL, DEFAULT_PROCESSING_TTL};
use crate::contacts::{CipherError, PhoneCipher};
use crate::delivery::{DEFAULT_LEASE, DEFAULT_MAX_ATTEMPTS, EngineConfig, Pricing};
use crate::templates::TemplateConfig;
use crate::worker::WorkerConfig;

const DEFAULT_DATABASE_PATH: &str = "notifications.db";

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("NOTIFY_PHONE_KEY is unusable: {0}")]
    PhoneKey(#[from] CipherError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Everything the binary needs to assemble a worker.
#[derive(Clone)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    phone_key: Vec<u8>,
    pub pricing: Pricing,
    pub templates: TemplateConfig,
    pub lease: Duration,
    pub max_attempts: u32,
    pub idempotency_processing_ttl: Duration,
    pub idempotency_completed_ttl: Duration,
    pub lock_ttl: Duration,
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("database_path", &self.database_path)
            .field("pricing", &self.pricing)
            .field("templates", &self.templates)
            .field("lease", &self.lease)
            .field("max_attempts", &self.max_attempts)
            .field("idempotency_processing_ttl", &self.idempotency_processing_ttl)
            .field("idempotency_completed_ttl", &self.idempotency_completed_ttl)
            .field("lock_ttl", &self.lock_ttl)
            .finish_non_exhaustive()
    }
}

impl PipelineConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup };

        let key_text = vars
            .string("NOTIFY_PHONE_KEY")
            .ok_or(ConfigError::Missing("NOTIFY_PHONE_KEY"))?;
        let phone_key = BASE64
            .decode(key_text.trim())
            .map_err(CipherError::from)?;
        PhoneCipher::new(&phone_key)?;

        let pricing = Pricing {
            sms_cents: vars.parse("NOTIFY_SMS_UNIT_COST_CENTS", Pricing::DEFAULT.sms_cents)?,
            voice_cents: vars.parse("NOTIFY_VOICE_UNIT_COST_CENTS", Pricing::DEFAULT.voice_cents)?,
        };
        positive("NOTIFY_SMS_UNIT_COST_CENTS", pricing.sms_cents)?;
        positive("NOTIFY_VOICE_UNIT_COST_CENTS", pricing.voice_cents)?;

        let max_attempts = vars.parse("NOTIFY_TASK_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        positive("NOTIFY_TASK_MAX_ATTEMPTS", i64::from(max_attempts))?;

        Ok(PipelineConfig {
            database_path: vars
                .string("NOTIFY_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            phone_key,
            pricing,
            templates: TemplateConfig {
                signature: vars.string("NOTIFY_SMS_SIGNATURE"),
                check_in_reminder: vars.string("NOTIFY_TEMPLATE_CHECK_IN_REMINDER"),
                check_in_timeout: vars.string("NOTIFY_TEMPLATE_CHECK_IN_TIMEOUT"),
                journey_timeout: vars.string("NOTIFY_TEMPLATE_JOURNEY_TIMEOUT"),
            },
            lease: vars.secs("NOTIFY_TASK_LEASE_SECS", DEFAULT_LEASE)?,
            max_attempts,
            idempotency_processing_ttl: vars
                .secs("NOTIFY_IDEMPOTENCY_PROCESSING_SECS", DEFAULT_PROCESSING_TTL)?,
            idempotency_completed_ttl: vars
                .secs("NOTIFY_IDEMPOTENCY_COMPLETED_SECS", DEFAULT_COMPLETED_TTL)?,
            lock_ttl: vars.secs("NOTIFY_LOCK_TTL_SECS", DEFAULT_LOCK_TTL)?,
        })
    }

    /// Builds the phone cipher from the configured key.
    pub fn cipher(&self) -> Result<PhoneCipher> {
        Ok(PhoneCipher::new(&self.phone_key)?)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pricing: self.pricing,
            templates: self.templates.clone(),
            lease: self.lease,
            max_attempts: self.max_attempts,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            idempotency_processing_ttl: self.idempotency_processing_ttl,
            idempotency_completed_ttl: self.idempotency_completed_ttl,
            lock_ttl: self.lock_ttl,
            ..WorkerConfig::default()
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// The trimmed value of `var`, treating empty as unset.
    fn string(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration> {
        let secs = self.parse(var, default.as_secs())?;
        if secs == 0 {
            return Err(ConfigError::Invalid {
                var,
                value: secs.to_string(),
                reason: "must be at least one second".to_string(),
            });
        }
        Ok(Duration::from_secs(secs))
    }
}

fn positive(var: &'static str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(())
}
