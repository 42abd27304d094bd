//! Layered configuration (env > file > defaults), §6.6's enumerated fields
//! plus broker/DB connection strings. Grounded on `openibank-openibank`'s use
//! of the `config` crate for its service settings.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub amqp_url: String,

    #[serde(default = "defaults::servicing_bps")]
    pub servicing_bps: i64,
    #[serde(default = "defaults::dispatcher_tick_ms")]
    pub dispatcher_tick_ms: u64,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: i64,
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "defaults::base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "defaults::max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "defaults::handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    #[serde(default = "defaults::graceful_ms")]
    pub graceful_ms: u64,
    #[serde(default = "defaults::check_stale_days")]
    pub check_stale_days: i64,
    #[serde(default = "defaults::ach_return_window_default_days")]
    pub ach_return_window_default_days: i64,
    #[serde(default = "defaults::late_fee_grace_days")]
    pub late_fee_grace_days: i64,
    #[serde(default = "defaults::late_fee_flat_cents")]
    pub late_fee_flat_cents: i64,

    #[serde(default)]
    pub webhook_secrets: std::collections::HashMap<String, String>,
}

mod defaults {
    pub fn servicing_bps() -> i64 {
        25
    }
    pub fn dispatcher_tick_ms() -> u64 {
        5_000
    }
    pub fn batch_size() -> i64 {
        500
    }
    pub fn max_attempts() -> i32 {
        5
    }
    pub fn base_backoff_ms() -> u64 {
        1_000
    }
    pub fn max_backoff_ms() -> u64 {
        60_000
    }
    pub fn handler_timeout_ms() -> u64 {
        30_000
    }
    pub fn graceful_ms() -> u64 {
        30_000
    }
    pub fn check_stale_days() -> i64 {
        180
    }
    pub fn ach_return_window_default_days() -> i64 {
        5
    }
    pub fn late_fee_grace_days() -> i64 {
        15
    }
    pub fn late_fee_flat_cents() -> i64 {
        5_000
    }
}

impl Settings {
    /// Defaults < `config/*.toml` (if present) < environment (`LOANSERVE_*`,
    /// double-underscore nesting for the `webhook_secrets` map).
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/worker").required(false))
            .add_source(
                config::Environment::with_prefix("LOANSERVE")
                    .separator("__")
                    .try_parsing(true),
            );
        builder.build()?.try_deserialize()
    }
}
