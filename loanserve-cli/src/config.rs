//! Minimal layered configuration for the CLI: just the database connection
//! string, loaded the same way `loanserve-worker` loads its settings (env >
//! file > default).

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    pub database_url: String,
}

impl CliConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("database_url", "postgres://localhost/loanserve")?
            .add_source(config::File::with_name("config/cli").required(false))
            .add_source(config::Environment::with_prefix("LOANSERVE").try_parsing(true));
        builder.build()?.try_deserialize()
    }
}
