use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    /// Storefront URL used to build referral signup links.
    pub referral_base_url: String,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("server_port", 8000)?
            .set_default("referral_base_url", "http://localhost:5173")?
            .set_default("db_max_connections", 8)?
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }
}
