use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub jwt_secret: String,
    pub auth_dev_bypass_enabled: bool,
    /// `memory` or `http`.
    pub listing_backend: String,
    pub listing_base_url: String,
    pub listing_timeout_ms: u64,
    pub listing_retry_max_attempts: u32,
    pub listing_retry_backoff_base_ms: u64,
    pub listing_retry_backoff_max_ms: u64,
    /// JSON array of listings loaded into the memory backend at startup.
    #[serde(default)]
    pub listing_seed_path: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("jwt_secret", "dev-secret")?
            .set_default("auth_dev_bypass_enabled", false)?
            .set_default("listing_backend", "memory")?
            .set_default("listing_base_url", "http://127.0.0.1:4000")?
            .set_default("listing_timeout_ms", 2000)?
            .set_default("listing_retry_max_attempts", 3)?
            .set_default("listing_retry_backoff_base_ms", 100)?
            .set_default("listing_retry_backoff_max_ms", 2000)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn uses_http_listings(&self) -> bool {
        self.listing_backend.trim().eq_ignore_ascii_case("http")
    }
}
