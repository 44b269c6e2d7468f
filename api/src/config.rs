use std::{env, fmt::Display, str::FromStr};

use tracing::{info, warn};

const DEV_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub cors_origin: String,
    pub db_pool_size: u32,
}

impl Config {
    pub fn load() -> Self {
        let jwt_secret: String = try_load("JWT_SECRET", DEV_JWT_SECRET);
        if jwt_secret == DEV_JWT_SECRET {
            warn!("JWT_SECRET is the development default; do not run this in production");
        }

        Self {
            database_url: try_load("DATABASE_URL", "scholia.db"),
            bind_addr: try_load("BIND_ADDR", "0.0.0.0:8080"),
            jwt_secret,
            cors_origin: try_load("CORS_ORIGIN", "http://localhost:1313"),
            db_pool_size: try_load("DB_POOL_SIZE", "8"),
        }
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default");
        default.to_string()
    });

    raw.parse().unwrap_or_else(|e| {
        warn!("Invalid {key} value ({e}), using default");
        default
            .parse()
            .unwrap_or_else(|_| panic!("default for {key} must parse"))
    })
}
