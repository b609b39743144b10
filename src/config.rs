use clap::{Args, Parser};

/// chatfeed server
#[derive(Parser, Debug, Clone)]
#[command(name = "chatfeed", version, about = "Chat room server")]
pub struct Config {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://chatfeed.db?mode=rwc")]
    pub database_url: String,

    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub bind_address: String,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 16)]
    pub db_max_connections: u32,

    #[command(flatten)]
    pub limits: Limits,

    /// Structured JSON logs instead of pretty ones
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

/// Bounds applied to every chat session.
#[derive(Args, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted message, in bytes
    #[arg(long, env = "MAX_MESSAGE_BYTES", default_value_t = 4096)]
    pub max_message_bytes: usize,

    /// Frames queued per connection before it counts as stalled and is evicted
    #[arg(long, env = "OUTBOX_CAPACITY", default_value_t = 64, value_parser = at_least_one)]
    pub outbox_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_bytes: 4096,
            outbox_capacity: 64,
        }
    }
}

impl Config {
    /// Command line first, then the environment, `.env` included.
    pub fn load() -> Self {
        // A missing .env is fine.
        let _ = dotenv::dotenv();
        Self::parse()
    }
}

fn at_least_one(raw: &str) -> Result<usize, String> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_owned()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}
