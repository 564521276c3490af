use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::rate_limit::RateLimitPolicy;
use crate::upstream::ForwarderTimeouts;

// CLI argument structure; every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "completion-gateway")]
#[command(about = "Authenticated, rate-limited proxy for chat completion backends")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind: String,

    // JSON array of {id, model, url, apiKey[, apiKeyHeader]}
    #[arg(short, long, env = "ROUTES_FILE")]
    pub routes_file: Option<PathBuf>,

    // Shared secret clients must present
    #[arg(long, env = "PROXY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    // Rate limit max requests per window, per client
    #[arg(long, env = "RATE_LIMIT", default_value_t = 12)]
    pub rate_limit: u32,

    // Rate limit window in seconds
    #[arg(long, env = "RATE_WINDOW", default_value_t = 60)]
    pub rate_window: u64,

    // How long a client stays blocked after exceeding the limit, in seconds
    #[arg(long, env = "RATE_BLOCK", default_value_t = 3600)]
    pub rate_block: u64,

    // Max requests per window for one model id; unset disables the model budget
    #[arg(long, env = "MODEL_RATE_LIMIT")]
    pub model_rate_limit: Option<u32>,

    #[arg(long, env = "MODEL_RATE_BLOCK", default_value_t = 60)]
    pub model_rate_block: u64,

    // Idle rate-limit record sweep interval in seconds
    #[arg(long, env = "SWEEP_INTERVAL", default_value_t = 60)]
    pub sweep_interval: u64,

    #[arg(long, env = "UPSTREAM_CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout: u64,

    // Max silence between streamed body reads
    #[arg(long, env = "UPSTREAM_READ_TIMEOUT", default_value_t = 60)]
    pub read_timeout: u64,

    // Total time allowed for a non-streaming upstream call
    #[arg(long, env = "UPSTREAM_TIMEOUT", default_value_t = 120)]
    pub upstream_timeout: u64,

    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 1024 * 1024)]
    pub max_body_bytes: usize,
}

impl Args {
    pub fn client_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            limit: self.rate_limit,
            window: Duration::from_secs(self.rate_window),
            block: Duration::from_secs(self.rate_block),
        }
    }

    pub fn model_policy(&self) -> Option<RateLimitPolicy> {
        self.model_rate_limit.map(|limit| RateLimitPolicy {
            limit,
            window: Duration::from_secs(self.rate_window),
            block: Duration::from_secs(self.model_rate_block),
        })
    }

    pub fn timeouts(&self) -> ForwarderTimeouts {
        ForwarderTimeouts {
            connect: Duration::from_secs(self.connect_timeout),
            read: Duration::from_secs(self.read_timeout),
            request: Duration::from_secs(self.upstream_timeout),
        }
    }
}
