use std::time::Duration;

use anyhow::Context;

use crate::backoff::RetryPolicy;

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,
    pub ws_url: String,
    pub auth_token: Option<String>,
    pub status_addr: String,
    pub topics: Vec<String>,
    pub channel: ChannelConfig,
    pub location_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_base_url = std::env::var("SERVESYNC_API_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080/api".into());
        let ws_url =
            std::env::var("SERVESYNC_WS_URL").unwrap_or_else(|_| "ws://localhost:8080/ws".into());
        let auth_token = std::env::var("SERVESYNC_AUTH_TOKEN").ok();
        let status_addr =
            std::env::var("SERVESYNC_STATUS_ADDR").unwrap_or_else(|_| "127.0.0.1:3001".into());
        let topics = std::env::var("SERVESYNC_TOPICS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let handshake_timeout = env_millis("HANDSHAKE_TIMEOUT_MS", 10_000)?;
        let heartbeat_interval = env_millis("HEARTBEAT_INTERVAL_MS", 25_000)?;
        let pong_timeout = env_millis("PONG_TIMEOUT_MS", 10_000)?;
        let base_delay = env_millis("RECONNECT_BASE_MS", 1_000)?;
        let max_delay = env_millis("RECONNECT_MAX_MS", 30_000)?;
        let max_attempts = std::env::var("RECONNECT_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "8".into())
            .parse()
            .context("RECONNECT_MAX_ATTEMPTS must be a number")?;
        let location_interval = env_millis("LOCATION_INTERVAL_MS", 10_000)?;

        Ok(Self {
            api_base_url,
            ws_url,
            auth_token,
            status_addr,
            topics,
            channel: ChannelConfig {
                handshake_timeout,
                heartbeat_interval,
                pong_timeout,
                retry: RetryPolicy {
                    base_delay,
                    max_delay,
                    max_attempts,
                },
            },
            location_interval,
        })
    }
}

fn env_millis(name: &str, default: u64) -> anyhow::Result<Duration> {
    let ms: u64 = std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{name} must be a number of milliseconds"))?;
    Ok(Duration::from_millis(ms))
}
