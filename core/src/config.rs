/// Configuration management
use crate::error::{ChatError, Result};
use crate::session::Role;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 7340;
const DEFAULT_MONITOR_PORT: u16 = 7399;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the gym backend REST API
    pub api_base_url: String,

    /// Period of the conversation refresh timer
    pub poll_interval: Duration,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,

    /// Delay before an optimistic entry is swapped for the canonical record
    pub send_grace: Duration,

    /// Local TCP API port for CLI clients
    pub api_port: u16,

    /// UDP port the terminal monitor listens on
    pub monitor_port: u16,

    /// Authenticated user id (required to run the client binary)
    pub user_id: Option<i64>,

    /// Session role
    pub role: Option<Role>,

    /// Bearer token attached to every backend request
    pub bearer_token: Option<String>,

    /// Assigned trainer id (required in member mode)
    pub trainer_id: Option<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
            poll_interval: Duration::from_millis(3000),
            request_timeout: Duration::from_secs(10),
            send_grace: Duration::from_millis(400),
            api_port: DEFAULT_API_PORT,
            monitor_port: DEFAULT_MONITOR_PORT,
            user_id: None,
            role: None,
            bearer_token: None,
            trainer_id: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--api-url requires a URL argument".to_string())
                    })?;
                    config.api_base_url = url.clone();
                    i += 2;
                }
                "--poll-ms" => {
                    let ms = parse_flag_u64(args, i, "--poll-ms")?;
                    config.poll_interval = Duration::from_millis(ms);
                    i += 2;
                }
                "--api-port" => {
                    config.api_port = parse_flag_u16(args, i, "--api-port")?;
                    i += 2;
                }
                "--monitor-port" => {
                    config.monitor_port = parse_flag_u16(args, i, "--monitor-port")?;
                    i += 2;
                }
                "--user-id" => {
                    config.user_id = Some(parse_flag_i64(args, i, "--user-id")?);
                    i += 2;
                }
                "--trainer-id" => {
                    config.trainer_id = Some(parse_flag_i64(args, i, "--trainer-id")?);
                    i += 2;
                }
                "--token" => {
                    let token = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--token requires a token argument".to_string())
                    })?;
                    config.bearer_token = Some(token.clone());
                    i += 2;
                }
                "--role" => {
                    let role = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--role requires 'member' or 'trainer'".to_string())
                    })?;
                    config.role = Some(parse_role(role)?);
                    i += 2;
                }
                other => {
                    return Err(ChatError::Config(format!(
                        "Unknown argument: {} (expected --api-url, --poll-ms, --api-port, \
                         --monitor-port, --user-id, --trainer-id, --token, --role)",
                        other
                    )));
                }
            }
        }

        // Env overrides (nice for scripts and containers)
        if let Ok(url) = std::env::var("COACHLINK_API_URL") {
            config.api_base_url = url;
        }
        if let Some(ms) = env_parse::<u64>("COACHLINK_POLL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(p) = env_parse::<u16>("COACHLINK_API_PORT") {
            config.api_port = p;
        }
        if let Some(p) = env_parse::<u16>("COACHLINK_MONITOR_PORT") {
            config.monitor_port = p;
        }
        if let Some(id) = env_parse::<i64>("COACHLINK_USER_ID") {
            config.user_id = Some(id);
        }
        if let Some(id) = env_parse::<i64>("COACHLINK_TRAINER_ID") {
            config.trainer_id = Some(id);
        }
        if let Ok(token) = std::env::var("COACHLINK_TOKEN") {
            config.bearer_token = Some(token);
        }
        if let Ok(role) = std::env::var("COACHLINK_ROLE") {
            config.role = Some(parse_role(&role)?);
        }

        Ok(config)
    }
}

fn parse_role(s: &str) -> Result<Role> {
    match s.to_ascii_lowercase().as_str() {
        "member" => Ok(Role::Member),
        "trainer" => Ok(Role::Trainer),
        other => Err(ChatError::Config(format!(
            "Invalid role '{}', expected 'member' or 'trainer'",
            other
        ))),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

fn parse_flag_u64(args: &[String], i: usize, flag: &str) -> Result<u64> {
    args.get(i + 1)
        .ok_or_else(|| ChatError::Config(format!("{} requires a number argument", flag)))?
        .parse::<u64>()
        .map_err(|_| ChatError::Config(format!("{} must be a valid number", flag)))
}

fn parse_flag_u16(args: &[String], i: usize, flag: &str) -> Result<u16> {
    args.get(i + 1)
        .ok_or_else(|| ChatError::Config(format!("{} requires a port argument", flag)))?
        .parse::<u16>()
        .map_err(|_| ChatError::Config(format!("{} must be a valid port (0-65535)", flag)))
}

fn parse_flag_i64(args: &[String], i: usize, flag: &str) -> Result<i64> {
    args.get(i + 1)
        .ok_or_else(|| ChatError::Config(format!("{} requires an id argument", flag)))?
        .parse::<i64>()
        .map_err(|_| ChatError::Config(format!("{} must be a valid id", flag)))
}
