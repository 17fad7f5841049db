use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration.
///
/// Loaded from environment variables (with `.env` support). Defaults mirror
/// the production deployment: conservative queue bounds and spacing delays so
/// the remote's flood control is rarely hit in the first place.
#[derive(Clone, Debug)]
pub struct Config {
    // Bot surface
    pub telegram_bot_token: String,

    // Storage
    pub data_dir: PathBuf,
    pub session_encryption_key: Option<String>,

    // Queues
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub forward_delay: Duration,
    pub requeue_on_rate_limit: bool,

    // Dedup
    pub dedup_window: Duration,

    // Circuit breaker
    pub breaker_max_failures: u32,
    pub breaker_reset_window: Duration,

    // Connection recovery
    pub watchdog_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,

    // Shutdown / background tasks
    pub shutdown_grace: Duration,
    pub max_background_tasks: usize,
    pub auth_flow_timeout: Duration,

    // UI
    pub folder_page_size: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let data_dir = env_str("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        Ok(Self {
            telegram_bot_token,
            data_dir,
            session_encryption_key: env_str("SESSION_ENCRYPTION_KEY").and_then(non_empty),
            queue_capacity: env_usize("QUEUE_MAX_SIZE").unwrap_or(1000),
            enqueue_timeout: env_secs("QUEUE_TIMEOUT").unwrap_or(Duration::from_secs(60)),
            forward_delay: env_millis("FORWARD_DELAY_MS").unwrap_or(Duration::from_millis(500)),
            requeue_on_rate_limit: env_bool("REQUEUE_ON_RATE_LIMIT").unwrap_or(false),
            dedup_window: env_secs("DEDUP_WINDOW").unwrap_or(Duration::from_secs(60)),
            breaker_max_failures: env_u32("BREAKER_MAX_FAILURES").unwrap_or(5),
            breaker_reset_window: env_secs("BREAKER_RESET_WINDOW")
                .unwrap_or(Duration::from_secs(300)),
            watchdog_interval: env_secs("WATCHDOG_INTERVAL").unwrap_or(Duration::from_secs(30)),
            max_reconnect_attempts: env_u32("MAX_RECONNECT_ATTEMPTS").unwrap_or(5),
            reconnect_delay: env_secs("RECONNECT_DELAY").unwrap_or(Duration::from_secs(10)),
            shutdown_grace: env_secs("SHUTDOWN_GRACE").unwrap_or(Duration::from_secs(5)),
            max_background_tasks: env_usize("MAX_BACKGROUND_TASKS").unwrap_or(100),
            auth_flow_timeout: env_secs("AUTH_FLOW_TIMEOUT").unwrap_or(Duration::from_secs(180)),
            folder_page_size: env_usize("FOLDER_PAGE_SIZE").unwrap_or(8),
        })
    }

    /// Directory holding one persisted state file per user.
    pub fn user_data_dir(&self) -> PathBuf {
        self.data_dir.join("user_data")
    }

    pub fn queue_config(&self) -> crate::queue::QueueConfig {
        crate::queue::QueueConfig {
            capacity: self.queue_capacity,
            enqueue_timeout: self.enqueue_timeout,
            forward_delay: self.forward_delay,
            requeue_on_rate_limit: self.requeue_on_rate_limit,
            shutdown_grace: self.shutdown_grace,
        }
    }

    pub fn breaker_config(&self) -> crate::breaker::BreakerConfig {
        crate::breaker::BreakerConfig {
            max_failures: self.breaker_max_failures,
            reset_window: self.breaker_reset_window,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key)?.trim().parse().ok()
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key)?.trim().parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match env_str(key)?.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env_str(key)?.trim().parse().ok().map(Duration::from_secs)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_str(key)?.trim().parse().ok().map(Duration::from_millis)
}

/// Minimal `.env` loader: `KEY=VALUE` lines, `#` comments, no interpolation.
/// Values already present in the environment win.
fn load_dotenv_if_present(path: &Path) {
    let Ok(txt) = fs::read_to_string(path) else {
        return;
    };
    for line in txt.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if env::var_os(k).is_none() {
            env::set_var(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_does_not_override_existing_env() {
        let path = std::env::temp_dir().join(format!("fcast-dotenv-{}", std::process::id()));
        std::fs::write(&path, "FCAST_TEST_KEY=from_file\n# comment\n").unwrap();

        env::set_var("FCAST_TEST_KEY", "from_env");
        load_dotenv_if_present(&path);
        assert_eq!(env::var("FCAST_TEST_KEY").unwrap(), "from_env");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn env_parsers_reject_garbage() {
        env::set_var("FCAST_TEST_SECS", "not-a-number");
        assert!(env_secs("FCAST_TEST_SECS").is_none());
        env::set_var("FCAST_TEST_BOOL", "maybe");
        assert!(env_bool("FCAST_TEST_BOOL").is_none());
        env::set_var("FCAST_TEST_BOOL", "on");
        assert_eq!(env_bool("FCAST_TEST_BOOL"), Some(true));
    }
}
