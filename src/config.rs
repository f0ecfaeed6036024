use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,

    // DHT engine
    pub bind: String,
    pub bootstrap: Vec<String>,
    pub interval: Duration,
    pub stealth_ids: bool,
    pub search_deadline: Duration,

    // Metadata fetcher
    pub fetch_connect_timeout: Duration,
    pub fetch_message_timeout: Duration,
    pub fetch_peer_timeout: Duration,
    pub max_metadata_size: usize,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Ok(Self::from_env())
    }

    fn from_env() -> Self {
        let data_dir = env_pathbuf("MAGNETITE_DATA_DIR", "data");

        let bind = env_string("MAGNETITE_BIND", "0.0.0.0:6881");
        let bootstrap = env_csv_strings(
            "MAGNETITE_BOOTSTRAP",
            &[
                "router.bittorrent.com:6881",
                "dht.transmissionbt.com:6881",
                "router.utorrent.com:6881",
            ],
        );
        let interval = Duration::from_millis(env_u64("MAGNETITE_INTERVAL_MS", 50));
        let stealth_ids = env_enabled("MAGNETITE_STEALTH_IDS", true);
        let search_deadline = Duration::from_secs(env_u64("MAGNETITE_SEARCH_DEADLINE_SECS", 60));

        let fetch_connect_timeout =
            Duration::from_millis(env_u64("MAGNETITE_FETCH_CONNECT_TIMEOUT_MS", 1_000));
        let fetch_message_timeout =
            Duration::from_secs(env_u64("MAGNETITE_FETCH_MESSAGE_TIMEOUT_SECS", 10));
        let fetch_peer_timeout =
            Duration::from_secs(env_u64("MAGNETITE_FETCH_PEER_TIMEOUT_SECS", 30));
        let max_metadata_size = env_usize("MAGNETITE_MAX_METADATA_SIZE", 10 * 1024 * 1024);

        Self {
            data_dir,
            bind,
            bootstrap,
            interval,
            stealth_ids,
            search_deadline,
            fetch_connect_timeout,
            fetch_message_timeout,
            fetch_peer_timeout,
            max_metadata_size,
        }
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_pathbuf(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name, default))
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_csv_strings(name: &str, defaults: &[&str]) -> Vec<String> {
    if let Some(s) = env_opt_string(name) {
        let v: Vec<String> = s
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if !v.is_empty() {
            return v;
        }
    }
    defaults.iter().map(|s| s.to_string()).collect()
}

fn env_enabled(name: &str, default: bool) -> bool {
    match env_opt_string(name) {
        None => default,
        Some(v) => {
            let v = v.to_ascii_lowercase();
            if matches!(v.as_str(), "0" | "false" | "off" | "no") {
                return false;
            }
            if matches!(v.as_str(), "1" | "true" | "on" | "yes") {
                return true;
            }
            default
        }
    }
}
