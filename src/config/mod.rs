use std::{
    collections::HashMap,
    env,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use directories::BaseDirs;

use crate::{
    handler::HandlerSettings,
    pipeline::StepTimeouts,
    protocol::FrameLimits,
};

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        let config_path = default_config_path();
        let mut cfg = Self::from_file(&config_path);

        // Environment takes precedence over the rc file
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                cfg.inner.insert(k, v);
            }
        }
        cfg
    }

    /// Defaults overlaid with `KEY=VALUE` lines from `path`, if it exists.
    pub fn from_file(path: &Path) -> Self {
        let mut map = default_map();
        if let Ok(file) = fs::File::open(path) {
            let reader = BufReader::new(file);
            for line in reader.lines().map_while(Result::ok) {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((k, v)) = line.split_once('=') {
                    map.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }
        Self { inner: map, config_path: path.to_path_buf() }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.inner.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.parse::<usize>().ok())
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.get(key).and_then(|v| v.parse::<u16>().ok())
    }

    pub fn get_secs(&self, key: &str) -> Option<Duration> {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).filter(|v| !v.is_empty()).map(PathBuf::from)
    }
}

fn is_config_key(k: &str) -> bool {
    k.starts_with("RELAY_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("compile-relay").join(".relayrc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();
    // Network
    m.insert("RELAY_HOST".into(), "localhost".into());
    m.insert("RELAY_PORT".into(), "8080".into());
    m.insert("RELAY_BACKLOG".into(), "5".into());

    // Timeouts, seconds
    m.insert("RELAY_CONNECTION_TIMEOUT".into(), "60".into());
    m.insert("RELAY_COMPILE_TIMEOUT".into(), "30".into());
    m.insert("RELAY_EXECUTE_TIMEOUT".into(), "30".into());

    // Framing
    m.insert("RELAY_MAX_READ_ATTEMPTS".into(), "11".into());
    m.insert("RELAY_READ_CHUNK".into(), "1024".into());
    m.insert("RELAY_MAX_REQUEST_BYTES".into(), "1048576".into());

    // Empty means the system temp dir
    m.insert("RELAY_SCRATCH_DIR".into(), String::new());
    m.insert("RELAY_CONCURRENT".into(), "false".into());
    m
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub concurrent: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 8080, backlog: 5, concurrent: false }
    }
}

/// Typed view over [`Config`]; unparsable values fall back to defaults.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub handler: HandlerSettings,
    pub timeouts: StepTimeouts,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        let server_defaults = ServerSettings::default();
        let limit_defaults = FrameLimits::default();
        let step_defaults = StepTimeouts::default();
        let connection_timeout = cfg
            .get_secs("RELAY_CONNECTION_TIMEOUT")
            .unwrap_or(limit_defaults.read_timeout);

        Self {
            server: ServerSettings {
                host: cfg
                    .get("RELAY_HOST")
                    .filter(|h| !h.is_empty())
                    .unwrap_or(server_defaults.host),
                port: cfg.get_u16("RELAY_PORT").unwrap_or(server_defaults.port),
                backlog: cfg
                    .get_usize("RELAY_BACKLOG")
                    .and_then(|b| u32::try_from(b).ok())
                    .unwrap_or(server_defaults.backlog),
                concurrent: cfg.get_bool("RELAY_CONCURRENT"),
            },
            handler: HandlerSettings {
                limits: FrameLimits {
                    max_read_attempts: cfg
                        .get_usize("RELAY_MAX_READ_ATTEMPTS")
                        .filter(|n| *n > 0)
                        .unwrap_or(limit_defaults.max_read_attempts),
                    max_request_bytes: cfg
                        .get_usize("RELAY_MAX_REQUEST_BYTES")
                        .unwrap_or(limit_defaults.max_request_bytes),
                    read_chunk: cfg
                        .get_usize("RELAY_READ_CHUNK")
                        .filter(|n| *n > 0)
                        .unwrap_or(limit_defaults.read_chunk),
                    read_timeout: connection_timeout,
                },
                write_timeout: connection_timeout,
                scratch_root: cfg.get_path("RELAY_SCRATCH_DIR").unwrap_or_else(env::temp_dir),
            },
            timeouts: StepTimeouts {
                compile: cfg.get_secs("RELAY_COMPILE_TIMEOUT").unwrap_or(step_defaults.compile),
                execute: cfg.get_secs("RELAY_EXECUTE_TIMEOUT").unwrap_or(step_defaults.execute),
            },
        }
    }
}
