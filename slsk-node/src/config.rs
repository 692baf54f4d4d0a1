//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Client configuration. File: `--config`, else ~/.config/slsk/config.toml, else /etc/slsk/config.toml.
/// Env overrides: SLSK_SERVER (host or host:port), SLSK_USERNAME, SLSK_PASSWORD, SLSK_LISTEN_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Port peers dial us on (default 2234).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Sent in user-info replies.
    #[serde(default)]
    pub description: String,
    /// Directories to share. Each is shared under its own name.
    #[serde(default)]
    pub shared_dirs: Vec<PathBuf>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Tighter than `connect_timeout_secs` so dead parent candidates are shed quickly.
    #[serde(default = "default_distributed_connect_timeout_secs")]
    pub distributed_connect_timeout_secs: u64,
    #[serde(default = "default_search_response_timeout_secs")]
    pub search_response_timeout_secs: u64,
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
    #[serde(default = "default_connect_queue_capacity")]
    pub connect_queue_capacity: usize,
    #[serde(default = "default_connect_queue_per_second")]
    pub connect_queue_per_second: u32,
    #[serde(default = "default_max_parent_attempts")]
    pub max_parent_attempts: usize,
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    #[serde(default = "default_min_query_length")]
    pub min_query_length: usize,
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,
    /// Whether an allowed TransferReply carries the file size.
    #[serde(default = "default_true")]
    pub transfer_reply_includes_size: bool,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_server_host() -> String {
    "server.slsknet.org".to_owned()
}
fn default_server_port() -> u16 {
    2242
}
fn default_listen_port() -> u16 {
    2234
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_distributed_connect_timeout_secs() -> u64 {
    5
}
fn default_search_response_timeout_secs() -> u64 {
    12
}
fn default_resolve_timeout_secs() -> u64 {
    10
}
fn default_connect_queue_capacity() -> usize {
    100
}
fn default_connect_queue_per_second() -> u32 {
    20
}
fn default_max_parent_attempts() -> usize {
    slsk_core::tree::DEFAULT_MAX_PARENT_ATTEMPTS
}
fn default_max_children() -> usize {
    slsk_core::tree::DEFAULT_MAX_CHILDREN
}
fn default_min_query_length() -> usize {
    slsk_core::search::DEFAULT_MIN_QUERY_LENGTH
}
fn default_max_search_results() -> usize {
    slsk_core::search::DEFAULT_MAX_RESULTS
}
fn default_true() -> bool {
    true
}
fn default_ping_interval_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_server_port(),
            listen_port: default_listen_port(),
            username: String::new(),
            password: String::new(),
            description: String::new(),
            shared_dirs: Vec::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            distributed_connect_timeout_secs: default_distributed_connect_timeout_secs(),
            search_response_timeout_secs: default_search_response_timeout_secs(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
            connect_queue_capacity: default_connect_queue_capacity(),
            connect_queue_per_second: default_connect_queue_per_second(),
            max_parent_attempts: default_max_parent_attempts(),
            max_children: default_max_children(),
            min_query_length: default_min_query_length(),
            max_search_results: default_max_search_results(),
            transfer_reply_includes_size: default_true(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl Config {
    /// Load config: defaults, then the config file (if any), then env vars.
    /// An explicit `path` must exist; the default locations are optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut c = match path {
            Some(p) => Self::from_file(p)?,
            None => match config_paths().into_iter().find(|p| p.exists()) {
                Some(p) => Self::from_file(&p)?,
                None => Self::default(),
            },
        };
        c.apply_env(|key| std::env::var(key).ok());
        Ok(c)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&s).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("SLSK_SERVER") {
            match s.rsplit_once(':') {
                Some((host, port)) => {
                    if let Ok(p) = port.parse::<u16>() {
                        self.server_host = host.to_owned();
                        self.server_port = p;
                    }
                }
                None => self.server_host = s,
            }
        }
        if let Some(s) = var("SLSK_USERNAME") {
            self.username = s;
        }
        if let Some(s) = var("SLSK_PASSWORD") {
            self.password = s;
        }
        if let Some(s) = var("SLSK_LISTEN_PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.listen_port = p;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });
        if self.username.is_empty() {
            return invalid("username", "must not be empty");
        }
        if self.server_host.is_empty() {
            return invalid("server_host", "must not be empty");
        }
        if self.connect_queue_capacity == 0 {
            return invalid("connect_queue_capacity", "must be at least 1");
        }
        if self.connect_queue_per_second == 0 {
            return invalid("connect_queue_per_second", "must be at least 1");
        }
        if self.max_parent_attempts == 0 {
            return invalid("max_parent_attempts", "must be at least 1");
        }
        if self.ping_interval_secs == 0 {
            return invalid("ping_interval_secs", "must be at least 1");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn distributed_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.distributed_connect_timeout_secs)
    }

    pub fn search_response_timeout(&self) -> Duration {
        Duration::from_secs(self.search_response_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Minimum spacing between queued dials.
    pub fn connect_queue_interval(&self) -> Duration {
        Duration::from_secs(1) / self.connect_queue_per_second.max(1)
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/slsk/config.toml"));
    }
    out.push(PathBuf::from("/etc/slsk/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.server_port, 2242);
        assert_eq!(c.listen_port, 2234);
        assert_eq!(c.connect_queue_capacity, 100);
        assert_eq!(c.connect_queue_interval(), Duration::from_millis(50));
        assert_eq!(c.distributed_connect_timeout(), Duration::from_secs(5));
        assert!(c.transfer_reply_includes_size);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c = Config::from_toml(
            "username = \"me\"\nmax_children = 4\nshared_dirs = [\"/srv/music\"]\n",
        )
        .unwrap();
        assert_eq!(c.username, "me");
        assert_eq!(c.max_children, 4);
        assert_eq!(c.shared_dirs, vec![PathBuf::from("/srv/music")]);
        assert_eq!(c.server_host, "server.slsknet.org");
        c.validate().unwrap();
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(Config::from_toml("usrname = \"typo\"").is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SLSK_SERVER", "localhost:2300"),
            ("SLSK_USERNAME", "envuser"),
            ("SLSK_LISTEN_PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.server_host, "localhost");
        assert_eq!(c.server_port, 2300);
        assert_eq!(c.username, "envuser");
        assert_eq!(c.listen_port, 2234);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut c = Config::default();
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid { field: "username", .. })
        ));
        c.username = "me".into();
        c.connect_queue_per_second = 0;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid {
                field: "connect_queue_per_second",
                ..
            })
        ));
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/slsk.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
