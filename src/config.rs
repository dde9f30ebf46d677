use crate::error::StatError;
use crate::util::{ring_buffer, state_store};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub window: WindowConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Reporting window length in seconds
    pub interval_secs: u64,
    /// Length of one ring-buffer slot in seconds (rotation cadence)
    pub precision_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Checkpoint file written at shutdown
    pub path: PathBuf,
    /// Load the checkpoint on startup
    pub restore: bool,
    /// Also checkpoint every N seconds while running. 0 = shutdown only.
    #[serde(default)]
    pub checkpoint_secs: u64,
}

// ── Defaults ─────────────────────────────────────────────────────────

impl Default for WindowConfig {
    fn default() -> Self {
        Self { interval_secs: 40, precision_secs: 10 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 1337 }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path:            state_store::default_state_path(),
            restore:         true,
            checkpoint_secs: 0,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────

impl Config {
    /// Number of ring-buffer slots: whole precision intervals per window.
    pub fn capacity(&self) -> Result<usize, StatError> {
        let w = &self.window;
        if w.precision_secs == 0 {
            return Err(StatError::InvalidConfig("window.precision_secs must be at least 1".into()));
        }
        let slots = w.interval_secs / w.precision_secs;
        if slots == 0 {
            return Err(StatError::InvalidConfig(format!(
                "window.interval_secs ({}) must be at least window.precision_secs ({})",
                w.interval_secs, w.precision_secs
            )));
        }
        let slots = usize::try_from(slots)
            .map_err(|_| StatError::InvalidConfig(format!("{} slots is too many", slots)))?;
        ring_buffer::check_capacity(slots)?;
        Ok(slots)
    }

    /// Window length actually covered by the ring, for display.
    pub fn window_secs(&self) -> u64 {
        let w = &self.window;
        match w.precision_secs {
            0 => 0,
            p => (w.interval_secs / p) * p,
        }
    }

    /// Host and port as separate parts, so IPv6 literals bind without brackets.
    pub fn bind_addr(&self) -> (&str, u16) {
        (self.server.host.as_str(), self.server.port)
    }
}

// ── Load / Save ───────────────────────────────────────────────────────

impl Config {
    /// Load from `path` (or the default location). A missing file gets the defaults
    /// written out on first run; an unreadable one falls back to defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path.map(Path::to_path_buf).or_else(Config::config_path) {
            Some(p) => p,
            None    => return Config::default(),
        };
        if !path.exists() {
            // best-effort
            match try_write_defaults(&path) {
                Ok(())  => debug!(path = %path.display(), "wrote default config"),
                Err(e)  => debug!(path = %path.display(), error = %e, "could not write default config"),
            }
            return Config::default();
        }
        match try_load(&path) {
            Ok(c)  => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable config, using defaults");
                Config::default()
            }
        }
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("reqstat").join("reqstat.toml"))
    }
}

fn try_load(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)?;
    let cfg: Config = toml::from_str(&text)?;
    Ok(cfg)
}

fn try_write_defaults(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = toml::to_string_pretty(&Config::default())?;
    fs::write(path, format!("# reqstat configuration\n# Generated on first run, edit freely\n\n{}", text))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_window_has_four_slots() {
        let cfg = Config::default();
        assert_eq!(cfg.capacity().unwrap(), 4);
        assert_eq!(cfg.window_secs(), 40);
        assert_eq!(cfg.bind_addr(), ("127.0.0.1", 1337));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str("[window]\ninterval_secs = 60\nprecision_secs = 1\n").unwrap();
        assert_eq!(cfg.capacity().unwrap(), 60);
        assert_eq!(cfg.server, ServerConfig::default());
        assert!(cfg.state.restore);
    }

    #[test]
    fn invalid_windows_are_rejected() {
        let mut cfg = Config::default();
        cfg.window.precision_secs = 0;
        assert!(matches!(cfg.capacity(), Err(StatError::InvalidConfig(_))));

        cfg.window = WindowConfig { interval_secs: 5, precision_secs: 10 };
        assert!(matches!(cfg.capacity(), Err(StatError::InvalidConfig(_))));
    }

    #[test]
    fn huge_windows_are_rejected_before_allocating() {
        let mut cfg = Config::default();
        cfg.window = WindowConfig { interval_secs: u64::MAX, precision_secs: 1 };
        assert!(matches!(cfg.capacity(), Err(StatError::InvalidConfig(_))));

        cfg.window = WindowConfig { interval_secs: ring_buffer::MAX_SLOTS as u64, precision_secs: 1 };
        assert_eq!(cfg.capacity().unwrap(), ring_buffer::MAX_SLOTS);
    }

    #[test]
    fn ipv6_host_resolves() {
        use std::net::{SocketAddr, ToSocketAddrs};
        let mut cfg = Config::default();
        cfg.server.host = "::1".into();
        let addrs: Vec<SocketAddr> = cfg.bind_addr().to_socket_addrs().unwrap().collect();
        assert_eq!(addrs, vec!["[::1]:1337".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn uneven_window_rounds_down_to_whole_slots() {
        let mut cfg = Config::default();
        cfg.window = WindowConfig { interval_secs: 45, precision_secs: 10 };
        assert_eq!(cfg.capacity().unwrap(), 4);
        assert_eq!(cfg.window_secs(), 40);
    }

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reqstat.toml");
        assert_eq!(Config::load(Some(path.as_path())), Config::default());
        assert!(path.exists());
        assert_eq!(Config::load(Some(path.as_path())), Config::default());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reqstat.toml");
        fs::write(&path, "[window\ninterval_secs = ").unwrap();
        assert_eq!(Config::load(Some(path.as_path())), Config::default());
    }

    #[test]
    fn file_values_are_used() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reqstat.toml");
        fs::write(
            &path,
            "[server]\nhost = \"0.0.0.0\"\nport = 8080\n\n[state]\npath = \"/tmp/s.json\"\nrestore = false\ncheckpoint_secs = 30\n",
        )
        .unwrap();
        let cfg = Config::load(Some(path.as_path()));
        assert_eq!(cfg.bind_addr(), ("0.0.0.0", 8080));
        assert_eq!(cfg.state.path, PathBuf::from("/tmp/s.json"));
        assert!(!cfg.state.restore);
        assert_eq!(cfg.state.checkpoint_secs, 30);
    }
}
