use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};

use crate::error::ConfigError;
use crate::tunnel::{RemoteEndpoint, ServiceSpec};

/// ~/.devtun, created on first use.
pub fn state_dir() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .context("cannot determine home directory")?
        .join(".devtun");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("config.toml"))
}

/// Intervals in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Hard limit on one reachability probe
    pub probe_timeout: u64,
    /// Pause between reachability probes
    pub poll_interval: u64,
    /// Delay before a failed tunnel is retried
    pub backoff: u64,
    /// Dashboard refresh interval
    pub refresh: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            probe_timeout: 5,
            poll_interval: 5,
            backoff: 5,
            refresh: 2,
        }
    }
}

impl Timing {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff.max(1))
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell for completions (bash, zsh, fish)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Editor for `devtun config` (overrides $VISUAL/$EDITOR)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
    /// Max log file size in bytes before rotation
    pub max_log_size: u64,
    pub endpoint: RemoteEndpoint,
    pub timing: Timing,
    pub services: Vec<ServiceSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            editor: None,
            max_log_size: 1_048_576,
            endpoint: RemoteEndpoint::default(),
            timing: Timing::default(),
            services: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from ~/.devtun/config.toml, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| {
            format!(
                "failed to parse {} (run `devtun config` to fix it)",
                path.display()
            )
        })
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Write a default config file if none exists. Returns the path.
    pub fn init() -> Result<PathBuf> {
        let path = config_path()?;
        if path.exists() {
            return Ok(path);
        }
        Self::default().save_to(&path)?;
        Ok(path)
    }

    /// Resolve which editor to use: config > $VISUAL > $EDITOR > vi
    pub fn resolve_editor(&self) -> String {
        if let Some(ref e) = self.editor {
            return e.clone();
        }
        std::env::var("VISUAL")
            .or_else(|_| std::env::var("EDITOR"))
            .unwrap_or_else(|_| "vi".to_string())
    }

    /// Editor for a config file that may not parse as a whole. Only the
    /// `editor` key is read; anything else wrong with the file is ignored.
    pub fn editor_for(path: &Path) -> String {
        #[derive(Default, Deserialize)]
        #[serde(default)]
        struct EditorOnly {
            editor: Option<String>,
        }

        let editor = fs::read_to_string(path)
            .ok()
            .and_then(|content| toml::from_str::<EditorOnly>(&content).ok())
            .and_then(|e| e.editor);
        Config {
            editor,
            ..Config::default()
        }
        .resolve_editor()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn validate_endpoint(&self) -> Result<(), ConfigError> {
        let ep = &self.endpoint;
        if ep.host.trim().is_empty() {
            return Err(ConfigError::IncompleteEndpoint("host"));
        }
        if ep.user.trim().is_empty() {
            return Err(ConfigError::IncompleteEndpoint("user"));
        }
        if ep.port == 0 {
            return Err(ConfigError::IncompleteEndpoint("port"));
        }
        Ok(())
    }

    /// Reject anything the supervisors must never see: empty or duplicate
    /// names, zero ports, empty remote hosts.
    pub fn validate_services(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for s in &self.services {
            validate_service(s)?;
            if !seen.insert(s.name.as_str()) {
                return Err(ConfigError::DuplicateName(s.name.clone()));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_endpoint()?;
        self.validate_services()
    }

    pub fn add_service(&mut self, spec: ServiceSpec) -> Result<(), ConfigError> {
        validate_service(&spec)?;
        if self.service(&spec.name).is_some() {
            return Err(ConfigError::DuplicateName(spec.name));
        }
        self.services.push(spec);
        Ok(())
    }

    /// Replace the service called `name`. Renaming onto another existing
    /// service is rejected.
    pub fn update_service(&mut self, name: &str, spec: ServiceSpec) -> Result<bool, ConfigError> {
        validate_service(&spec)?;
        if spec.name != name && self.service(&spec.name).is_some() {
            return Err(ConfigError::DuplicateName(spec.name));
        }
        match self.services.iter_mut().find(|s| s.name == name) {
            Some(slot) => {
                *slot = spec;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove_service(&mut self, name: &str) -> Option<ServiceSpec> {
        let idx = self.services.iter().position(|s| s.name == name)?;
        Some(self.services.remove(idx))
    }
}

pub fn validate_service(s: &ServiceSpec) -> Result<(), ConfigError> {
    if s.name.trim().is_empty() {
        return Err(ConfigError::EmptyName);
    }
    if s.local_port == 0 {
        return Err(ConfigError::InvalidPort {
            name: s.name.clone(),
            field: "local port",
        });
    }
    if s.remote_port == 0 {
        return Err(ConfigError::InvalidPort {
            name: s.name.clone(),
            field: "remote port",
        });
    }
    if s.remote_host.trim().is_empty() {
        return Err(ConfigError::EmptyRemoteHost(s.name.clone()));
    }
    Ok(())
}

/// Watch `path` for writes, renames and removals, calling `on_change` once
/// per debounced burst. Editors often replace the file, so the parent
/// directory is watched. Watching stops when the returned debouncer drops.
pub fn watch(
    path: &Path,
    mut on_change: impl FnMut() + Send + 'static,
) -> Result<Debouncer<RecommendedWatcher>> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?
        .to_path_buf();
    let file_name = path.file_name().map(|n| n.to_os_string());

    let mut debouncer = new_debouncer(
        Duration::from_millis(200),
        move |res: DebounceEventResult| match res {
            Ok(events) => {
                if events
                    .iter()
                    .any(|e| e.path.file_name().map(|n| n.to_os_string()) == file_name)
                {
                    on_change();
                }
            }
            Err(e) => log::warn!("config watcher error: {}", e),
        },
    )
    .context("failed to create config watcher")?;

    debouncer
        .watcher()
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    Ok(debouncer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, port: u16) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            local_port: port,
            remote_host: "10.0.0.5".to_string(),
            remote_port: 5432,
        }
    }

    fn configured() -> Config {
        Config {
            endpoint: RemoteEndpoint {
                host: "gw.example.com".to_string(),
                port: 22,
                user: "deploy".to_string(),
                key_path: "~/.ssh/id_ed25519".to_string(),
            },
            services: vec![svc("db", 15432)],
            ..Config::default()
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(cfg.timing, Timing::default());
        assert_eq!(cfg.endpoint.port, 22);
        assert!(cfg.services.is_empty());
    }

    #[test]
    fn save_then_load_preserves_services() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = configured();
        cfg.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.endpoint, cfg.endpoint);
        assert_eq!(loaded.services, cfg.services);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[endpoint]
host = "gw"
user = "me"

[timing]
backoff = 10

[[services]]
name = "web"
local_port = 8080
remote_host = "app"
remote_port = 80
"#,
        )
        .unwrap();

        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.endpoint.port, 22);
        assert_eq!(cfg.timing.backoff, 10);
        assert_eq!(cfg.timing.poll_interval, 5);
        assert_eq!(cfg.services[0].outbound(), "app:80");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "services = 3").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("devtun config"));
    }

    #[test]
    fn editor_survives_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "editor = \"nano\"\nservices = 3\n").unwrap();
        assert!(Config::load_from(&path).is_err());
        assert_eq!(Config::editor_for(&path), "nano");

        fs::write(&path, "[[[ not toml").unwrap();
        assert_eq!(Config::editor_for(&path), Config::default().resolve_editor());
    }

    #[test]
    fn watch_reports_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        configured().save_to(&path).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let _watcher = watch(&path, move || {
            let _ = tx.send(());
        })
        .unwrap();

        let mut cfg = configured();
        cfg.services.push(svc("cache", 16379));
        cfg.save_to(&path).unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn watch_ignores_sibling_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        configured().save_to(&path).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let _watcher = watch(&path, move || {
            let _ = tx.send(());
        })
        .unwrap();

        fs::write(dir.path().join("devtun.log"), "noise").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(800)).is_err());
    }

    #[test]
    fn durations_never_zero() {
        let t = Timing {
            probe_timeout: 0,
            poll_interval: 0,
            backoff: 0,
            refresh: 0,
        };
        assert_eq!(t.backoff(), Duration::from_secs(1));
        assert_eq!(t.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn validate_rejects_bad_services() {
        let mut cfg = configured();
        cfg.services.push(svc("db", 15433));
        assert_eq!(cfg.validate(), Err(ConfigError::DuplicateName("db".to_string())));

        let mut cfg = configured();
        cfg.services.push(svc("", 1));
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyName));

        let mut cfg = configured();
        cfg.services.push(svc("zero", 0));
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidPort { .. })));

        let mut cfg = configured();
        let mut s = svc("nohost", 1);
        s.remote_host = " ".to_string();
        cfg.services.push(s);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::EmptyRemoteHost("nohost".to_string()))
        );
    }

    #[test]
    fn validate_requires_endpoint() {
        let cfg = Config::default();
        assert_eq!(cfg.validate(), Err(ConfigError::IncompleteEndpoint("host")));
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn add_update_remove() {
        let mut cfg = configured();
        cfg.add_service(svc("cache", 16379)).unwrap();
        assert_eq!(
            cfg.add_service(svc("cache", 1)),
            Err(ConfigError::DuplicateName("cache".to_string()))
        );

        assert_eq!(
            cfg.update_service("cache", svc("db", 1)),
            Err(ConfigError::DuplicateName("db".to_string()))
        );
        assert_eq!(cfg.update_service("cache", svc("redis", 16380)), Ok(true));
        assert_eq!(cfg.service("redis").unwrap().local_port, 16380);
        assert_eq!(cfg.update_service("missing", svc("x", 1)), Ok(false));

        assert_eq!(cfg.remove_service("redis").unwrap().name, "redis");
        assert!(cfg.remove_service("redis").is_none());
        assert_eq!(cfg.services.len(), 1);
    }

    #[test]
    fn resolve_editor_prefers_config() {
        let cfg = Config {
            editor: Some("nano".to_string()),
            ..Config::default()
        };
        assert_eq!(cfg.resolve_editor(), "nano");
    }
}
