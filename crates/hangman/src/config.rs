//! Coordinator configuration.
//!
//! Built programmatically with the `with_*` methods or read from the
//! environment with [`CoordinatorConfig::from_env`]:
//!
//! | Variable | Default |
//! |---|---|
//! | `HANGMAN_RUNTIME_DIR` | `$XDG_RUNTIME_DIR`, else the system temp dir |
//! | `HANGMAN_TRANSPORT` | `abstract` on Linux, `named` elsewhere |
//! | `HANGMAN_CONNECT_TIMEOUT_SECS` | `300` |
//! | `HANGMAN_REPLY` | `await` |
//! | `HANGMAN_MAX_PARALLEL` | `4` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::{ChannelAddress, TransportKind};
use crate::instance::ProcessIdentity;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_PARALLEL: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("cannot determine program identity: {0}")]
    Identity(#[source] std::io::Error),
}

/// Whether a secondary waits for the primary's reply before exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    #[default]
    Await,
    None,
}

impl std::str::FromStr for ReplyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "await" => Ok(Self::Await),
            "none" => Ok(Self::None),
            other => Err(format!("expected 'await' or 'none', got '{other}'")),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "named" => Ok(Self::Named),
            #[cfg(target_os = "linux")]
            "abstract" => Ok(Self::Abstract),
            other => Err(format!("unsupported transport '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub identity: ProcessIdentity,
    pub runtime_dir: PathBuf,
    pub transport: TransportKind,
    pub connect_timeout: Duration,
    pub reply_mode: ReplyMode,
    pub max_parallel: usize,
}

impl CoordinatorConfig {
    pub fn new(identity: ProcessIdentity) -> Self {
        Self {
            identity,
            runtime_dir: default_runtime_dir(std::env::var("XDG_RUNTIME_DIR").ok()),
            transport: TransportKind::platform_default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reply_mode: ReplyMode::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Identity from the running executable, settings from `HANGMAN_*`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let identity = ProcessIdentity::current().map_err(ConfigError::Identity)?;
        Self::from_lookup(identity, |key| std::env::var(key).ok())
    }

    /// Like [`CoordinatorConfig::from_env`] with a custom variable source.
    pub fn from_lookup(
        identity: ProcessIdentity,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let runtime_dir = match lookup("HANGMAN_RUNTIME_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_runtime_dir(lookup("XDG_RUNTIME_DIR")),
        };

        let mut config = Self::new(identity).with_runtime_dir(runtime_dir);

        if let Some(transport) = parse_var(&lookup, "HANGMAN_TRANSPORT")? {
            config = config.with_transport(transport);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HANGMAN_CONNECT_TIMEOUT_SECS")? {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(mode) = parse_var(&lookup, "HANGMAN_REPLY")? {
            config = config.with_reply_mode(mode);
        }
        if let Some(max) = parse_var::<usize>(&lookup, "HANGMAN_MAX_PARALLEL")? {
            if max == 0 {
                return Err(ConfigError::Invalid {
                    key: "HANGMAN_MAX_PARALLEL",
                    value: max.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config = config.with_max_parallel(max);
        }

        Ok(config)
    }

    pub fn with_identity(mut self, identity: ProcessIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reply_mode(mut self, mode: ReplyMode) -> Self {
        self.reply_mode = mode;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }

    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir
            .join(format!("{}.lock", self.identity.as_str()))
    }

    pub fn channel_address(&self) -> ChannelAddress {
        ChannelAddress::new(self.transport, self.identity.as_str(), &self.runtime_dir)
    }
}

fn default_runtime_dir(xdg_runtime_dir: Option<String>) -> PathBuf {
    xdg_runtime_dir
        .filter(|dir| Path::new(dir).is_absolute())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: value.clone(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<CoordinatorConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CoordinatorConfig::from_lookup(ProcessIdentity::new("tool"), |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = config(&[]).unwrap();

        assert_eq!(config.runtime_dir, std::env::temp_dir());
        assert_eq!(config.transport, TransportKind::platform_default());
        assert_eq!(config.connect_timeout, Duration::from_secs(300));
        assert_eq!(config.reply_mode, ReplyMode::Await);
        assert_eq!(config.max_parallel, 4);
    }

    #[test]
    fn reads_every_variable() {
        let config = config(&[
            ("HANGMAN_RUNTIME_DIR", "/run/hangman"),
            ("HANGMAN_TRANSPORT", "named"),
            ("HANGMAN_CONNECT_TIMEOUT_SECS", "5"),
            ("HANGMAN_REPLY", "none"),
            ("HANGMAN_MAX_PARALLEL", "8"),
        ])
        .unwrap();

        assert_eq!(config.runtime_dir, PathBuf::from("/run/hangman"));
        assert_eq!(config.transport, TransportKind::Named);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.reply_mode, ReplyMode::None);
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.lock_path(), PathBuf::from("/run/hangman/tool.lock"));
        assert_eq!(
            config.channel_address(),
            ChannelAddress::Named(PathBuf::from("/run/hangman/tool.sock"))
        );
    }

    #[test]
    fn xdg_runtime_dir_is_the_fallback() {
        let config = config(&[("XDG_RUNTIME_DIR", "/run/user/1000")]).unwrap();
        assert_eq!(config.runtime_dir, PathBuf::from("/run/user/1000"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = config(&[("HANGMAN_MAX_PARALLEL", "lots")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "HANGMAN_MAX_PARALLEL",
                ..
            }
        ));

        let err = config(&[("HANGMAN_MAX_PARALLEL", "0")]).unwrap_err();
        assert!(err.to_string().contains("must be at least 1"));

        let err = config(&[("HANGMAN_REPLY", "later")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value \"later\" for HANGMAN_REPLY: expected 'await' or 'none', got 'later'"
        );
    }

    #[test]
    fn builder_overrides() {
        let config = CoordinatorConfig::new(ProcessIdentity::new("a"))
            .with_identity(ProcessIdentity::new("b"))
            .with_runtime_dir("/tmp/x")
            .with_max_parallel(2);

        assert_eq!(config.identity.as_str(), "b");
        assert_eq!(config.lock_path(), PathBuf::from("/tmp/x/b.lock"));
        assert_eq!(config.max_parallel, 2);
    }
}
