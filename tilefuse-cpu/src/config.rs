//! Runtime knobs of the simulated device.

use std::time::Duration;

use tilefuse::config::parse_bool;
use tilefuse::{Error, Result};

/// Behaviour of a [`CpuWorld`](crate::CpuWorld) and the streams it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    /// Upper bound on any single flag, event or mailbox wait. `None` waits
    /// forever, like the device would.
    pub flag_timeout_ms: Option<u64>,
    /// Whether ranks on the same node can load/store each other's buffers.
    pub peer_access: bool,
    /// Log every kernel launch at `debug` instead of `trace`.
    pub log_kernels: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            flag_timeout_ms: Some(30_000),
            peer_access: true,
            log_kernels: false,
        }
    }
}

impl CpuConfig {
    /// Defaults overridden by `TILEFUSE_FLAG_TIMEOUT_MS` (0 disables the
    /// watchdog), `TILEFUSE_DISABLE_P2P` and `TILEFUSE_LOG_KERNELS`.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if a variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup("TILEFUSE_FLAG_TIMEOUT_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                Error::invalid(format!("TILEFUSE_FLAG_TIMEOUT_MS: cannot parse {raw:?}"))
            })?;
            config.flag_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(disable) = parse_bool(&lookup, "TILEFUSE_DISABLE_P2P")? {
            config.peer_access = !disable;
        }
        if let Some(log) = parse_bool(&lookup, "TILEFUSE_LOG_KERNELS")? {
            config.log_kernels = log;
        }
        Ok(config)
    }

    pub fn flag_timeout(&self) -> Option<Duration> {
        self.flag_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        assert_eq!(CpuConfig::from_lookup(lookup(&[])).unwrap(), CpuConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let config = CpuConfig::from_lookup(lookup(&[
            ("TILEFUSE_FLAG_TIMEOUT_MS", "0"),
            ("TILEFUSE_DISABLE_P2P", "1"),
        ]))
        .unwrap();
        assert_eq!(config.flag_timeout_ms, None);
        assert!(!config.peer_access);
    }

    #[test]
    fn test_bad_timeout_rejected() {
        assert!(CpuConfig::from_lookup(lookup(&[("TILEFUSE_FLAG_TIMEOUT_MS", "soon")])).is_err());
    }
}
