//! Operator configuration loaded from JSON with environment overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::args::{AllGatherOptions, ReduceScatterOptions};
use crate::{Error, Result};

/// Policy defaults for both fused operators.
///
/// ```json
/// { "reduce_scatter": { "n_split": 2 }, "all_gather": { "use_p2p_read": false } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub reduce_scatter: ReduceScatterOptions,
    #[serde(default)]
    pub all_gather: AllGatherOptions,
}

impl OperatorConfig {
    /// Load from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// # Errors
    /// Returns an error if `json` is not a valid configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `TILEFUSE_*` overrides from the process environment.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if a variable does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Knobs shared by both operators (`N_SPLIT`, `PER_TILE_FLAGS`,
    /// `USE_MEMCPY_ASYNC`, `USE_1D_RING`, `USE_P2P_READ`) apply to both.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if a value does not parse.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let rs = &mut self.reduce_scatter;
        let ag = &mut self.all_gather;

        if let Some(v) = parse_var::<usize>(&lookup, "TILEFUSE_REDUCE_SCATTER_NUM_BLOCKS")? {
            rs.reduce_scatter_num_blocks = v;
        }
        if let Some(v) = parse_bool(&lookup, "TILEFUSE_USE_BARRIER_QUEUE")? {
            rs.use_barrier_queue = v;
        }
        if let Some(v) = parse_bool(&lookup, "TILEFUSE_USE_GEMMK")? {
            rs.use_gemmk = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "TILEFUSE_N_SPLIT")? {
            rs.n_split = v;
            ag.n_split = v;
        }
        if let Some(v) = parse_bool(&lookup, "TILEFUSE_PER_TILE_FLAGS")? {
            rs.per_tile_flags = v;
            ag.per_tile_flags = v;
        }
        if let Some(v) = parse_bool(&lookup, "TILEFUSE_USE_MEMCPY_ASYNC")? {
            rs.use_memcpy_async = v;
            ag.use_memcpy_async = v;
        }
        if let Some(v) = parse_bool(&lookup, "TILEFUSE_USE_1D_RING")? {
            rs.use_1d_ring = v;
            ag.use_1d_ring = v;
        }
        if let Some(v) = parse_bool(&lookup, "TILEFUSE_USE_P2P_READ")? {
            rs.use_p2p_read = v;
            ag.use_p2p_read = v;
        }
        debug!(config = ?self, "operator config after overrides");
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::invalid(format!("{key}={raw} is not a valid value")))
        })
        .transpose()
}

/// Accepts `1/0`, `true/false`, `on/off`, `yes/no`.
pub fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    lookup(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" => Ok(false),
            _ => Err(Error::invalid(format!("{key}={raw} is not a boolean"))),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_json_partial() {
        let config = OperatorConfig::from_json(
            r#"{"reduce_scatter": {"n_split": 2, "use_p2p_read": false}}"#,
        )
        .unwrap();
        assert_eq!(config.reduce_scatter.n_split, 2);
        assert!(!config.reduce_scatter.use_p2p_read);
        assert_eq!(config.reduce_scatter.reduce_scatter_num_blocks, 12);
        assert_eq!(config.all_gather, AllGatherOptions::default());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            OperatorConfig::from_json("{ not json"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = OperatorConfig::default();
        config
            .apply_overrides(lookup(&[
                ("TILEFUSE_N_SPLIT", "4"),
                ("TILEFUSE_USE_GEMMK", "off"),
                ("TILEFUSE_USE_1D_RING", "0"),
            ]))
            .unwrap();
        assert_eq!(config.reduce_scatter.n_split, 4);
        assert_eq!(config.all_gather.n_split, 4);
        assert!(!config.reduce_scatter.use_gemmk);
        assert!(!config.all_gather.use_1d_ring);
    }

    #[test]
    fn test_bad_override() {
        let mut config = OperatorConfig::default();
        let err = config
            .apply_overrides(lookup(&[("TILEFUSE_PER_TILE_FLAGS", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("TILEFUSE_PER_TILE_FLAGS"));
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("tilefuse-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ops.json");
        std::fs::write(&path, r#"{"all_gather": {"sub_world_size": 4}}"#).unwrap();
        let config = OperatorConfig::from_file(&path).unwrap();
        assert_eq!(config.all_gather.sub_world_size, 4);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
