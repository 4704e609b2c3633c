//! Configuration file loading.

use serde::{Deserialize, Serialize};
use std::path::Path;
use strata_store::{NodeStoreConfig, SeedKind};

use crate::export::ExportConfig;
use crate::grammar::InducerConfig;
use crate::parallel::ParallelConfig;

/// Top-level configuration, loadable from TOML or JSON. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrataConfig {
    /// How terminals are interpreted
    pub seed_kind: SeedKind,
    /// Grammar induction limits
    pub inducer: InducerConfig,
    /// Node store tuning
    pub store: NodeStoreConfig,
    /// Parallel ingestion tuning
    pub parallel: ParallelConfig,
    /// Export tuning
    pub export: ExportConfig,
}

impl StrataConfig {
    /// Load from a `.toml` or `.json` file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: StrataConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: StrataConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Load `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    fn temp_with_suffix(suffix: &str) -> NamedTempFile {
        Builder::new().suffix(suffix).tempfile().unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = StrataConfig::default();
        assert_eq!(config.inducer.min_occurrences, 2);
        assert_eq!(config.inducer.max_tiers, 30);
        assert_eq!(config.store.max_insert_attempts, 3);
        assert_eq!(config.parallel.batch_size, 256);
        assert_eq!(config.export.memo_capacity, 65_536);
        assert_eq!(config.seed_kind, SeedKind::Unicode);
    }

    #[test]
    fn test_from_toml_file_partial() {
        let mut file = temp_with_suffix(".toml");
        writeln!(
            file,
            r#"
seed_kind = "integer"

[inducer]
max_tiers = 5

[parallel]
max_jobs = 2
"#
        )
        .unwrap();

        let config = StrataConfig::from_file(file.path()).unwrap();
        assert_eq!(config.inducer.max_tiers, 5);
        assert_eq!(config.inducer.min_occurrences, 2);
        assert_eq!(config.parallel.max_jobs, 2);
        assert_eq!(config.parallel.batch_size, 256);
        assert_eq!(config.seed_kind, SeedKind::Integer);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = temp_with_suffix(".json");
        writeln!(
            file,
            r#"{{"export": {{"memo_capacity": 10}}, "store": {{"max_insert_attempts": 7}}}}"#
        )
        .unwrap();

        let config = StrataConfig::from_file(file.path()).unwrap();
        assert_eq!(config.export.memo_capacity, 10);
        assert_eq!(config.store.max_insert_attempts, 7);
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = StrataConfig {
            seed_kind: SeedKind::FloatBits,
            ..StrataConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: StrataConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        let toml_text = toml::to_string(&config).unwrap();
        let back: StrataConfig = toml::from_str(&toml_text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = temp_with_suffix(".yaml");
        assert!(StrataConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_load_without_path() {
        assert_eq!(StrataConfig::load(None).unwrap(), StrataConfig::default());
    }
}
