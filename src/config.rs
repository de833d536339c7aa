//! Optional TOML configuration for the CLI. Every section may be omitted.
//!
//! ```toml
//! max_connections = 8
//!
//! [policy]
//! average_mode = "credit_weighted"
//!
//! [policy.weights]
//! exam = 0.5
//!
//! [[grants]]
//! actor = "00000000-0000-0000-0000-0000000000a1"
//! capability = "compile"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::access::Grant;
use crate::error::{EngineError, Result};
use crate::policy::Policy;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_connections: u32,
    pub policy: Policy,
    pub grants: Vec<Grant>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            policy: Policy::default(),
            grants: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|err| {
            EngineError::invalid(format!("cannot read config {}: {err}", path.display()))
        })?;
        let config: EngineConfig = toml::from_str(&raw).map_err(|err| {
            EngineError::invalid(format!("invalid config {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(EngineError::invalid("max_connections must be at least 1"));
        }
        self.policy.validate()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use uuid::Uuid;

    use super::*;
    use crate::access::GrantKind;
    use crate::policy::RankingMode;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_path_yields_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn grants_and_policy_are_read() {
        let file = write_config(
            r#"
            max_connections = 8

            [policy]
            ranking_mode = "shared_ties"

            [[grants]]
            actor = "00000000-0000-0000-0000-0000000000a1"
            capability = "compile"
            cohort = "00000000-0000-0000-0000-0000000000c0"

            [[grants]]
            actor = "00000000-0000-0000-0000-0000000000a1"
            capability = "adjust"
            "#,
        );

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.policy.ranking_mode, RankingMode::SharedTies);
        assert_eq!(config.grants.len(), 2);
        assert_eq!(config.grants[0].capability, GrantKind::Compile);
        assert_eq!(config.grants[0].cohort, Some(Uuid::from_u128(0xC0)));
        assert_eq!(config.grants[1].cohort, None);
    }

    #[test]
    fn bad_values_are_invalid_input() {
        let file = write_config("max_connections = 0\n");
        assert!(matches!(
            EngineConfig::load(Some(file.path())),
            Err(EngineError::InvalidInput(_))
        ));

        let file = write_config("[policy.weights]\nexam = -2.0\n");
        assert!(matches!(
            EngineConfig::load(Some(file.path())),
            Err(EngineError::InvalidInput(_))
        ));

        let file = write_config("max_connections = \"many\"\n");
        assert!(EngineConfig::load(Some(file.path())).is_err());
    }
}
