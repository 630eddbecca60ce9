use crate::crypto::{EncryptionPolicy, KdfParams};
use crate::delta::reader::DEFAULT_LITERAL_LIMIT;
use crate::filter::{FilterChain, FilterSpec};
use crate::layout::MediumLayout;
use crate::types::DEFAULT_BLOCK_SIZE;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Settings of one incremental medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumConfig {
    #[serde(default)]
    pub layout: MediumLayout,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub encryption: EncryptionPolicy,
    /// Detect changes by content hash instead of size and mtime.
    #[serde(default)]
    pub verify_content: bool,
    #[serde(default)]
    pub track_directories: bool,
    #[serde(default)]
    pub track_permissions: bool,
    /// Maximum number of delta records stacked on one full payload.
    #[serde(default = "default_chain_limit")]
    pub delta_chain_limit: u32,
    #[serde(default = "default_literal_limit")]
    pub literal_limit: usize,
    #[serde(default)]
    pub kdf: KdfParams,
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_chain_limit() -> u32 {
    1
}

fn default_literal_limit() -> usize {
    DEFAULT_LITERAL_LIMIT
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            layout: MediumLayout::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            filters: Vec::new(),
            encryption: EncryptionPolicy::default(),
            verify_content: false,
            track_directories: false,
            track_permissions: false,
            delta_chain_limit: default_chain_limit(),
            literal_limit: DEFAULT_LITERAL_LIMIT,
            kdf: KdfParams::default(),
        }
    }
}

impl MediumConfig {
    /// Checks every setting and compiles the filter chain.
    pub fn validate(&self) -> Result<FilterChain> {
        if self.block_size == 0 || u32::try_from(self.block_size).is_err() {
            return Err(Error::Configuration(format!("Invalid block size: {}", self.block_size)));
        }
        if self.delta_chain_limit == 0 {
            return Err(Error::Configuration("Delta chain limit must be at least 1".to_string()));
        }
        if self.literal_limit == 0 {
            return Err(Error::Configuration("Literal limit must be positive".to_string()));
        }
        self.encryption.validate()?;
        FilterChain::from_specs(self.filters.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionAlgorithm;
    use crate::filter::CriterionSpec;

    #[test]
    fn test_defaults_are_valid() {
        let config = MediumConfig::default();
        assert!(config.validate().unwrap().is_empty());
        assert_eq!(config.delta_chain_limit, 1);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_invalid_settings() {
        let zero_block = MediumConfig {
            block_size: 0,
            ..Default::default()
        };
        assert!(matches!(zero_block.validate(), Err(Error::Configuration(_))));

        let keyless = MediumConfig {
            encryption: EncryptionPolicy {
                enabled: true,
                algorithm: EncryptionAlgorithm::Aes256Gcm,
                key: None,
            },
            ..Default::default()
        };
        assert!(matches!(keyless.validate(), Err(Error::Configuration(_))));

        let bad_filter = MediumConfig {
            filters: vec![FilterSpec {
                exclude: true,
                criterion: CriterionSpec::Regex { pattern: "[".to_string() },
            }],
            ..Default::default()
        };
        assert!(matches!(bad_filter.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MediumConfig =
            serde_json::from_str(r#"{"layout": "tar_gz", "filters": [{"kind": "locked", "exclude": true}]}"#).unwrap();
        assert_eq!(config.layout, MediumLayout::TarGz);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.validate().unwrap().len(), 1);
    }
}
