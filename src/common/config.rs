use std::{collections::HashSet, path::Path};

use anyhow::{bail, Context};
use ethers::types::Address;
use serde::Deserialize;

use super::types::EntryPointVersion;

/// Environment variable holding the comma-separated bundler private keys.
pub const PRIV_KEYS_ENV: &str = "GUNDLER_PRIV_KEYS";

const DEFAULT_MAX_BUNDLE_SIZE: usize = 5;

/// Runtime mode of the process.
///
/// Debug-only RPC methods are registered only in `Debug` mode.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Debug,
    Dev,
    Prod,
}

/// Validated bundler configuration.
#[derive(Clone, Debug)]
pub struct GundlerConfig {
    pub ethereum_rpc: String,
    pub port: u16,
    pub beneficiary: Address,
    pub entry_points: Vec<EntryPointVersion>,
    pub mode: Mode,
    pub max_bundle_size: usize,
}

/// On-disk configuration shape. Unknown fields are tolerated.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    ethereum_rpc: String,
    port: u16,
    #[serde(default)]
    beneficiary: String,
    #[serde(default)]
    supported_entry_points: Vec<String>,
    mode: Mode,
    #[serde(default)]
    max_bundle_size: usize,
}

impl GundlerConfig {
    /// Loads and validates the configuration from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("error reading config file {}", path.display()))?;
        let raw: RawConfig =
            serde_json::from_str(&data).context("error parsing config file")?;
        raw.validate()
    }
}

impl RawConfig {
    fn validate(self) -> anyhow::Result<GundlerConfig> {
        if self.ethereum_rpc.is_empty() {
            bail!("ethereum_rpc is required");
        }
        if self.beneficiary.is_empty() {
            bail!("beneficiary is required");
        }
        let beneficiary = self
            .beneficiary
            .parse::<Address>()
            .with_context(|| format!("beneficiary address {} is invalid", self.beneficiary))?;

        if self.supported_entry_points.is_empty() {
            bail!("supported_entry_points must contain at least one entry point address");
        }
        let mut seen = HashSet::new();
        let mut entry_points = Vec::with_capacity(self.supported_entry_points.len());
        for raw_address in &self.supported_entry_points {
            let address = raw_address
                .parse::<Address>()
                .with_context(|| format!("entrypoint address {raw_address} is invalid"))?;
            let Some(version) = EntryPointVersion::from_address(address) else {
                bail!("entrypoint address {raw_address} is not a known entry point deployment");
            };
            if !seen.insert(version) {
                bail!("entrypoint address {raw_address} is listed more than once");
            }
            entry_points.push(version);
        }

        let max_bundle_size = if self.max_bundle_size == 0 {
            DEFAULT_MAX_BUNDLE_SIZE
        } else {
            self.max_bundle_size
        };

        Ok(GundlerConfig {
            ethereum_rpc: self.ethereum_rpc,
            port: self.port,
            beneficiary,
            entry_points,
            mode: self.mode,
            max_bundle_size,
        })
    }
}

/// Reads the bundler private keys from the environment.
pub fn private_keys_from_env() -> anyhow::Result<Vec<String>> {
    let raw = std::env::var(PRIV_KEYS_ENV)
        .map_err(|_| anyhow::anyhow!("{PRIV_KEYS_ENV} environment variable is required"))?;
    let keys = parse_private_keys(&raw);
    if keys.is_empty() {
        bail!("{PRIV_KEYS_ENV} environment variable is empty");
    }
    Ok(keys)
}

fn parse_private_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> anyhow::Result<GundlerConfig> {
        serde_json::from_str::<RawConfig>(json)
            .map_err(anyhow::Error::from)
            .and_then(RawConfig::validate)
    }

    const FULL: &str = r#"{
        "ethereum_rpc": "http://localhost:8545",
        "port": 4337,
        "beneficiary": "0x1306b01bc3e4ad202612d3843387e94737673f53",
        "supported_entry_points": ["0x0000000071727De22E5E9d8BAf0edAc6f37da032"],
        "mode": "DEBUG",
        "max_bundle_size": 10
    }"#;

    #[test]
    fn test_parse_full_config() {
        let config = parse(FULL).unwrap();
        assert_eq!(config.port, 4337);
        assert_eq!(config.mode, Mode::Debug);
        assert_eq!(config.max_bundle_size, 10);
        assert_eq!(config.entry_points, vec![EntryPointVersion::V0_7]);
    }

    #[test]
    fn test_max_bundle_size_defaults() {
        let json = FULL.replace("\"max_bundle_size\": 10", "\"max_bundle_size\": 0");
        assert_eq!(parse(&json).unwrap().max_bundle_size, 5);
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let json = FULL.replace(
            "\"port\": 4337,",
            "\"port\": 4337, \"extra_field\": \"ignored\",",
        );
        assert!(parse(&json).is_ok());
    }

    #[test]
    fn test_missing_rpc_rejected() {
        let json = FULL.replace("http://localhost:8545", "");
        assert!(parse(&json).unwrap_err().to_string().contains("ethereum_rpc"));
    }

    #[test]
    fn test_unknown_entry_point_rejected() {
        let json = FULL.replace(
            "0x0000000071727De22E5E9d8BAf0edAc6f37da032",
            "0x1306b01bc3e4ad202612d3843387e94737673f53",
        );
        assert!(parse(&json).is_err());
    }

    #[test]
    fn test_duplicate_entry_point_rejected() {
        let json = FULL.replace(
            "[\"0x0000000071727De22E5E9d8BAf0edAc6f37da032\"]",
            "[\"0x0000000071727De22E5E9d8BAf0edAc6f37da032\", \"0x0000000071727De22E5E9d8BAf0edAc6f37da032\"]",
        );
        assert!(parse(&json).unwrap_err().to_string().contains("more than once"));
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let json = FULL.replace("DEBUG", "STAGING");
        assert!(parse(&json).is_err());
    }

    #[test]
    fn test_all_modes_parse() {
        for (raw, mode) in [("DEBUG", Mode::Debug), ("DEV", Mode::Dev), ("PROD", Mode::Prod)] {
            let json = FULL.replace("DEBUG", raw);
            assert_eq!(parse(&json).unwrap().mode, mode);
        }
    }

    #[test]
    fn test_parse_private_keys() {
        assert_eq!(
            parse_private_keys(" 0xabc , def,, ghi "),
            vec!["0xabc", "def", "ghi"]
        );
        assert!(parse_private_keys("  ,  ").is_empty());
    }
}
