use std::path::Path;

use anyhow::Context;
use dray_store::{AzureCredentials, StoreOptions};
use dray_sync::SyncConfig;
use serde::Deserialize;

pub const ACCOUNT_NAME_VAR: &str = "AZ_ACCOUNT_NAME";
pub const ACCOUNT_KEY_VAR: &str = "AZ_ACCOUNT_KEY";

/// Settings file layout:
///
/// ```toml
/// [sync]
/// parallelism = 25
/// block_size = 4000000
///
/// [azure]
/// account_name = "..."
/// account_key = "..."
///
/// [s3]
/// region = "eu-west-1"
/// ```
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub sync: SyncConfig,
    pub azure: AzureSection,
    pub s3: S3Section,
}

#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AzureSection {
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct S3Section {
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl CliConfig {
    /// Read the settings file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Store options from the file, with Azure credentials the file leaves
    /// out taken from `env`.
    pub fn store_options(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<StoreOptions> {
        let name = self.azure.account_name.clone().or_else(|| env(ACCOUNT_NAME_VAR));
        let key = self.azure.account_key.clone().or_else(|| env(ACCOUNT_KEY_VAR));
        let azure = match (name, key) {
            (Some(name), Some(key)) => Some(
                AzureCredentials::new(name, &key).context("invalid Azure credentials")?,
            ),
            _ => None,
        };
        Ok(StoreOptions {
            azure,
            azure_endpoint: self.azure.endpoint.clone(),
            s3_region: self.s3.region.clone(),
            s3_endpoint: self.s3.endpoint.clone(),
            block_size: self.sync.block_size,
        })
    }
}

pub fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}
