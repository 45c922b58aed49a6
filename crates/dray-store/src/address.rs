//! Remote address strings and backend selection.
//!
//! ```text
//! s3://bucket[/path][?region=R&endpoint=URL]
//! az://container[/path]        (also azure://)
//! file:///srv/images           (or any plain path)
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use dray_types::BlobLocation;
use tracing::info;

use crate::azure::{AzureBlobStore, AzureCredentials};
use crate::blocks::DEFAULT_BLOCK_SIZE;
use crate::error::{StoreError, StoreResult};
use crate::local::LocalBlobStore;
use crate::s3::{S3BlobStore, S3Options};
use crate::traits::BlobStore;

/// A parsed remote address. Chosen once at startup.
#[derive(Clone, Debug)]
pub enum RemoteAddress {
    Local(PathBuf),
    S3(S3Options),
    Azure(BlobLocation),
}

impl RemoteAddress {
    pub fn parse(address: &str) -> StoreResult<Self> {
        let invalid = |reason: &str| StoreError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = address.strip_prefix("s3://") {
            let (target, query) = match rest.split_once('?') {
                Some((target, query)) => (target, Some(query)),
                None => (rest, None),
            };
            let location =
                BlobLocation::parse(target).map_err(|_| invalid("missing bucket name"))?;
            let mut options = S3Options::new(location);
            for pair in query.into_iter().flat_map(|q| q.split('&')) {
                if pair.is_empty() {
                    continue;
                }
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                match name {
                    "region" if !value.is_empty() => options = options.with_region(value),
                    "endpoint" if !value.is_empty() => options = options.with_endpoint_url(value),
                    "region" | "endpoint" => return Err(invalid(&format!("empty {name}"))),
                    other => return Err(invalid(&format!("unknown parameter '{other}'"))),
                }
            }
            return Ok(Self::S3(options));
        }

        if let Some(rest) = address
            .strip_prefix("az://")
            .or_else(|| address.strip_prefix("azure://"))
        {
            let location = BlobLocation::parse(rest).map_err(|_| invalid("missing container name"))?;
            return Ok(Self::Azure(location));
        }

        let path = address.strip_prefix("file://").unwrap_or(address);
        if path.is_empty() {
            return Err(invalid("empty path"));
        }
        Ok(Self::Local(PathBuf::from(path)))
    }

    /// Short backend name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::S3(_) => "s3",
            Self::Azure(_) => "azure",
        }
    }
}

impl FromStr for RemoteAddress {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::S3(options) => write!(f, "s3://{}", options.location),
            Self::Azure(location) => write!(f, "az://{location}"),
        }
    }
}

/// Settings for opening a store that the address string does not carry.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Azure has no ambient provider chain; S3 credentials come from the
    /// AWS environment instead.
    pub azure: Option<AzureCredentials>,
    /// Override for the Azure service endpoint (emulators, sovereign clouds).
    pub azure_endpoint: Option<String>,
    /// Region for S3 addresses that carry none of their own.
    pub s3_region: Option<String>,
    /// Endpoint for S3 addresses that carry none of their own.
    pub s3_endpoint: Option<String>,
    /// Block size for staged uploads.
    pub block_size: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            azure: None,
            azure_endpoint: None,
            s3_region: None,
            s3_endpoint: None,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Build the backend an address names.
pub async fn open_store(
    address: &RemoteAddress,
    options: &StoreOptions,
) -> StoreResult<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match address {
        RemoteAddress::Local(root) => Arc::new(LocalBlobStore::new(root.clone())),
        RemoteAddress::S3(s3) => {
            let mut s3 = s3.clone();
            if s3.region.is_none() {
                s3.region = options.s3_region.clone();
            }
            if s3.endpoint_url.is_none() {
                s3.endpoint_url = options.s3_endpoint.clone();
            }
            Arc::new(S3BlobStore::connect(s3).await)
        }
        RemoteAddress::Azure(location) => {
            let creds = options.azure.clone().ok_or_else(|| {
                StoreError::Config("AZ_ACCOUNT_NAME or AZ_ACCOUNT_KEY is missing".into())
            })?;
            let mut store =
                AzureBlobStore::new(creds, location.clone()).with_block_size(options.block_size);
            if let Some(endpoint) = &options.azure_endpoint {
                store = store.with_endpoint(endpoint.clone());
            }
            Arc::new(store)
        }
    };
    info!(backend = address.kind(), remote = %store.describe(), "opened remote");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s3_with_query() {
        let addr =
            RemoteAddress::parse("s3://bucket/team?region=eu-west-1&endpoint=http://localhost:9000")
                .unwrap();
        let RemoteAddress::S3(opts) = addr else {
            panic!("expected s3");
        };
        assert_eq!(opts.location.container, "bucket");
        assert_eq!(opts.location.path.as_deref(), Some("team"));
        assert_eq!(opts.region.as_deref(), Some("eu-west-1"));
        assert_eq!(opts.endpoint_url.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn s3_region_is_optional() {
        let RemoteAddress::S3(opts) = RemoteAddress::parse("s3://bucket").unwrap() else {
            panic!("expected s3");
        };
        assert!(opts.region.is_none());
        assert!(opts.location.path.is_none());
    }

    #[test]
    fn rejects_bad_s3_addresses() {
        assert!(RemoteAddress::parse("s3://").is_err());
        assert!(RemoteAddress::parse("s3://b?colour=blue").is_err());
        assert!(RemoteAddress::parse("s3://b?region=").is_err());
    }

    #[test]
    fn parses_azure_forms() {
        for raw in ["az://images/sub", "azure://images/sub/"] {
            let RemoteAddress::Azure(loc) = RemoteAddress::parse(raw).unwrap() else {
                panic!("expected azure");
            };
            assert_eq!(loc.container, "images");
            assert_eq!(loc.path.as_deref(), Some("sub"));
        }
        assert!(RemoteAddress::parse("az://").is_err());
    }

    #[test]
    fn anything_else_is_local() {
        let addr = RemoteAddress::parse("/srv/images").unwrap();
        assert!(matches!(&addr, RemoteAddress::Local(p) if p == &PathBuf::from("/srv/images")));
        let addr = RemoteAddress::parse("file:///srv/images").unwrap();
        assert_eq!(addr.to_string(), "/srv/images");
        assert!(RemoteAddress::parse("").is_err());
    }

    #[test]
    fn display_round_trips_scheme() {
        assert_eq!(RemoteAddress::parse("az://c/p").unwrap().to_string(), "az://c/p");
        assert_eq!(RemoteAddress::parse("s3://b?region=x").unwrap().to_string(), "s3://b");
    }

    #[tokio::test]
    async fn azure_requires_credentials() {
        let addr = RemoteAddress::parse("az://images").unwrap();
        let err = open_store(&addr, &StoreOptions::default()).await.err().unwrap();
        assert!(matches!(err, StoreError::Config(m) if m.contains("AZ_ACCOUNT_NAME")));
    }

    #[tokio::test]
    async fn opens_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let addr = RemoteAddress::parse(dir.path().to_str().unwrap()).unwrap();
        let store = open_store(&addr, &StoreOptions::default()).await.unwrap();
        assert!(store.describe().starts_with("local directory"));
        store.validate().await.unwrap();
    }
}
