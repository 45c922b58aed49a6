//! Azure Blob Storage backend.
//!
//! Talks to the Blob REST API directly over `reqwest` and authenticates every
//! request with a Shared Key signature. All file uploads use the staged
//! block protocol from [`crate::blocks`], since a single Put Block is capped
//! at the block size.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use dray_types::BlobLocation;
use hmac::{Hmac, Mac};
use reqwest::{Method, Response, StatusCode, Url};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::blocks::{upload_in_blocks, BlockService, BlockToken, DEFAULT_BLOCK_SIZE};
use crate::cancel::CancelFlag;
use crate::error::{StoreError, StoreResult};
use crate::files;
use crate::traits::{BlobStore, ObjectInfo};

/// REST API version sent with every request.
const API_VERSION: &str = "2020-10-02";

/// Storage account name and decoded shared key.
#[derive(Clone)]
pub struct AzureCredentials {
    account: String,
    key: Vec<u8>,
}

impl AzureCredentials {
    /// `key` is the base64 account key shown in the portal.
    pub fn new(account: impl Into<String>, key: &str) -> StoreResult<Self> {
        let account = account.into();
        if account.is_empty() {
            return Err(StoreError::Config("Azure account name is empty".into()));
        }
        let key = STANDARD
            .decode(key.trim())
            .map_err(|e| StoreError::Config(format!("Azure account key is not base64: {e}")))?;
        if key.is_empty() {
            return Err(StoreError::Config("Azure account key is empty".into()));
        }
        Ok(Self { account, key })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// HMAC-SHA256 of `string_to_sign`, base64 encoded.
    pub fn sign(&self, string_to_sign: &str) -> StoreResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| StoreError::Config(e.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Build the Shared Key string-to-sign for one request.
///
/// `ms_headers` are the `x-ms-*` headers sent; `query` holds decoded query
/// pairs. Standard headers other than Content-Length are never sent by this
/// client and sign as empty lines.
pub fn string_to_sign(
    method: &Method,
    account: &str,
    url_path: &str,
    query: &[(String, String)],
    ms_headers: &[(&str, String)],
    content_length: u64,
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut headers: Vec<(String, &str)> = ms_headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .collect();
    headers.sort();

    let mut params: Vec<(String, &str)> = query
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
        .collect();
    params.sort();

    let mut out = format!("{method}\n\n\n{length}\n\n\n\n\n\n\n\n\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}:{value}\n"));
    }
    out.push_str(&format!("/{account}{url_path}"));
    for (name, value) in params {
        out.push_str(&format!("\n{name}:{value}"));
    }
    out
}

/// One page of a List Blobs response.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    pub blobs: Vec<ObjectInfo>,
    pub next_marker: Option<String>,
}

/// Parse a List Blobs XML body.
///
/// Only `Name`, `Content-Length`, and `NextMarker` are read, so a minimal tag
/// scanner is enough.
pub fn parse_list_page(xml: &str) -> ListPage {
    let mut page = ListPage::default();
    let mut rest = xml;
    while let Some(start) = rest.find("<Blob>") {
        let after = &rest[start + "<Blob>".len()..];
        let end = after.find("</Blob>").unwrap_or(after.len());
        let blob = &after[..end];
        if let Some(name) = element(blob, "Name") {
            let size = element(blob, "Content-Length")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            page.blobs.push(ObjectInfo::new(unescape(name), size));
        }
        rest = &after[end..];
    }
    page.next_marker = element(xml, "NextMarker")
        .filter(|m| !m.is_empty())
        .map(unescape);
    page
}

fn element<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let len = xml[start..].find(&close)?;
    Some(&xml[start..start + len])
}

/// Decode the predefined XML entities and numeric character references in
/// one left-to-right pass. Anything unrecognised is kept verbatim.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .and_then(|semi| entity(&tail[1..semi]).map(|c| (c, semi)));
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "amp" => Some('&'),
        _ => {
            let digits = name.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn block_list_body(tokens: &[BlockToken]) -> String {
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for token in tokens {
        body.push_str("<Uncommitted>");
        body.push_str(token.as_str());
        body.push_str("</Uncommitted>");
    }
    body.push_str("</BlockList>");
    body
}

/// Azure Blob Storage container backend.
pub struct AzureBlobStore {
    http: reqwest::Client,
    credentials: AzureCredentials,
    location: BlobLocation,
    endpoint: String,
    block_size: u64,
}

impl AzureBlobStore {
    pub fn new(credentials: AzureCredentials, location: BlobLocation) -> Self {
        let endpoint = format!("https://{}.blob.core.windows.net", credentials.account());
        Self {
            http: reqwest::Client::new(),
            credentials,
            location,
            endpoint,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Block size for staged uploads, capped at [`DEFAULT_BLOCK_SIZE`].
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.clamp(1, DEFAULT_BLOCK_SIZE);
        self
    }

    /// Point at a different service endpoint, e.g. the Azurite emulator.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn container_url(&self, query: &[(&str, &str)]) -> StoreResult<Url> {
        self.url(None, query)
    }

    fn blob_url(&self, path: &str, query: &[(&str, &str)]) -> StoreResult<Url> {
        self.url(Some(path), query)
    }

    fn url(&self, path: Option<&str>, query: &[(&str, &str)]) -> StoreResult<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| StoreError::Config(format!("bad endpoint {}: {e}", self.endpoint)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StoreError::Config(format!("bad endpoint {}", self.endpoint)))?;
            segments.pop_if_empty().push(&self.location.container);
            if let Some(path) = path {
                for part in self.location.key(path).split('/') {
                    segments.push(part);
                }
            }
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        extra_headers: &[(&'static str, String)],
        body: Option<Bytes>,
    ) -> StoreResult<Response> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let mut ms_headers = vec![("x-ms-date", date), ("x-ms-version", API_VERSION.to_string())];
        ms_headers.extend(extra_headers.iter().cloned());

        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let content_length = body.as_ref().map_or(0, |b| b.len() as u64);
        let signature = self.credentials.sign(&string_to_sign(
            &method,
            self.credentials.account(),
            url.path(),
            &query,
            &ms_headers,
            content_length,
        ))?;

        let mut request = self.http.request(method, url);
        for (name, value) in &ms_headers {
            request = request.header(*name, value);
        }
        request = request.header(
            "Authorization",
            format!("SharedKey {}:{}", self.credentials.account(), signature),
        );
        if let Some(body) = body {
            request = request.body(body);
        }

        request.send().await.map_err(|e| StoreError::Connectivity {
            backend: self.describe(),
            reason: e.to_string(),
        })
    }

    async fn expect_success(op: &'static str, path: &str, response: Response) -> StoreResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let code = element(&body, "Code").unwrap_or("");
        Err(StoreError::request(op, path, format!("{status} {code}").trim()))
    }

    async fn put_blob(&self, path: &str, data: Bytes) -> StoreResult<()> {
        let url = self.blob_url(path, &[])?;
        let response = self
            .execute(
                Method::PUT,
                url,
                &[("x-ms-blob-type", "BlockBlob".to_string())],
                Some(data),
            )
            .await?;
        Self::expect_success("put blob", path, response).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    #[instrument(skip(self), fields(container = %self.location))]
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let full_prefix = self.location.key(prefix);
        let mut objects = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![
                ("restype", "container"),
                ("comp", "list"),
                ("prefix", full_prefix.as_str()),
            ];
            if let Some(m) = &marker {
                query.push(("marker", m.as_str()));
            }
            let url = self.container_url(&query)?;

            let response = self
                .execute(Method::GET, url, &[], None)
                .await
                .map_err(|e| StoreError::List {
                    prefix: full_prefix.clone(),
                    reason: e.to_string(),
                })?;
            let response = Self::expect_success("list", &full_prefix, response)
                .await
                .map_err(|e| StoreError::List {
                    prefix: full_prefix.clone(),
                    reason: e.to_string(),
                })?;
            let body = response.text().await.map_err(|e| StoreError::List {
                prefix: full_prefix.clone(),
                reason: e.to_string(),
            })?;

            let page = parse_list_page(&body);
            for blob in page.blobs {
                if let Some(relative) = self.location.relative(&blob.path) {
                    objects.push(ObjectInfo::new(relative, blob.size));
                }
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        debug!(count = objects.len(), "listed Azure blobs");
        Ok(objects)
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Bytes>> {
        let url = self.blob_url(path, &[])?;
        let response = self.execute(Method::GET, url, &[], None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_success("get", path, response).await?;
        let data = response
            .bytes()
            .await
            .map_err(|e| StoreError::request("get", path, e))?;
        Ok(Some(data))
    }

    async fn put_bytes(&self, path: &str, data: Bytes) -> StoreResult<()> {
        self.put_blob(path, data).await
    }

    #[instrument(skip(self, cancel), fields(container = %self.location))]
    async fn put_file(&self, path: &str, src: &Path, cancel: &CancelFlag) -> StoreResult<()> {
        let upload = upload_in_blocks(self, path, src, self.block_size, cancel).await?;
        debug!(path, blocks = upload.blocks, bytes = upload.bytes, "committed block blob");
        Ok(())
    }

    async fn download(&self, path: &str, dst: &Path, cancel: &CancelFlag) -> StoreResult<()> {
        cancel.check()?;
        let url = self.blob_url(path, &[])?;
        let response = self.execute(Method::GET, url, &[], None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let mut response = Self::expect_success("get", path, response).await?;

        let mut out = files::PartialFile::create(dst).await?;
        loop {
            let next = match cancel.check() {
                Ok(()) => response
                    .chunk()
                    .await
                    .map_err(|e| StoreError::request("get", path, e)),
                Err(e) => Err(e),
            };
            let written = match next {
                Ok(Some(chunk)) => out.write(&chunk).await,
                Ok(None) => break,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                out.discard().await;
                return Err(e);
            }
        }
        out.commit().await
    }

    async fn validate(&self) -> StoreResult<()> {
        let url = self.container_url(&[("restype", "container")])?;
        let response = self.execute(Method::HEAD, url, &[], None).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Connectivity {
                backend: self.describe(),
                reason: format!("container check returned {}", response.status()),
            })
        }
    }

    fn describe(&self) -> String {
        format!("Azure blob storage({})", self.location)
    }
}

#[async_trait]
impl BlockService for AzureBlobStore {
    async fn stage_block(&self, path: &str, token: &BlockToken, data: Bytes) -> StoreResult<()> {
        let url = self.blob_url(path, &[("comp", "block"), ("blockid", token.as_str())])?;
        let response = self.execute(Method::PUT, url, &[], Some(data)).await?;
        Self::expect_success("put block", path, response).await?;
        Ok(())
    }

    async fn commit_block_list(&self, path: &str, tokens: &[BlockToken]) -> StoreResult<()> {
        let url = self.blob_url(path, &[("comp", "blocklist")])?;
        let body = Bytes::from(block_list_body(tokens));
        let response = self.execute(Method::PUT, url, &[], Some(body)).await?;
        Self::expect_success("put block list", path, response).await?;
        Ok(())
    }

    async fn create_empty(&self, path: &str) -> StoreResult<()> {
        self.put_blob(path, Bytes::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(location: &str) -> AzureBlobStore {
        let creds = AzureCredentials::new("acct", &STANDARD.encode(b"secret")).unwrap();
        AzureBlobStore::new(creds, BlobLocation::parse(location).unwrap())
    }

    #[test]
    fn credentials_reject_bad_keys() {
        assert!(matches!(
            AzureCredentials::new("acct", "not base64!!"),
            Err(StoreError::Config(_))
        ));
        assert!(AzureCredentials::new("", "c2VjcmV0").is_err());
    }

    #[test]
    fn debug_redacts_key() {
        let creds = AzureCredentials::new("acct", "c2VjcmV0").unwrap();
        assert!(!format!("{creds:?}").contains("secret"));
    }

    #[test]
    fn signing_is_deterministic_and_key_dependent() {
        let a = AzureCredentials::new("acct", "c2VjcmV0").unwrap();
        let b = AzureCredentials::new("acct", "b3RoZXI=").unwrap();
        assert_eq!(a.sign("x").unwrap(), a.sign("x").unwrap());
        assert_ne!(a.sign("x").unwrap(), b.sign("x").unwrap());
        assert_eq!(STANDARD.decode(a.sign("x").unwrap()).unwrap().len(), 32);
    }

    #[test]
    fn string_to_sign_layout() {
        let sts = string_to_sign(
            &Method::PUT,
            "acct",
            "/images/sub/repositories/ruby/latest",
            &[("comp".into(), "block".into()), ("blockid".into(), "MTA=".into())],
            &[
                ("x-ms-version", API_VERSION.to_string()),
                ("x-ms-date", "Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            ],
            3,
        );
        let expected = "PUT\n\n\n3\n\n\n\n\n\n\n\n\n\
            x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
            x-ms-version:2020-10-02\n\
            /acct/images/sub/repositories/ruby/latest\n\
            blockid:MTA=\n\
            comp:block";
        assert_eq!(sts, expected);
    }

    #[test]
    fn zero_length_signs_empty() {
        let sts = string_to_sign(&Method::GET, "a", "/c", &[], &[], 0);
        assert_eq!(sts, "GET\n\n\n\n\n\n\n\n\n\n\n\n/a/c");
    }

    #[test]
    fn urls_apply_sub_path_and_encoding() {
        let s = store("images/team");
        let url = s.blob_url("repositories/my app/latest", &[]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://acct.blob.core.windows.net/images/team/repositories/my%20app/latest"
        );
        let list = s.container_url(&[("restype", "container"), ("comp", "list")]).unwrap();
        assert_eq!(
            list.as_str(),
            "https://acct.blob.core.windows.net/images?restype=container&comp=list"
        );
    }

    #[test]
    fn emulator_endpoint_keeps_account_segment() {
        let s = store("c").with_endpoint("http://127.0.0.1:10000/devstoreaccount1/");
        let url = s.blob_url("k", &[]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:10000/devstoreaccount1/c/k");
    }

    #[test]
    fn parses_list_page() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
            <EnumerationResults ContainerName="images">
              <Blobs>
                <Blob><Name>repositories/ruby/latest</Name><Properties><Content-Length>3</Content-Length></Properties></Blob>
                <Blob><Name>repositories/ruby/latest.sum</Name><Properties><Content-Length>40</Content-Length></Properties></Blob>
                <Blob><Name>a&amp;b</Name><Properties></Properties></Blob>
              </Blobs>
              <NextMarker>2!72!MDAw</NextMarker>
            </EnumerationResults>"#;
        let page = parse_list_page(xml);
        assert_eq!(
            page.blobs,
            vec![
                ObjectInfo::new("repositories/ruby/latest", 3),
                ObjectInfo::new("repositories/ruby/latest.sum", 40),
                ObjectInfo::new("a&b", 0),
            ]
        );
        assert_eq!(page.next_marker.as_deref(), Some("2!72!MDAw"));
    }

    #[test]
    fn list_names_decode_character_references() {
        let xml = "<Blobs>\
            <Blob><Name>a&#x26;b</Name></Blob>\
            <Blob><Name>caf&#233;/tag</Name></Blob>\
            <Blob><Name>x&amp;lt;y</Name></Blob>\
            <Blob><Name>lone &amp and &#xZZ;</Name></Blob>\
            </Blobs>";
        let names: Vec<_> = parse_list_page(xml)
            .blobs
            .into_iter()
            .map(|b| b.path)
            .collect();
        assert_eq!(names, vec!["a&b", "café/tag", "x&lt;y", "lone &amp and &#xZZ;"]);
    }

    #[test]
    fn empty_next_marker_ends_paging() {
        let page = parse_list_page("<EnumerationResults><Blobs /><NextMarker /></EnumerationResults>");
        assert!(page.blobs.is_empty());
        assert!(page.next_marker.is_none());
    }

    #[test]
    fn block_list_keeps_order() {
        let body = block_list_body(&[BlockToken::for_id(10), BlockToken::for_id(11)]);
        assert!(body.ends_with(
            "<BlockList><Uncommitted>MTA=</Uncommitted><Uncommitted>MTE=</Uncommitted></BlockList>"
        ));
    }
}
