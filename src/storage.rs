//! Object storage access for episode media.
//!
//! Production talks to the Firebase Storage REST API. When Firebase is
//! disabled the in-memory store takes over, so the admin surface still works
//! on a laptop with no credentials.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use log::warn;
use parking_lot::RwLock;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;

use crate::config::StorageConfig;

pub const FIREBASE_STORAGE_ENDPOINT: &str = "https://firebasestorage.googleapis.com/v0";
pub const MOCK_URL_BASE: &str = "https://mock-firebase-url.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters `encodeURIComponent` leaves alone.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// An object found by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Last path segment, e.g. `ep1.mp4`.
    pub name: String,
    /// Full object path, e.g. `videos/ep1.mp4`.
    pub full_path: String,
}

impl StoredObject {
    pub fn from_path(full_path: impl Into<String>) -> Self {
        let full_path = full_path.into();
        let name = full_path
            .rsplit('/')
            .next()
            .unwrap_or(full_path.as_str())
            .to_string();
        Self { name, full_path }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub updated: Option<String>,
}

/// Blocking object-store operations. Callers on the async runtime go through
/// `spawn_blocking`.
pub trait ObjectStorage: Send + Sync {
    /// Objects directly under `prefix`; nested folders are not descended into.
    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>>;

    /// `Ok(None)` means the object does not exist.
    fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>>;

    /// Public download URL, or `Ok(None)` when the object does not exist.
    /// An object without a download token is an error.
    fn download_url(&self, path: &str) -> Result<Option<String>>;

    /// Stores `bytes` at `path` and returns its download URL.
    fn upload(&self, path: &str, content_type: &str, bytes: &[u8]) -> Result<String>;
}

/// Builds the storage backend selected by the config.
pub fn from_config(config: &StorageConfig) -> Arc<dyn ObjectStorage> {
    match config {
        StorageConfig::Firebase { bucket, auth_token } => {
            Arc::new(FirebaseStorage::new(bucket.clone(), auth_token.clone()))
        }
        StorageConfig::Disabled => {
            warn!("Firebase disabled; media objects are kept in memory only");
            Arc::new(MemoryStorage::new())
        }
    }
}

/// Percent-encodes an object path the way `encodeURIComponent` does, which is
/// what the storage API expects inside `/o/<path>`.
pub fn encode_object_path(path: &str) -> String {
    utf8_percent_encode(path, URI_COMPONENT).to_string()
}

fn folder_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Firebase Storage over its REST API.
pub struct FirebaseStorage {
    agent: ureq::Agent,
    endpoint: String,
    bucket: String,
    auth_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ListItem {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    name: String,
    content_type: Option<String>,
    size: Option<String>,
    updated: Option<String>,
    download_tokens: Option<String>,
}

impl FirebaseStorage {
    pub fn new(bucket: String, auth_token: Option<String>) -> Self {
        Self::with_endpoint(FIREBASE_STORAGE_ENDPOINT, bucket, auth_token)
    }

    /// Points the client somewhere else, e.g. the local storage emulator.
    pub fn with_endpoint(
        endpoint: impl Into<String>,
        bucket: String,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket,
            auth_token,
        }
    }

    fn objects_url(&self) -> String {
        format!("{}/b/{}/o", self.endpoint, self.bucket)
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{}", self.objects_url(), encode_object_path(path))
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let request = self.agent.request(method, url);
        match &self.auth_token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }

    fn raw_metadata(&self, path: &str) -> Result<Option<RawMetadata>> {
        match self.request("GET", &self.object_url(path)).call() {
            Ok(response) => response
                .into_json::<RawMetadata>()
                .map(Some)
                .with_context(|| format!("decoding metadata for {path}")),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("fetching metadata for {path}")),
        }
    }

    /// Objects without a download token have no public URL.
    fn download_url_for(&self, raw: &RawMetadata) -> Result<String> {
        let token = raw
            .download_tokens
            .as_deref()
            .and_then(|tokens| tokens.split(',').next())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| anyhow!("{} has no download token", raw.name))?;
        Ok(format!(
            "{}?alt=media&token={token}",
            self.object_url(&raw.name)
        ))
    }
}

impl ObjectStorage for FirebaseStorage {
    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let prefix = folder_prefix(prefix);
        let url = self.objects_url();
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .request("GET", &url)
                .query("prefix", &prefix)
                .query("delimiter", "/");
            if let Some(token) = &page_token {
                request = request.query("pageToken", token);
            }

            let page: ListResponse = request
                .call()
                .with_context(|| format!("listing {prefix} in bucket {}", self.bucket))?
                .into_json()
                .context("decoding storage listing")?;

            // Console-created folders show up as a `videos/` placeholder item.
            objects.extend(
                page.items
                    .into_iter()
                    .map(|item| StoredObject::from_path(item.name))
                    .filter(|object| !object.name.is_empty()),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(objects)
    }

    fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self.raw_metadata(path)?.map(|raw| ObjectMetadata {
            content_type: raw.content_type,
            size: raw.size.and_then(|size| size.parse().ok()),
            updated: raw.updated,
        }))
    }

    fn download_url(&self, path: &str) -> Result<Option<String>> {
        self.raw_metadata(path)?
            .map(|raw| self.download_url_for(&raw))
            .transpose()
    }

    fn upload(&self, path: &str, content_type: &str, bytes: &[u8]) -> Result<String> {
        let raw: RawMetadata = self
            .request("POST", &self.objects_url())
            .query("uploadType", "media")
            .query("name", path)
            .set("Content-Type", content_type)
            .send_bytes(bytes)
            .with_context(|| format!("uploading {path}"))?
            .into_json()
            .with_context(|| format!("decoding upload response for {path}"))?;
        self.download_url_for(&raw)
            .with_context(|| format!("uploaded {path} but got no download URL"))
    }
}

struct MemoryObject {
    content_type: String,
    size: u64,
    updated: String,
}

/// Process-local object store used when Firebase is disabled and in tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, MemoryObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, content_type: &str, bytes: &[u8]) {
        self.objects.write().insert(
            path.trim_matches('/').to_string(),
            MemoryObject {
                content_type: content_type.to_string(),
                size: bytes.len() as u64,
                updated: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        );
    }

    pub fn remove(&self, path: &str) -> bool {
        self.objects.write().remove(path.trim_matches('/')).is_some()
    }

    /// `https://mock-firebase-url.com/<path>`, each segment encoded.
    pub fn url_for(path: &str) -> String {
        let encoded: Vec<String> = path
            .trim_matches('/')
            .split('/')
            .map(encode_object_path)
            .collect();
        format!("{MOCK_URL_BASE}/{}", encoded.join("/"))
    }
}

impl ObjectStorage for MemoryStorage {
    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let prefix = folder_prefix(prefix);
        Ok(self
            .objects
            .read()
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()).map(|rest| (key, rest)))
            .filter(|(_, rest)| !rest.is_empty() && !rest.contains('/'))
            .map(|(key, _)| StoredObject::from_path(key.clone()))
            .collect())
    }

    fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self
            .objects
            .read()
            .get(path.trim_matches('/'))
            .map(|object| ObjectMetadata {
                content_type: Some(object.content_type.clone()),
                size: Some(object.size),
                updated: Some(object.updated.clone()),
            }))
    }

    fn download_url(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .objects
            .read()
            .contains_key(path.trim_matches('/'))
            .then(|| Self::url_for(path)))
    }

    fn upload(&self, path: &str, content_type: &str, bytes: &[u8]) -> Result<String> {
        if path.trim_matches('/').is_empty() {
            return Err(anyhow!("object path must not be empty"));
        }
        self.insert(path, content_type, bytes);
        Ok(Self::url_for(path))
    }
}
