//! Uniform get/put/head/list/sign facade over a cloud object store, with a
//! local-filesystem fallback for dev and test. Never the source of truth for
//! job state — only a place to stash STAC catalogs and item JSON between
//! pipeline steps.

use std::path::PathBuf;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use tessera_core::{CoreError, CoreResult};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Vec<u8>>;
    async fn put(&self, key: &str, body: Vec<u8>) -> CoreResult<()>;
    async fn head(&self, key: &str) -> CoreResult<bool>;
    async fn list(&self, prefix: &str) -> CoreResult<Vec<String>>;
    /// Produces a URL a worker can use directly, bypassing credential
    /// minting on every read; the local backend just returns the path.
    async fn sign(&self, key: &str) -> CoreResult<String>;
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(bucket: impl Into<String>, region: &str) -> Self {
        let region_provider = aws_config::Region::new(region.to_string());
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> CoreResult<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| CoreError::service(format!("s3 get {key} failed: {e}")))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| CoreError::service(format!("s3 get {key} body read failed: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> CoreResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| CoreError::service(format!("s3 put {key} failed: {e}")))?;
        Ok(())
    }

    async fn head(&self, key: &str) -> CoreResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => Ok(false),
            Err(e) => Err(CoreError::service(format!("s3 head {key} failed: {e}"))),
        }
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .send()
            .await
            .map_err(|e| CoreError::service(format!("s3 list {prefix} failed: {e}")))?;
        Ok(output
            .contents()
            .iter()
            .filter_map(|o| o.key().map(str::to_string))
            .collect())
    }

    async fn sign(&self, key: &str) -> CoreResult<String> {
        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}

/// Stand-in for the object store in dev and tests, rooted at
/// `hostVolumePath`.
pub struct LocalFsObjectStore {
    root: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    async fn get(&self, key: &str) -> CoreResult<Vec<u8>> {
        tokio::fs::read(self.path_for(key))
            .await
            .map_err(|e| CoreError::service(format!("local get {key} failed: {e}")))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> CoreResult<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::service(format!("local mkdir for {key} failed: {e}")))?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| CoreError::service(format!("local put {key} failed: {e}")))
    }

    async fn head(&self, key: &str) -> CoreResult<bool> {
        Ok(tokio::fs::metadata(self.path_for(key)).await.is_ok())
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let dir = self.path_for(prefix);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::service(format!("local list {prefix} failed: {e}")))?
        {
            if let Some(name) = entry.file_name().to_str() {
                out.push(format!("{}/{}", prefix.trim_end_matches('/'), name));
            }
        }
        Ok(out)
    }

    async fn sign(&self, key: &str) -> CoreResult<String> {
        Ok(self.path_for(key).display().to_string())
    }
}
