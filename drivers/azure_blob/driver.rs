//! Azure Blob驱动核心实现
//!
//! 设计原则：
//! - 分片追加写入 append blob，每块最多2.5MB
//! - 第0片先删除旧blob并等待删除可见，再重新创建
//! - 最后一片封存（seal），之后不可再追加

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::drivers::azure_rest::{
    body_reader, header_str, metadata_from_headers, parse_date, poll_until, split_blocks,
    wait_for_copy, AzureClient, AzureRequest,
};
use crate::error::{Result, StorageError};
use crate::storage::folder::stub_path;
use crate::storage::{
    Capability, ChunkMetadata, DriverKind, Entry, ObjectMetadata, ObjectReader, StorageDriver,
};
use crate::utils::{folder_prefix, normalize_path};
use super::config::AzureBlobConfig;

/// Largest block accepted by one Append Block call / 单次追加块上限
pub const MAX_APPEND_BLOCK_SIZE: usize = 2 * 1024 * 1024 + 512 * 1024;

/// Azure Blob驱动
pub struct AzureBlobDriver {
    id: String,
    config: AzureBlobConfig,
    client: Arc<dyn AzureClient>,
    delete_visibility_timeout: Duration,
    delete_poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobEnumeration {
    #[serde(default)]
    blobs: Option<BlobList>,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    blob: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
    properties: BlobProperties,
}

#[derive(Debug, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Creation-Time", default)]
    creation_time: Option<String>,
    #[serde(rename = "Last-Modified", default)]
    last_modified: Option<String>,
    #[serde(rename = "Content-Length", default)]
    content_length: Option<u64>,
}

impl AzureBlobDriver {
    pub fn new(
        id: &str,
        config: AzureBlobConfig,
        client: Arc<dyn AzureClient>,
        delete_visibility_timeout: Duration,
        delete_poll_interval: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            config,
            client,
            delete_visibility_timeout,
            delete_poll_interval,
        }
    }

    /// 获取完整的blob名称
    fn blob_name(&self, path: &str) -> String {
        let root = normalize_path(&self.config.root_path);
        let path = normalize_path(path);
        if root.is_empty() {
            path
        } else if path.is_empty() {
            root
        } else {
            format!("{}/{}", root, path)
        }
    }

    /// Listing prefix; keeps the folder separator / 列表前缀
    fn list_prefix(&self, prefix: &str) -> String {
        let name = self.blob_name(prefix);
        if !name.is_empty() && (prefix.ends_with('/') || normalize_path(prefix).is_empty()) {
            format!("{}/", name)
        } else {
            name
        }
    }

    /// Strip the root path from a blob name / 去掉根目录
    fn logical_path(&self, blob_name: &str) -> String {
        let root = normalize_path(&self.config.root_path);
        if root.is_empty() {
            return blob_name.to_string();
        }
        blob_name
            .strip_prefix(&format!("{}/", root))
            .unwrap_or(blob_name)
            .to_string()
    }

    fn resource(&self, path: &str) -> String {
        format!("{}/{}", self.config.container, self.blob_name(path))
    }

    async fn head(&self, path: &str) -> Result<Option<reqwest::Response>> {
        self.client
            .execute_optional(AzureRequest::new(Method::HEAD, self.resource(path)))
            .await
    }

    async fn delete_if_exists(&self, path: &str) -> Result<bool> {
        let request = AzureRequest::new(Method::DELETE, self.resource(path))
            .header("x-ms-delete-snapshots", "include");
        let deleted = self.client.execute_optional(request).await?.is_some();
        if deleted {
            tracing::debug!("Azure blob deleted: {}/{}", self.id, path);
        }
        Ok(deleted)
    }

    /// Server-side delete is not immediately consistent; wait until HEAD misses / 等待删除可见
    async fn wait_deleted(&self, path: &str) -> Result<()> {
        let gone = poll_until(self.delete_visibility_timeout, self.delete_poll_interval, move || async move {
            Ok(self.head(path).await?.is_none())
        })
        .await?;
        if !gone {
            return Err(StorageError::Transient(format!(
                "blob {} still visible {}s after delete",
                path,
                self.delete_visibility_timeout.as_secs()
            )));
        }
        Ok(())
    }

    fn content_headers(request: AzureRequest, meta: &ChunkMetadata, timestamp: i64) -> AzureRequest {
        let mut request = request.header("x-ms-blob-content-type", meta.effective_content_type());
        if let Some(ref cache_control) = meta.cache_control {
            request = request.header("x-ms-blob-cache-control", cache_control.clone());
        }
        request.metadata(meta.tags(timestamp).to_pairs())
    }

    async fn create_append_blob(&self, path: &str, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        let request = AzureRequest::new(Method::PUT, self.resource(path))
            .header("x-ms-blob-type", "AppendBlob");
        self.client
            .execute(Self::content_headers(request, meta, timestamp))
            .await?;
        tracing::debug!("Azure append blob created: {}/{}", self.id, path);
        Ok(())
    }

    async fn append_block(&self, path: &str, block: Bytes) -> Result<()> {
        let request = AzureRequest::new(Method::PUT, self.resource(path))
            .query("comp", "appendblock")
            .body(block);
        self.client.execute(request).await?;
        Ok(())
    }

    async fn seal(&self, path: &str) -> Result<()> {
        let request = AzureRequest::new(Method::PUT, self.resource(path)).query("comp", "seal");
        self.client.execute(request).await?;
        tracing::debug!("Azure append blob sealed: {}/{}", self.id, path);
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for AzureBlobDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> DriverKind {
        DriverKind::AzureBlob
    }

    fn capabilities(&self) -> Capability {
        Capability {
            max_write_block: Some(MAX_APPEND_BLOCK_SIZE as u64),
            min_part_size: None,
            needs_session: false,
            positional_writes: false,
            can_server_side_copy: true,
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.head(path).await?.is_some())
    }

    async fn open_reader(&self, path: &str) -> Result<Option<ObjectReader>> {
        let response = self
            .client
            .execute_optional(AzureRequest::new(Method::GET, self.resource(path)))
            .await?;
        Ok(response.map(body_reader))
    }

    async fn append_chunk(&self, data: Bytes, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        let path = meta.object_path();

        if meta.is_first() {
            if self.delete_if_exists(&path).await? {
                self.wait_deleted(&path).await?;
            }
            self.create_append_blob(&path, meta, timestamp).await?;
        }

        // 客户端分片可能大于单次追加上限，需要再切分
        for block in split_blocks(&data, MAX_APPEND_BLOCK_SIZE) {
            self.append_block(&path, block).await?;
        }
        tracing::debug!(
            "Azure chunk appended: {}/{} chunk={}/{} size={}",
            self.id, path, meta.chunk_index + 1, meta.total_chunks, data.len()
        );

        if meta.is_last() {
            self.seal(&path).await?;
            if let Some(metadata) = self.get_metadata(&path).await? {
                if metadata.content_length != meta.total_file_size {
                    tracing::warn!(
                        "Azure blob {} sealed with {} bytes, declared {}",
                        path, metadata.content_length, meta.total_file_size
                    );
                }
            }
        }
        Ok(())
    }

    async fn upload_whole(&self, data: Bytes, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        let path = meta.object_path();
        if self.delete_if_exists(&path).await? {
            self.wait_deleted(&path).await?;
        }
        let request = AzureRequest::new(Method::PUT, self.resource(&path))
            .header("x-ms-blob-type", "BlockBlob")
            .body(data);
        self.client
            .execute(Self::content_headers(request, meta, timestamp))
            .await?;
        tracing::debug!("Azure blob uploaded: {}/{}", self.id, path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let list_prefix = self.list_prefix(prefix);
        let mut entries = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = AzureRequest::new(Method::GET, self.config.container.clone())
                .query("restype", "container")
                .query("comp", "list");
            if !list_prefix.is_empty() {
                request = request.query("prefix", list_prefix.clone());
            }
            if let Some(ref m) = marker {
                request = request.query("marker", m.clone());
            }

            let body = self.client.execute(request).await?.text().await?;
            let page: BlobEnumeration = quick_xml::de::from_str(&body)?;

            for blob in page.blobs.unwrap_or_default().blob {
                let path = self.logical_path(&blob.name);
                let modified = blob.properties.last_modified.as_deref().and_then(parse_date);
                let created = blob.properties.creation_time.as_deref().and_then(parse_date);
                entries.push(
                    Entry::file(&path, blob.properties.content_length.unwrap_or(0), modified)
                        .with_created(created),
                );
            }

            marker = page.next_marker.filter(|m| !m.is_empty());
            if marker.is_none() {
                break;
            }
        }

        Ok(entries)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let request = AzureRequest::new(Method::PUT, self.resource(dst))
            .header("x-ms-copy-source", self.client.resource_url(&self.resource(src)));
        let response = self.client.execute(request).await?;
        let status = header_str(&response, "x-ms-copy-status").unwrap_or_default();
        tracing::debug!("Azure copy {} -> {}: {}", src, dst, status);
        if status != "success" {
            wait_for_copy(
                self.client.as_ref(),
                &self.resource(dst),
                self.delete_visibility_timeout,
                self.delete_poll_interval,
            )
            .await?;
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.delete_if_exists(path).await?;
        Ok(())
    }

    async fn delete_recursive(&self, prefix: &str) -> Result<()> {
        let objects = self.list(&folder_prefix(prefix)).await?;
        for object in &objects {
            self.delete_if_exists(&object.path).await?;
        }
        tracing::debug!("Azure deleted {} blobs under {}/{}", objects.len(), self.id, prefix);
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        let request = AzureRequest::new(Method::PUT, self.resource(&stub_path(path)))
            .header("x-ms-blob-type", "BlockBlob");
        self.client.execute(request).await?;
        Ok(())
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        let response = match self.head(path).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        Ok(Some(ObjectMetadata {
            content_length: header_str(&response, "content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            content_type: header_str(&response, "content-type"),
            etag: header_str(&response, "etag"),
            last_modified: header_str(&response, "last-modified").as_deref().and_then(parse_date),
            tags: metadata_from_headers(&response),
        }))
    }
}
