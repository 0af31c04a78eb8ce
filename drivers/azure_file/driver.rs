//! Azure File驱动核心实现
//!
//! 设计原则：
//! - 第0片删除旧文件，创建父目录，按总大小预分配文件
//! - 每片按偏移写入range，每个range最多4MB
//! - 写入偏移保存在会话缓存中，最后一片结束后移除

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::drivers::azure_rest::{
    body_reader, header_str, metadata_from_headers, parse_date, split_blocks, wait_for_copy,
    AzureClient, AzureRequest,
};
use crate::error::{Result, StorageError};
use crate::storage::folder::stub_path;
use crate::storage::session::session_key;
use crate::storage::{
    Capability, ChunkMetadata, DriverKind, Entry, ObjectMetadata, ObjectReader, SessionCache,
    StorageDriver, UploadSession,
};
use crate::utils::{join_path, normalize_path, parent_path};
use super::config::AzureFileConfig;

/// Largest range accepted by one Put Range call / 单次写入上限
pub const MAX_RANGE_SIZE: usize = 4 * 1024 * 1024;

/// Azure File驱动
pub struct AzureFileDriver {
    id: String,
    config: AzureFileConfig,
    client: Arc<dyn AzureClient>,
    sessions: Arc<dyn SessionCache>,
    session_ttl: Duration,
    copy_timeout: Duration,
    copy_poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShareEnumeration {
    #[serde(default)]
    entries: Option<ShareEntries>,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ShareEntries {
    #[serde(rename = "$value", default)]
    items: Vec<ShareItem>,
}

#[derive(Debug, Deserialize)]
enum ShareItem {
    File(ShareFile),
    Directory(ShareDirectory),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShareFile {
    name: String,
    #[serde(default)]
    properties: Option<ShareFileProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShareDirectory {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ShareFileProperties {
    #[serde(rename = "Content-Length", default)]
    content_length: Option<u64>,
    #[serde(rename = "CreationTime", default)]
    creation_time: Option<String>,
    #[serde(rename = "LastWriteTime", default)]
    last_write_time: Option<String>,
    #[serde(rename = "Last-Modified", default)]
    last_modified: Option<String>,
}

/// Result of walking a directory tree / 目录遍历结果
#[derive(Default)]
struct Walk {
    files: Vec<Entry>,
    /// Directories in discovery order, parents before children
    directories: Vec<String>,
}

impl AzureFileDriver {
    pub fn new(
        id: &str,
        config: AzureFileConfig,
        client: Arc<dyn AzureClient>,
        sessions: Arc<dyn SessionCache>,
        session_ttl: Duration,
        copy_timeout: Duration,
        copy_poll_interval: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            config,
            client,
            sessions,
            session_ttl,
            copy_timeout,
            copy_poll_interval,
        }
    }

    /// 获取共享内的完整路径
    fn share_path(&self, path: &str) -> String {
        join_path(&self.config.root_path, path)
    }

    fn resource(&self, path: &str) -> String {
        let share_path = self.share_path(path);
        if share_path.is_empty() {
            self.config.share.clone()
        } else {
            format!("{}/{}", self.config.share, share_path)
        }
    }

    async fn head(&self, path: &str) -> Result<Option<reqwest::Response>> {
        self.client
            .execute_optional(AzureRequest::new(Method::HEAD, self.resource(path)))
            .await
    }

    async fn delete_file(&self, path: &str) -> Result<bool> {
        let deleted = self
            .client
            .execute_optional(AzureRequest::new(Method::DELETE, self.resource(path)))
            .await?
            .is_some();
        if deleted {
            tracing::debug!("Azure file deleted: {}/{}", self.id, path);
        }
        Ok(deleted)
    }

    /// Create every missing ancestor directory of the root path and `path` / 逐级创建目录
    async fn ensure_directories(&self, path: &str) -> Result<()> {
        let full = self.share_path(path);
        let mut current = String::new();
        for segment in full.split('/').filter(|s| !s.is_empty()) {
            current = join_path(&current, segment);
            let request = AzureRequest::new(Method::PUT, format!("{}/{}", self.config.share, current))
                .query("restype", "directory");
            match self.client.execute(request).await {
                Ok(_) | Err(StorageError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn create_file(&self, path: &str, length: u64, meta: Option<(&ChunkMetadata, i64)>) -> Result<()> {
        let mut request = AzureRequest::new(Method::PUT, self.resource(path))
            .header("x-ms-type", "file")
            .header("x-ms-content-length", length.to_string());
        if let Some((meta, timestamp)) = meta {
            request = request.header("x-ms-content-type", meta.effective_content_type());
            if let Some(ref cache_control) = meta.cache_control {
                request = request.header("x-ms-cache-control", cache_control.clone());
            }
            request = request.metadata(meta.tags(timestamp).to_pairs());
        }
        self.client.execute(request).await?;
        tracing::debug!("Azure file created: {}/{} length={}", self.id, path, length);
        Ok(())
    }

    /// Write `data` at `offset`, split into ranges / 按偏移写入
    async fn write_ranges(&self, path: &str, offset: u64, data: &Bytes) -> Result<u64> {
        let mut position = offset;
        for range in split_blocks(data, MAX_RANGE_SIZE) {
            let end = position + range.len() as u64 - 1;
            let len = range.len() as u64;
            let request = AzureRequest::new(Method::PUT, self.resource(path))
                .query("comp", "range")
                .header("x-ms-range", format!("bytes={}-{}", position, end))
                .header("x-ms-write", "update")
                .body(range);
            self.client.execute(request).await?;
            position += len;
        }
        Ok(position)
    }

    /// Recreate the file for chunk 0 / 重新创建文件
    async fn start_upload(&self, path: &str, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        self.delete_file(path).await?;
        self.ensure_directories(parent_path(path)).await?;
        self.create_file(path, meta.total_file_size, Some((meta, timestamp))).await
    }

    async fn write_chunk(&self, key: &str, data: Bytes, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        let path = meta.object_path();

        let offset = if meta.is_first() {
            self.start_upload(&path, meta, timestamp).await?;
            0
        } else {
            match self.sessions.get(key) {
                Some(UploadSession::Positional { offset }) => offset,
                Some(other) => {
                    return Err(StorageError::Fatal(format!(
                        "{}: unexpected session state {:?}",
                        key, other
                    )))
                }
                None => {
                    return Err(StorageError::Fatal(format!(
                        "{}: no upload session for chunk {}, it expired or chunk 0 never arrived",
                        key, meta.chunk_index
                    )))
                }
            }
        };

        let offset = self.write_ranges(&path, offset, &data).await?;
        tracing::debug!(
            "Azure file chunk written: {}/{} chunk={}/{} offset={}",
            self.id, path, meta.chunk_index + 1, meta.total_chunks, offset
        );

        if meta.is_last() {
            self.sessions.remove(key);
            if offset != meta.total_file_size {
                tracing::warn!(
                    "Azure file {} finished at {} bytes, declared {}",
                    path, offset, meta.total_file_size
                );
            }
        } else {
            self.sessions
                .set(key, UploadSession::Positional { offset }, self.session_ttl);
        }
        Ok(())
    }

    /// One page-walk of a directory, recursing into subdirectories / 遍历目录
    fn walk<'a>(
        &'a self,
        directory: &'a str,
        name_prefix: &'a str,
        out: &'a mut Walk,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut marker: Option<String> = None;
            let mut subdirectories = Vec::new();

            loop {
                let mut request = AzureRequest::new(Method::GET, self.resource(directory))
                    .query("restype", "directory")
                    .query("comp", "list")
                    .query("include", "Timestamps");
                if !name_prefix.is_empty() {
                    request = request.query("prefix", name_prefix);
                }
                if let Some(ref m) = marker {
                    request = request.query("marker", m.clone());
                }

                let response = match self.client.execute_optional(request).await? {
                    Some(r) => r,
                    // 目录不存在
                    None => return Ok(()),
                };
                let body = response.text().await?;
                let page: ShareEnumeration = quick_xml::de::from_str(&body)?;

                for item in page.entries.unwrap_or_default().items {
                    match item {
                        ShareItem::File(file) => {
                            let path = join_path(directory, &file.name);
                            let props = file.properties.unwrap_or_default();
                            let modified = props
                                .last_write_time
                                .as_deref()
                                .or(props.last_modified.as_deref())
                                .and_then(parse_date);
                            let created = props.creation_time.as_deref().and_then(parse_date);
                            out.files.push(
                                Entry::file(&path, props.content_length.unwrap_or(0), modified)
                                    .with_created(created),
                            );
                        }
                        ShareItem::Directory(dir) => {
                            subdirectories.push(join_path(directory, &dir.name));
                        }
                    }
                }

                marker = page.next_marker.filter(|m| !m.is_empty());
                if marker.is_none() {
                    break;
                }
            }

            for subdirectory in subdirectories {
                out.directories.push(subdirectory.clone());
                self.walk(&subdirectory, "", out).await?;
            }
            Ok(())
        })
    }

    /// Walk everything under a logical prefix / 遍历前缀
    async fn walk_prefix(&self, prefix: &str) -> Result<Walk> {
        let normalized = normalize_path(prefix);
        let (directory, name_prefix) = if prefix.ends_with('/') || normalized.is_empty() {
            (normalized.clone(), String::new())
        } else {
            (
                parent_path(&normalized).to_string(),
                crate::utils::file_name(&normalized).to_string(),
            )
        };

        let mut walk = Walk::default();
        self.walk(&directory, &name_prefix, &mut walk).await?;
        Ok(walk)
    }
}

#[async_trait]
impl StorageDriver for AzureFileDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> DriverKind {
        DriverKind::AzureFile
    }

    fn capabilities(&self) -> Capability {
        Capability {
            max_write_block: Some(MAX_RANGE_SIZE as u64),
            min_part_size: None,
            needs_session: true,
            positional_writes: true,
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
        let key = session_key(&self.id, &meta.upload_uid);
        let result = self.write_chunk(&key, data, meta, timestamp).await;
        if let Err(ref e) = result {
            self.sessions.remove(&key);
            tracing::error!("Azure file chunk failed: {} {}: {}", self.id, key, e);
        }
        result
    }

    async fn upload_whole(&self, data: Bytes, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        let path = meta.object_path();
        self.delete_file(&path).await?;
        self.ensure_directories(parent_path(&path)).await?;
        self.create_file(&path, data.len() as u64, Some((meta, timestamp))).await?;
        self.write_ranges(&path, 0, &data).await?;
        tracing::debug!("Azure file uploaded: {}/{}", self.id, path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        Ok(self.walk_prefix(prefix).await?.files)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.ensure_directories(parent_path(&normalize_path(dst))).await?;
        let request = AzureRequest::new(Method::PUT, self.resource(dst))
            .header("x-ms-copy-source", self.client.resource_url(&self.resource(src)));
        let response = self.client.execute(request).await?;
        let status = header_str(&response, "x-ms-copy-status").unwrap_or_default();
        tracing::debug!("Azure file copy {} -> {}: {}", src, dst, status);
        if status != "success" {
            wait_for_copy(self.client.as_ref(), &self.resource(dst), self.copy_timeout, self.copy_poll_interval)
                .await?;
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.delete_file(path).await?;
        Ok(())
    }

    async fn delete_recursive(&self, prefix: &str) -> Result<()> {
        let folder = normalize_path(prefix);
        let walk = self.walk_prefix(&crate::utils::folder_prefix(&folder)).await?;
        for file in &walk.files {
            self.delete_file(&file.path).await?;
        }

        // 子目录先于父目录删除
        let mut directories = walk.directories.clone();
        directories.reverse();
        if !folder.is_empty() {
            directories.push(folder.clone());
        }
        for directory in directories {
            let request = AzureRequest::new(Method::DELETE, self.resource(&directory))
                .query("restype", "directory");
            self.client.execute_optional(request).await?;
        }
        tracing::debug!("Azure file deleted {} files under {}/{}", walk.files.len(), self.id, folder);
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        let folder = normalize_path(path);
        self.ensure_directories(&folder).await?;
        if !self.exists(&stub_path(&folder)).await? {
            self.create_file(&stub_path(&folder), 0, None).await?;
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::azure_rest::scripted::{has_query, reply, ScriptedAzure};
    use crate::storage::MemorySessionCache;

    const MIB: usize = 1024 * 1024;

    /// Share with no existing file; every write succeeds / 空共享
    fn scripted() -> Arc<ScriptedAzure> {
        Arc::new(ScriptedAzure::new(|request| match request.method {
            Method::DELETE | Method::HEAD => reply(404),
            Method::PUT if has_query(request, "restype", "directory") => reply(201),
            Method::PUT => reply(201),
            _ => reply(400),
        }))
    }

    fn driver_with(root: &str, client: Arc<ScriptedAzure>) -> (AzureFileDriver, Arc<MemorySessionCache>) {
        let sessions = Arc::new(MemorySessionCache::new());
        let config = AzureFileConfig {
            share: "site".to_string(),
            root_path: root.to_string(),
            ..Default::default()
        };
        let driver = AzureFileDriver::new(
            "files",
            config,
            client,
            sessions.clone(),
            Duration::from_secs(60),
            Duration::from_secs(30),
            Duration::from_millis(500),
        );
        (driver, sessions)
    }

    fn driver(root: &str) -> (AzureFileDriver, Arc<MemorySessionCache>) {
        driver_with(root, scripted())
    }

    fn chunk(index: u32, total: u32) -> ChunkMetadata {
        sized_chunk(index, total, 10)
    }

    fn sized_chunk(index: u32, total: u32, size: usize) -> ChunkMetadata {
        ChunkMetadata {
            upload_uid: "u1".to_string(),
            file_name: "a.bin".to_string(),
            relative_path: "docs".to_string(),
            content_type: String::new(),
            total_file_size: size as u64,
            total_chunks: total,
            chunk_index: index,
            image_width: None,
            image_height: None,
            cache_control: None,
        }
    }

    fn ranges(azure: &ScriptedAzure) -> Vec<String> {
        azure
            .requests()
            .iter()
            .filter_map(|r| r.header_value("x-ms-range").map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn test_range_offsets_advance_across_chunks() {
        let azure = scripted();
        let (d, sessions) = driver_with("", azure.clone());
        let total = 6 * MIB + 100;
        let key = session_key("files", "u1");

        d.append_chunk(Bytes::from(vec![1u8; 5 * MIB]), &sized_chunk(0, 3, total), 0)
            .await
            .unwrap();
        assert_eq!(
            azure.calls(),
            vec![
                "DELETE site/docs/a.bin",
                "PUT site/docs?restype=directory",
                "PUT site/docs/a.bin",
                "PUT site/docs/a.bin?comp=range",
                "PUT site/docs/a.bin?comp=range",
            ]
        );
        let requests = azure.requests();
        let create = &requests[2];
        assert_eq!(create.header_value("x-ms-type"), Some("file"));
        assert_eq!(create.header_value("x-ms-content-length"), Some(total.to_string().as_str()));
        assert_eq!(ranges(&azure), vec!["bytes=0-4194303", "bytes=4194304-5242879"]);
        assert_eq!(
            sessions.get(&key),
            Some(UploadSession::Positional { offset: 5 * MIB as u64 })
        );

        // 后续分片不再重建文件，偏移从会话继续
        azure.clear();
        d.append_chunk(Bytes::from(vec![2u8; MIB]), &sized_chunk(1, 3, total), 0)
            .await
            .unwrap();
        assert_eq!(azure.calls(), vec!["PUT site/docs/a.bin?comp=range"]);
        assert_eq!(ranges(&azure), vec!["bytes=5242880-6291455"]);

        azure.clear();
        d.append_chunk(Bytes::from(vec![3u8; 100]), &sized_chunk(2, 3, total), 0)
            .await
            .unwrap();
        assert_eq!(ranges(&azure), vec!["bytes=6291456-6291555"]);
        assert!(sessions.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_failed_range_clears_session() {
        let azure = Arc::new(ScriptedAzure::new(|request| match request.method {
            Method::DELETE => reply(404),
            Method::PUT if has_query(request, "comp", "range") => reply(503),
            _ => reply(201),
        }));
        let (d, sessions) = driver_with("web", azure.clone());

        let err = d
            .append_chunk(Bytes::from_static(b"abc"), &chunk(0, 2), 0)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(sessions.is_empty());
        // 根目录和父目录逐级创建
        assert_eq!(
            &azure.calls()[..3],
            &["DELETE site/web/docs/a.bin", "PUT site/web?restype=directory", "PUT site/web/docs?restype=directory"]
        );
    }

    #[test]
    fn test_share_paths() {
        let (d, _) = driver("web");
        assert_eq!(d.resource("docs/a.bin"), "site/web/docs/a.bin");
        assert_eq!(d.resource(""), "site/web");

        let (bare, _) = driver("");
        assert_eq!(bare.resource(""), "site");
        assert_eq!(bare.resource("a.bin"), "site/a.bin");
    }

    #[tokio::test]
    async fn test_missing_session_is_fatal_and_cleared() {
        let (d, sessions) = driver("");
        // 中间分片到达但会话不存在
        let err = d
            .append_chunk(Bytes::from_static(b"abc"), &chunk(1, 3), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Fatal(_)));
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_parse_listing() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.file.core.windows.net/" ShareName="site" DirectoryPath="docs">
  <Entries>
    <File>
      <FileId>1</FileId>
      <Name>a.bin</Name>
      <Properties>
        <Content-Length>10</Content-Length>
        <CreationTime>2024-01-03T10:00:00.0000000Z</CreationTime>
        <LastWriteTime>2024-01-03T11:00:00.0000000Z</LastWriteTime>
        <Last-Modified>Wed, 03 Jan 2024 11:00:00 GMT</Last-Modified>
      </Properties>
    </File>
    <Directory>
      <FileId>2</FileId>
      <Name>img</Name>
      <Properties />
    </Directory>
    <File>
      <Name>folder.stubxx</Name>
      <Properties><Content-Length>0</Content-Length></Properties>
    </File>
  </Entries>
  <NextMarker />
</EnumerationResults>"#;
        let page: ShareEnumeration = quick_xml::de::from_str(xml).unwrap();
        let items = page.entries.unwrap().items;
        assert_eq!(items.len(), 3);
        match &items[0] {
            ShareItem::File(f) => {
                assert_eq!(f.name, "a.bin");
                let props = f.properties.as_ref().unwrap();
                assert_eq!(props.content_length, Some(10));
                assert!(parse_date(props.last_write_time.as_deref().unwrap()).is_some());
            }
            other => panic!("expected file, got {:?}", other),
        }
        assert!(matches!(&items[1], ShareItem::Directory(d) if d.name == "img"));
    }
}
