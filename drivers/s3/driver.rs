//! S3驱动核心实现
//!
//! 设计原则：
//! - 第0片初始化分片上传，上传ID保存在会话缓存
//! - 第n片上传为part n+1，最后一片完成上传
//! - 初始化之后任何失败都恰好中止一次分片上传

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StorageError};
use crate::storage::folder::stub_path;
use crate::storage::session::session_key;
use crate::storage::{
    Capability, ChunkMetadata, DriverKind, Entry, ObjectMetadata, ObjectReader, PartReceipt,
    SessionCache, StorageDriver, UploadSession,
};
use crate::utils::{folder_prefix, normalize_path};
use super::client::{PutOptions, S3Client};
use super::config::S3Config;

/// S3 minimum part size except the last part (5MB) / 最小分片大小
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// S3驱动
pub struct S3Driver {
    id: String,
    config: S3Config,
    client: Arc<dyn S3Client>,
    sessions: Arc<dyn SessionCache>,
    session_ttl: Duration,
}

/// Multipart state carried between chunks / 分片上传状态
struct MultipartState {
    upload_id: String,
    key: String,
    parts: Vec<PartReceipt>,
}

impl S3Driver {
    pub fn new(
        id: &str,
        config: S3Config,
        client: Arc<dyn S3Client>,
        sessions: Arc<dyn SessionCache>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            config,
            client,
            sessions,
            session_ttl,
        }
    }

    /// 获取完整的对象键（路径）
    fn object_key(&self, path: &str) -> String {
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

    /// Listing prefix, keeps a trailing separator / 列表前缀
    fn list_prefix(&self, prefix: &str) -> String {
        let key = self.object_key(prefix);
        if !key.is_empty() && (prefix.ends_with('/') || normalize_path(prefix).is_empty()) {
            format!("{}/", key)
        } else {
            key
        }
    }

    fn logical_path(&self, key: &str) -> String {
        let root = normalize_path(&self.config.root_path);
        if root.is_empty() {
            return key.to_string();
        }
        key.strip_prefix(&format!("{}/", root)).unwrap_or(key).to_string()
    }

    fn put_options(meta: &ChunkMetadata, timestamp: i64) -> PutOptions {
        PutOptions {
            content_type: meta.effective_content_type(),
            cache_control: meta.cache_control.clone(),
            metadata: meta.tags(timestamp).to_pairs(),
        }
    }

    /// Multipart state for this chunk: initiated at chunk 0, loaded otherwise / 获取分片上传状态
    async fn begin_chunk(&self, session: &str, meta: &ChunkMetadata, timestamp: i64) -> Result<MultipartState> {
        if meta.is_first() {
            let key = self.object_key(&meta.object_path());
            let upload_id = self
                .client
                .initiate_multipart(&key, &Self::put_options(meta, timestamp))
                .await?;
            tracing::debug!("S3分片上传开始: key={}, upload_id={}", key, upload_id);
            return Ok(MultipartState {
                upload_id,
                key,
                parts: Vec::new(),
            });
        }

        match self.sessions.get(session) {
            Some(UploadSession::Multipart { upload_id, key, parts }) => Ok(MultipartState {
                upload_id,
                key,
                parts,
            }),
            Some(other) => Err(StorageError::Fatal(format!(
                "{}: unexpected session state {:?}",
                session, other
            ))),
            None => Err(StorageError::Fatal(format!(
                "{}: no multipart session for chunk {}, it expired or chunk 0 never arrived",
                session, meta.chunk_index
            ))),
        }
    }

    /// Upload one part and complete on the last chunk / 上传分片
    async fn upload_chunk(&self, session: &str, state: &mut MultipartState, data: Bytes, meta: &ChunkMetadata) -> Result<()> {
        let part_number = meta.chunk_index + 1;
        let size = data.len();
        let receipt = self
            .client
            .upload_part(&state.key, &state.upload_id, part_number, data.to_vec())
            .await?;
        tracing::debug!("S3上传分片: key={}, part={}, size={}", state.key, part_number, size);
        state.parts.push(receipt);

        if meta.is_last() {
            let mut parts = state.parts.clone();
            parts.sort_by_key(|p| p.part_number);
            self.client
                .complete_multipart(&state.key, &state.upload_id, parts)
                .await?;
            self.sessions.remove(session);
            tracing::debug!("S3分片上传完成: key={}", state.key);
        } else {
            self.sessions.set(
                session,
                UploadSession::Multipart {
                    upload_id: state.upload_id.clone(),
                    key: state.key.clone(),
                    parts: state.parts.clone(),
                },
                self.session_ttl,
            );
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> DriverKind {
        DriverKind::S3
    }

    fn capabilities(&self) -> Capability {
        Capability {
            max_write_block: None,
            min_part_size: Some(MIN_PART_SIZE),
            needs_session: true,
            positional_writes: false,
            can_server_side_copy: true,
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.client.head_object(&self.object_key(path)).await?.is_some())
    }

    async fn open_reader(&self, path: &str) -> Result<Option<ObjectReader>> {
        // rust-s3返回完整响应，封装为AsyncRead
        let data = self.client.get_object(&self.object_key(path)).await?;
        Ok(data.map(|d| Box::new(std::io::Cursor::new(d)) as ObjectReader))
    }

    async fn append_chunk(&self, data: Bytes, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        let session = session_key(&self.id, &meta.upload_uid);

        let mut state = match self.begin_chunk(&session, meta, timestamp).await {
            Ok(state) => state,
            Err(e) => {
                self.sessions.remove(&session);
                return Err(e);
            }
        };

        if let Err(e) = self.upload_chunk(&session, &mut state, data, meta).await {
            tracing::error!(
                "S3分片上传失败: key={}, chunk={}, error={}",
                state.key, meta.chunk_index, e
            );
            if let Err(abort_err) = self.client.abort_multipart(&state.key, &state.upload_id).await {
                tracing::warn!("S3中止分片上传失败: key={}, error={}", state.key, abort_err);
            }
            self.sessions.remove(&session);
            return Err(e);
        }
        Ok(())
    }

    async fn upload_whole(&self, data: Bytes, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        let key = self.object_key(&meta.object_path());
        self.client.delete_object(&key).await?;
        self.client
            .put_object(&key, &data, &Self::put_options(meta, timestamp))
            .await?;
        tracing::debug!("S3 object uploaded: {}/{}", self.id, key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let objects = self.client.list_objects(&self.list_prefix(prefix)).await?;
        Ok(objects
            .into_iter()
            .filter(|obj| !obj.key.ends_with('/'))
            .map(|obj| Entry::file(&self.logical_path(&obj.key), obj.size, obj.last_modified))
            .collect())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let src_key = self.object_key(src);
        let dst_key = self.object_key(dst);
        tracing::debug!("S3 CopyObject: src_key={}, dst_key={}", src_key, dst_key);
        self.client.copy_object(&src_key, &dst_key).await?;

        // 验证新文件是否存在
        if self.client.head_object(&dst_key).await?.is_none() {
            return Err(StorageError::Fatal(format!(
                "S3 CopyObject后新文件不存在: {}",
                dst_key
            )));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client.delete_object(&self.object_key(path)).await
    }

    async fn delete_recursive(&self, prefix: &str) -> Result<()> {
        let objects = self
            .client
            .list_objects(&self.list_prefix(&folder_prefix(prefix)))
            .await?;
        for obj in &objects {
            self.client.delete_object(&obj.key).await?;
        }
        tracing::debug!("S3 deleted {} objects under {}/{}", objects.len(), self.id, prefix);
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        let options = PutOptions {
            content_type: "application/octet-stream".to_string(),
            ..Default::default()
        };
        self.client
            .put_object(&self.object_key(&stub_path(path)), &[], &options)
            .await
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        self.client.head_object(&self.object_key(path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySessionCache;
    use crate::drivers::s3::S3Object;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Scripted in-memory S3 / 模拟S3
    #[derive(Default)]
    struct FakeS3 {
        calls: Mutex<Vec<String>>,
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        uploads: Mutex<BTreeMap<String, Vec<(u32, Vec<u8>)>>>,
        fail_part: Option<u32>,
    }

    impl FakeS3 {
        fn failing_part(part: u32) -> Self {
            Self {
                fail_part: Some(part),
                ..Default::default()
            }
        }

        fn count(&self, op: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.starts_with(op)).count()
        }
    }

    #[async_trait]
    impl S3Client for FakeS3 {
        async fn put_object(&self, key: &str, data: &[u8], _options: &PutOptions) -> Result<()> {
            self.calls.lock().push(format!("put {}", key));
            self.objects.lock().insert(key.to_string(), data.to_vec());
            Ok(())
        }

        async fn initiate_multipart(&self, key: &str, _options: &PutOptions) -> Result<String> {
            self.calls.lock().push(format!("initiate {}", key));
            self.uploads.lock().insert("up-1".to_string(), Vec::new());
            Ok("up-1".to_string())
        }

        async fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: Vec<u8>) -> Result<PartReceipt> {
            self.calls.lock().push(format!("part {} {}", key, part_number));
            if self.fail_part == Some(part_number) {
                return Err(StorageError::Transient("HTTP 503: slow down".to_string()));
            }
            self.uploads
                .lock()
                .get_mut(upload_id)
                .ok_or_else(|| StorageError::NotFound(upload_id.to_string()))?
                .push((part_number, data));
            Ok(PartReceipt {
                part_number,
                etag: format!("etag-{}", part_number),
            })
        }

        async fn complete_multipart(&self, key: &str, upload_id: &str, parts: Vec<PartReceipt>) -> Result<()> {
            self.calls.lock().push(format!("complete {}", key));
            let mut uploaded = self
                .uploads
                .lock()
                .remove(upload_id)
                .ok_or_else(|| StorageError::NotFound(upload_id.to_string()))?;
            assert_eq!(uploaded.len(), parts.len());
            uploaded.sort_by_key(|(n, _)| *n);
            let data = uploaded.into_iter().flat_map(|(_, d)| d).collect();
            self.objects.lock().insert(key.to_string(), data);
            Ok(())
        }

        async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
            self.calls.lock().push(format!("abort {}", key));
            self.uploads.lock().remove(upload_id);
            Ok(())
        }

        async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
            Ok(self.objects.lock().get(key).map(|d| ObjectMetadata {
                content_length: d.len() as u64,
                ..Default::default()
            }))
        }

        async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.objects.lock().get(key).cloned())
        }

        async fn list_objects(&self, prefix: &str) -> Result<Vec<S3Object>> {
            Ok(self
                .objects
                .lock()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, d)| S3Object {
                    key: k.clone(),
                    size: d.len() as u64,
                    last_modified: None,
                })
                .collect())
        }

        async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()> {
            let data = self
                .objects
                .lock()
                .get(src_key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(src_key.to_string()))?;
            self.objects.lock().insert(dst_key.to_string(), data);
            Ok(())
        }

        async fn delete_object(&self, key: &str) -> Result<()> {
            self.calls.lock().push(format!("delete {}", key));
            self.objects.lock().remove(key);
            Ok(())
        }
    }

    fn driver(fake: Arc<FakeS3>) -> (S3Driver, Arc<MemorySessionCache>) {
        let sessions = Arc::new(MemorySessionCache::new());
        let config = S3Config {
            bucket: "site".to_string(),
            root_path: "web".to_string(),
            ..Default::default()
        };
        let driver = S3Driver::new("s3", config, fake, sessions.clone(), Duration::from_secs(60));
        (driver, sessions)
    }

    fn chunk(index: u32, total: u32, size: u64) -> ChunkMetadata {
        ChunkMetadata {
            upload_uid: "u1".to_string(),
            file_name: "movie.mp4".to_string(),
            relative_path: "media".to_string(),
            content_type: String::new(),
            total_file_size: size,
            total_chunks: total,
            chunk_index: index,
            image_width: None,
            image_height: None,
            cache_control: Some("max-age=60".to_string()),
        }
    }

    #[tokio::test]
    async fn test_multipart_reassembly() {
        let fake = Arc::new(FakeS3::default());
        let (d, sessions) = driver(fake.clone());

        d.append_chunk(Bytes::from_static(b"aaa"), &chunk(0, 3, 8), 1).await.unwrap();
        assert_eq!(sessions.len(), 1);
        d.append_chunk(Bytes::from_static(b"bbb"), &chunk(1, 3, 8), 1).await.unwrap();
        d.append_chunk(Bytes::from_static(b"cc"), &chunk(2, 3, 8), 1).await.unwrap();

        assert!(sessions.is_empty());
        assert_eq!(fake.count("initiate"), 1);
        assert_eq!(fake.count("complete"), 1);
        assert_eq!(fake.count("abort"), 0);
        assert_eq!(
            fake.objects.lock().get("web/media/movie.mp4").map(|d| d.as_slice()),
            Some(&b"aaabbbcc"[..])
        );
    }

    #[tokio::test]
    async fn test_part_failure_aborts_exactly_once() {
        let fake = Arc::new(FakeS3::failing_part(2));
        let (d, sessions) = driver(fake.clone());

        d.append_chunk(Bytes::from_static(b"aaa"), &chunk(0, 3, 8), 1).await.unwrap();
        let err = d
            .append_chunk(Bytes::from_static(b"bbb"), &chunk(1, 3, 8), 1)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(fake.count("abort"), 1);
        assert_eq!(fake.count("complete"), 0);
        assert!(sessions.is_empty());

        // 会话已移除，后续分片直接失败，不再中止
        let err = d
            .append_chunk(Bytes::from_static(b"cc"), &chunk(2, 3, 8), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Fatal(_)));
        assert_eq!(fake.count("abort"), 1);
    }

    #[tokio::test]
    async fn test_copy_list_and_folders() {
        let fake = Arc::new(FakeS3::default());
        let (d, _) = driver(fake.clone());

        d.upload_whole(Bytes::from_static(b"hi"), &chunk(0, 1, 2), 1).await.unwrap();
        d.create_folder("media/empty").await.unwrap();
        d.copy("media/movie.mp4", "archive/movie.mp4").await.unwrap();

        let mut paths: Vec<String> = d.list("").await.unwrap().into_iter().map(|e| e.path).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec!["archive/movie.mp4", "media/empty/folder.stubxx", "media/movie.mp4"]
        );

        d.delete_recursive("media").await.unwrap();
        assert!(!d.exists("media/movie.mp4").await.unwrap());
        assert!(d.exists("archive/movie.mp4").await.unwrap());
        assert!(d.get_metadata("media/movie.mp4").await.unwrap().is_none());
        assert!(d.open_reader("nope").await.unwrap().is_none());
    }
}
