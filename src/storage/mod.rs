use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::AsyncRead;

use crate::error::{Result, StorageError};
use crate::utils::{get_ext, join_path, normalize_path, file_name};

pub mod context;
pub mod folder;
pub mod manager;
pub mod session;

pub use context::{StorageContext, TouchedPaths};
pub use folder::{FOLDER_STUB_NAME, FOLDER_STUB_VERSION};
pub use manager::{DriverBox, DriverDeps, DriverFactory, StorageManager};
pub use session::{MemorySessionCache, PartReceipt, SessionCache, UploadSession};

/// Boxed byte stream returned by read operations / 读取流
pub type ObjectReader = Box<dyn AsyncRead + Unpin + Send>;

/// Provider variant behind a driver / 驱动类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    AzureBlob,
    AzureFile,
    S3,
    Local,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::AzureBlob => "azure_blob",
            DriverKind::AzureFile => "azure_file",
            DriverKind::S3 => "s3",
            DriverKind::Local => "local",
        }
    }
}

/// One chunk of a (possibly single-chunk) upload, as sent by the web tier / 分片元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChunkMetadata {
    pub upload_uid: String,
    pub file_name: String,
    #[serde(default)]
    pub relative_path: String,
    #[serde(default)]
    pub content_type: String,
    pub total_file_size: u64,
    pub total_chunks: u32,
    pub chunk_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
}

impl ChunkMetadata {
    /// Destination object path / 目标对象路径
    ///
    /// `relative_path` always names the destination folder; the object is
    /// `<relative_path>/<file_name>`.
    pub fn object_path(&self) -> String {
        join_path(&normalize_path(&self.relative_path), &self.file_name)
    }

    pub fn is_first(&self) -> bool {
        self.chunk_index == 0
    }

    pub fn is_last(&self) -> bool {
        self.chunk_index + 1 == self.total_chunks
    }

    pub fn is_single(&self) -> bool {
        self.total_chunks == 1
    }

    /// Content type, guessed from the file name when absent / 内容类型
    pub fn effective_content_type(&self) -> String {
        if self.content_type.trim().is_empty() {
            crate::utils::guess_content_type(&self.file_name)
        } else {
            self.content_type.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload_uid.trim().is_empty() {
            return Err(StorageError::InvalidChunk("missing upload uid".to_string()));
        }
        let name = self.file_name.trim();
        if name.is_empty() {
            return Err(StorageError::InvalidChunk("missing file name".to_string()));
        }
        // 文件名只能是单个路径段
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(StorageError::InvalidChunk(format!(
                "{}: file name {:?} is not a single path segment",
                self.upload_uid, self.file_name
            )));
        }
        if self.total_chunks == 0 {
            return Err(StorageError::InvalidChunk(format!(
                "{}: total chunks must be positive",
                self.upload_uid
            )));
        }
        if self.chunk_index >= self.total_chunks {
            return Err(StorageError::InvalidChunk(format!(
                "{}: chunk {} out of range 0..{}",
                self.upload_uid, self.chunk_index, self.total_chunks
            )));
        }
        Ok(())
    }

    /// Custom tags persisted on the final object / 自定义标签
    pub fn tags(&self, timestamp: i64) -> ObjectTags {
        ObjectTags {
            upload_uid: self.upload_uid.clone(),
            total_size: self.total_file_size,
            upload_ticks: timestamp,
            image_width: self.image_width.clone(),
            image_height: self.image_height.clone(),
        }
    }
}

/// Tags stored with every uploaded object / 对象标签
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTags {
    pub upload_uid: String,
    pub total_size: u64,
    pub upload_ticks: i64,
    pub image_width: Option<String>,
    pub image_height: Option<String>,
}

impl ObjectTags {
    pub const UPLOAD_UID: &'static str = "uploaduid";
    pub const TOTAL_SIZE: &'static str = "totalsize";
    pub const UPLOAD_TICKS: &'static str = "uploadticks";
    pub const IMAGE_WIDTH: &'static str = "imagewidth";
    pub const IMAGE_HEIGHT: &'static str = "imageheight";

    /// Flatten into provider metadata pairs (lowercase keys) / 转为键值对
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (Self::UPLOAD_UID, self.upload_uid.clone()),
            (Self::TOTAL_SIZE, self.total_size.to_string()),
            (Self::UPLOAD_TICKS, self.upload_ticks.to_string()),
        ];
        if let Some(ref w) = self.image_width {
            pairs.push((Self::IMAGE_WIDTH, w.clone()));
        }
        if let Some(ref h) = self.image_height {
            pairs.push((Self::IMAGE_HEIGHT, h.clone()));
        }
        pairs
    }
}

/// Object properties returned by `get_metadata` / 对象元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn upload_uid(&self) -> Option<&str> {
        self.tags.get(ObjectTags::UPLOAD_UID).map(|s| s.as_str())
    }

    pub fn total_size(&self) -> Option<u64> {
        self.tags.get(ObjectTags::TOTAL_SIZE).and_then(|s| s.parse().ok())
    }
}

/// Provider-agnostic listing entry / 文件条目信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub has_directories: bool,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub extension: String,
}

impl Entry {
    /// File entry for a normalized object path / 文件条目
    pub fn file(path: &str, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        let path = normalize_path(path);
        Self {
            name: file_name(&path).to_string(),
            extension: get_ext(&path),
            path,
            is_dir: false,
            has_directories: false,
            size,
            created: None,
            modified,
        }
    }

    /// Virtual folder entry / 目录条目
    pub fn folder(path: &str) -> Self {
        let path = normalize_path(path);
        Self {
            name: file_name(&path).to_string(),
            path,
            is_dir: true,
            has_directories: false,
            size: 0,
            created: None,
            modified: None,
            extension: String::new(),
        }
    }

    pub fn with_created(mut self, created: Option<DateTime<Utc>>) -> Self {
        self.created = created;
        self
    }
}

/// Driver capability declaration / 驱动能力声明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Largest single write the provider accepts per request / 单次写入上限
    pub max_write_block: Option<u64>,
    /// Minimum part size except the last one / 最小分片大小
    pub min_part_size: Option<u64>,
    /// Whether reassembly keeps state in the session cache / 是否需要会话缓存
    pub needs_session: bool,
    /// Whether positional writes are used instead of appends / 是否按位置写入
    pub positional_writes: bool,
    /// Support server-side copy (no download needed) / 支持服务端复制
    pub can_server_side_copy: bool,
}

impl Default for Capability {
    fn default() -> Self {
        Self {
            max_write_block: None,
            min_part_size: None,
            needs_session: false,
            positional_writes: false,
            can_server_side_copy: true,
        }
    }
}

/// Storage driver interface, one implementation per provider / 存储驱动接口
///
/// Paths are normalized relative object paths; every driver maps a logical
/// path to the same relative location inside its container.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Configured provider id / 驱动ID
    fn id(&self) -> &str;

    fn kind(&self) -> DriverKind;

    fn capabilities(&self) -> Capability;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Open a reader, `None` when the object is absent / 打开读取器
    async fn open_reader(&self, path: &str) -> Result<Option<ObjectReader>>;

    /// Append one chunk of a multi-chunk upload / 追加分片
    ///
    /// Chunks arrive strictly ordered; the object is finalized at the last
    /// index. `timestamp` is the upload time in ticks.
    async fn append_chunk(&self, data: Bytes, meta: &ChunkMetadata, timestamp: i64) -> Result<()>;

    /// Overwrite an object in one request (delete-if-exists, then upload) / 整体上传
    async fn upload_whole(&self, data: Bytes, meta: &ChunkMetadata, timestamp: i64) -> Result<()>;

    /// Flat recursive listing of every object under `prefix`, stubs included / 列出前缀下所有对象
    async fn list(&self, prefix: &str) -> Result<Vec<Entry>>;

    /// Server-side copy of one object / 复制单个对象
    async fn copy(&self, src: &str, dst: &str) -> Result<()>;

    /// Delete one object; absent objects are not an error / 删除对象
    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete every object under a folder prefix / 递归删除
    async fn delete_recursive(&self, prefix: &str) -> Result<()>;

    /// Write the folder stub for `path` / 创建目录占位
    async fn create_folder(&self, path: &str) -> Result<()>;

    /// Object properties, `None` when absent / 获取元数据
    async fn get_metadata(&self, path: &str) -> Result<Option<ObjectMetadata>>;
}
