use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, StorageError};
use crate::storage::folder::stub_path;
use crate::storage::{
    Capability, ChunkMetadata, DriverKind, Entry, ObjectMetadata, ObjectReader, StorageDriver,
};
use crate::utils::{guess_content_type, normalize_path};

/// Directory under the root holding sidecar metadata / 元数据目录
pub const META_DIR: &str = ".omnistore-meta";

/// Sidecar stored next to every uploaded file / 文件元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sidecar {
    content_type: Option<String>,
    cache_control: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

pub struct LocalDriver {
    id: String,
    root: PathBuf,
}

impl LocalDriver {
    pub fn new(id: &str, root: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            root,
        }
    }

    /// Map a logical path below the root; `..` cannot climb out / 映射到本地路径
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let path = normalize_path(path);
        if path.split('/').next() == Some(META_DIR) {
            return Err(StorageError::Fatal(format!("reserved path: {}", path)));
        }
        Ok(self.root.join(path))
    }

    fn sidecar_path(&self, path: &str) -> PathBuf {
        self.root
            .join(META_DIR)
            .join(format!("{}.json", normalize_path(path)))
    }

    async fn write_sidecar(&self, path: &str, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        let sidecar = Sidecar {
            content_type: Some(meta.effective_content_type()),
            cache_control: meta.cache_control.clone(),
            tags: meta
                .tags(timestamp)
                .to_pairs()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };
        let sidecar_path = self.sidecar_path(path);
        if let Some(parent) = sidecar_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&sidecar_path, serde_json::to_vec(&sidecar)?).await?;
        Ok(())
    }

    async fn read_sidecar(&self, path: &str) -> Result<Sidecar> {
        match tokio::fs::read(self.sidecar_path(path)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sidecar::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_if_exists(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_file(path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Recursive file walk (sync, run inside spawn_blocking) / 递归遍历
fn walk_sync(root: &Path, dir: &Path, out: &mut Vec<Entry>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let full = entry.path();
        let relative = full
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        if relative == META_DIR {
            continue;
        }
        if metadata.is_dir() {
            walk_sync(root, &full, out)?;
        } else {
            let to_utc = |t: std::io::Result<std::time::SystemTime>| {
                t.ok().map(chrono::DateTime::<chrono::Utc>::from)
            };
            out.push(
                Entry::file(&relative, metadata.len(), to_utc(metadata.modified()))
                    .with_created(to_utc(metadata.created())),
            );
        }
    }
    Ok(())
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Local
    }

    fn capabilities(&self) -> Capability {
        Capability {
            max_write_block: None,
            min_part_size: None,
            needs_session: false,
            positional_writes: false,
            can_server_side_copy: true,
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Self::is_file(&self.full_path(path)?).await
    }

    async fn open_reader(&self, path: &str) -> Result<Option<ObjectReader>> {
        match tokio::fs::File::open(self.full_path(path)?).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_chunk(&self, data: Bytes, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        let path = meta.object_path();
        let full_path = self.full_path(&path)?;

        let mut file = if meta.is_first() {
            // Ensure parent directory exists / 确保父目录存在
            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.write_sidecar(&path, meta, timestamp).await?;
            tokio::fs::File::create(&full_path).await?
        } else {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&full_path)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => StorageError::Fatal(format!(
                        "{}: chunk {} arrived before chunk 0",
                        path, meta.chunk_index
                    )),
                    _ => e.into(),
                })?
        };
        file.write_all(&data).await?;
        file.flush().await?;

        if meta.is_last() {
            let size = tokio::fs::metadata(&full_path).await?.len();
            if size != meta.total_file_size {
                tracing::warn!(
                    "Local file {} finished with {} bytes, declared {}",
                    path, size, meta.total_file_size
                );
            }
        }
        Ok(())
    }

    async fn upload_whole(&self, data: Bytes, meta: &ChunkMetadata, timestamp: i64) -> Result<()> {
        let path = meta.object_path();
        let full_path = self.full_path(&path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Self::remove_if_exists(&full_path).await?;
        tokio::fs::write(&full_path, &data).await?;
        self.write_sidecar(&path, meta, timestamp).await?;
        tracing::debug!("Local file uploaded: {}/{}", self.id, path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let root = self.root.clone();
        let all = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            walk_sync(&root, &root, &mut out)?;
            Ok::<_, std::io::Error>(out)
        })
        .await
        .map_err(|e| StorageError::Fatal(format!("list task failed: {}", e)))??;

        let prefix = prefix.trim_start_matches('/');
        let mut entries: Vec<Entry> = all.into_iter().filter(|e| e.path.starts_with(prefix)).collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let src_full = self.full_path(src)?;
        let dst_full = self.full_path(dst)?;
        if let Some(parent) = dst_full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src_full, &dst_full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(src.to_string()),
            _ => e.into(),
        })?;

        let src_sidecar = self.sidecar_path(src);
        if Self::is_file(&src_sidecar).await? {
            let dst_sidecar = self.sidecar_path(dst);
            if let Some(parent) = dst_sidecar.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&src_sidecar, &dst_sidecar).await?;
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        Self::remove_if_exists(&self.full_path(path)?).await?;
        Self::remove_if_exists(&self.sidecar_path(path)).await?;
        Ok(())
    }

    async fn delete_recursive(&self, prefix: &str) -> Result<()> {
        let folder = normalize_path(prefix);
        if folder.is_empty() {
            // 清空根目录但保留根本身
            for entry in self.list("").await? {
                self.delete(&entry.path).await?;
            }
            return Ok(());
        }

        let dirs = [
            self.full_path(&folder)?,
            self.root.join(META_DIR).join(&folder),
        ];
        for dir in dirs {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        let stub = self.full_path(&stub_path(path))?;
        if let Some(parent) = stub.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !Self::is_file(&stub).await? {
            tokio::fs::write(&stub, b"").await?;
        }
        Ok(())
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        let full_path = self.full_path(path)?;
        let metadata = match tokio::fs::metadata(&full_path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let sidecar = self.read_sidecar(path).await?;
        Ok(Some(ObjectMetadata {
            content_length: metadata.len(),
            content_type: sidecar
                .content_type
                .or_else(|| Some(guess_content_type(path))),
            etag: None,
            last_modified: metadata.modified().ok().map(chrono::DateTime::from),
            tags: sidecar.tags,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn chunk(index: u32, total: u32) -> ChunkMetadata {
        ChunkMetadata {
            upload_uid: "u1".to_string(),
            file_name: "a.txt".to_string(),
            relative_path: "docs".to_string(),
            content_type: String::new(),
            total_file_size: 9,
            total_chunks: total,
            chunk_index: index,
            image_width: Some("640".to_string()),
            image_height: None,
            cache_control: None,
        }
    }

    #[tokio::test]
    async fn test_chunks_append_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        let d = LocalDriver::new("disk", dir.path().to_path_buf());

        for (i, part) in ["abc", "def", "ghi"].iter().enumerate() {
            d.append_chunk(Bytes::from(part.to_string()), &chunk(i as u32, 3), 42)
                .await
                .unwrap();
        }

        let mut reader = d.open_reader("docs/a.txt").await.unwrap().unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "abcdefghi");

        let meta = d.get_metadata("docs/a.txt").await.unwrap().unwrap();
        assert_eq!(meta.content_length, 9);
        assert_eq!(meta.total_size(), Some(9));
        assert_eq!(meta.upload_uid(), Some("u1"));
        assert_eq!(meta.tags.get("imagewidth").map(|s| s.as_str()), Some("640"));
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let d = LocalDriver::new("disk", dir.path().to_path_buf());
        let err = d
            .append_chunk(Bytes::from_static(b"x"), &chunk(1, 3), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_list_hides_sidecars_and_delete_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let d = LocalDriver::new("disk", dir.path().to_path_buf());
        d.upload_whole(Bytes::from_static(b"x"), &chunk(0, 1), 0).await.unwrap();
        d.create_folder("docs/empty").await.unwrap();
        d.create_folder("docs/empty").await.unwrap();

        let paths: Vec<String> = d.list("").await.unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["docs/a.txt", "docs/empty/folder.stubxx"]);

        d.copy("docs/a.txt", "other/a.txt").await.unwrap();
        assert!(d.get_metadata("other/a.txt").await.unwrap().unwrap().upload_uid().is_some());

        d.delete_recursive("docs").await.unwrap();
        let paths: Vec<String> = d.list("").await.unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["other/a.txt"]);
        assert!(d.full_path(".omnistore-meta/x").is_err());
    }
}
