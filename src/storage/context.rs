//! Storage context: replicated writes over every configured driver / 存储上下文
//!
//! Writes fan out to all drivers concurrently and are not rolled back when
//! one replica fails. Reads and listings are served by the primary driver.
//! Copy and rename go through copy, verify, then delete.

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use super::folder::{group_listing, stub_path};
use super::manager::{DriverBox, DriverDeps, StorageManager};
use super::session::{MemorySessionCache, SessionCache};
use super::{ChunkMetadata, Entry, ObjectMetadata, ObjectReader};
use crate::config::AppConfig;
use crate::credentials::CredentialProvider;
use crate::error::{Result, StorageError};
use crate::utils::{folder_prefix, is_sub_path, normalize_path, to_ticks};

/// Paths changed by a copy or rename, used to drive CDN purges / 受影响路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchedPaths {
    pub destination: String,
    /// Set for renames; the source no longer exists / 重命名的源路径
    pub source: Option<String>,
    pub is_folder: bool,
}

impl TouchedPaths {
    /// CDN paths to invalidate; folders purge everything below them / 需要刷新的CDN路径
    pub fn purge_paths(&self) -> Vec<String> {
        let to_path = |p: &str| {
            if self.is_folder {
                format!("{}/*", p)
            } else {
                p.to_string()
            }
        };
        let mut paths = vec![to_path(&self.destination)];
        if let Some(ref source) = self.source {
            paths.push(to_path(source));
        }
        paths
    }
}

/// One object moved by a transfer / 待复制对象
struct Transfer {
    src: String,
    dst: String,
}

/// Orchestrator over the configured drivers / 存储编排器
pub struct StorageContext {
    drivers: Vec<DriverBox>,
    primary: usize,
    sessions: Option<Arc<dyn SessionCache>>,
}

impl StorageContext {
    /// `primary_id` names the driver serving reads; defaults to the first / 创建上下文
    pub fn new(
        drivers: Vec<DriverBox>,
        primary_id: Option<&str>,
        sessions: Option<Arc<dyn SessionCache>>,
    ) -> Self {
        let primary = primary_id
            .and_then(|id| drivers.iter().position(|d| d.id() == id))
            .unwrap_or(0);
        Self {
            drivers,
            primary,
            sessions,
        }
    }

    /// Build every enabled provider from configuration / 从配置创建
    pub async fn from_config(
        config: &AppConfig,
        manager: &StorageManager,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self> {
        let sessions: Arc<dyn SessionCache> = Arc::new(MemorySessionCache::new());
        let deps = DriverDeps::from_settings(&config.storage, Some(sessions.clone()));
        let built = manager.build_drivers(&config.storage, credentials, &deps).await;

        let primary_id = built
            .iter()
            .find(|(provider, _)| provider.primary)
            .map(|(provider, _)| provider.id.clone());
        let drivers: Vec<DriverBox> = built.into_iter().map(|(_, driver)| driver).collect();

        let context = Self::new(drivers, primary_id.as_deref(), Some(sessions));
        if !context.is_configured() {
            return Err(StorageError::NotConfigured(
                "no storage provider could be created".to_string(),
            ));
        }
        tracing::info!(
            "Storage context ready: {} driver(s), primary {}",
            context.drivers.len(),
            context.drivers[context.primary].id()
        );
        Ok(context)
    }

    /// At least one driver, and a session cache once replication or a
    /// session-backed driver is in play / 是否已配置
    pub fn is_configured(&self) -> bool {
        !self.drivers.is_empty() && (self.sessions.is_some() || !self.needs_session())
    }

    fn needs_session(&self) -> bool {
        self.drivers.len() > 1 || self.drivers.iter().any(|d| d.capabilities().needs_session)
    }

    pub fn drivers(&self) -> &[DriverBox] {
        &self.drivers
    }

    /// Driver serving reads and listings / 主驱动
    pub fn primary(&self) -> Result<&DriverBox> {
        self.drivers
            .get(self.primary)
            .ok_or_else(|| StorageError::NotConfigured("no storage driver configured".to_string()))
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.is_configured() {
            Ok(())
        } else if self.drivers.is_empty() {
            Err(StorageError::NotConfigured("no storage driver configured".to_string()))
        } else {
            Err(StorageError::NotConfigured(
                "drivers configured without an upload session cache".to_string(),
            ))
        }
    }

    /// Run `op` on every driver concurrently; first error wins after all finished / 并发写入所有驱动
    async fn replicate<F, Fut>(&self, name: &str, op: F) -> Result<()>
    where
        F: Fn(DriverBox) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.ensure_configured()?;
        let results = join_all(self.drivers.iter().map(|d| op(d.clone()))).await;
        self.first_error(name, results)
    }

    /// Write one chunk to every driver / 写入一个分片
    ///
    /// Single-chunk uploads go straight to `upload_whole`.
    pub async fn append_chunk(&self, data: Bytes, meta: &ChunkMetadata) -> Result<()> {
        meta.validate()?;
        if meta.is_single() {
            return self.upload_whole(data, meta).await;
        }
        if !meta.is_last() {
            self.check_part_size(data.len() as u64)?;
        }

        let timestamp = to_ticks(Utc::now());
        self.replicate("append_chunk", |driver| {
            let data = data.clone();
            async move { driver.append_chunk(data, meta, timestamp).await }
        })
        .await?;

        if meta.is_last() {
            tracing::info!(
                "Upload {} finished: {} ({} bytes, {} chunks)",
                meta.upload_uid,
                meta.object_path(),
                meta.total_file_size,
                meta.total_chunks
            );
        }
        Ok(())
    }

    /// Every chunk but the last must meet each driver's minimum part size / 检查分片大小
    fn check_part_size(&self, len: u64) -> Result<()> {
        for driver in &self.drivers {
            if let Some(min) = driver.capabilities().min_part_size {
                if len < min {
                    return Err(StorageError::InvalidChunk(format!(
                        "chunk of {} bytes is below the {} byte minimum of driver {}",
                        len,
                        min,
                        driver.id()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Overwrite a whole object on every driver / 整体上传
    pub async fn upload_whole(&self, data: Bytes, meta: &ChunkMetadata) -> Result<()> {
        meta.validate()?;
        let timestamp = to_ticks(Utc::now());
        self.replicate("upload_whole", |driver| {
            let data = data.clone();
            async move { driver.upload_whole(data, meta, timestamp).await }
        })
        .await?;
        tracing::info!("Uploaded {} ({} bytes)", meta.object_path(), meta.total_file_size);
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let path = path.as_str();
        self.replicate("delete", |driver| async move { driver.delete(path).await })
            .await
    }

    /// Create a folder stub everywhere; idempotent / 创建目录
    pub async fn create_folder(&self, path: &str) -> Result<Entry> {
        let folder = normalize_path(path);
        if folder.is_empty() {
            return Err(StorageError::Conflict("the root folder always exists".to_string()));
        }
        if self.folder_exists(&folder).await? {
            return Ok(Entry::folder(&folder));
        }

        let folder_ref = folder.as_str();
        self.replicate("create_folder", |driver| async move {
            driver.create_folder(folder_ref).await
        })
        .await?;
        tracing::info!("Folder created: {}", folder);
        Ok(Entry::folder(&folder))
    }

    /// Sweep everything under the folder prefix, stub included / 递归删除目录
    pub async fn delete_folder(&self, path: &str) -> Result<()> {
        let folder = normalize_path(path);
        let folder_ref = folder.as_str();
        self.replicate("delete_folder", |driver| async move {
            driver.delete_recursive(folder_ref).await
        })
        .await?;
        tracing::info!("Folder deleted: {}", folder);
        Ok(())
    }

    /// A folder exists through its stub or any object below it / 目录是否存在
    pub async fn folder_exists(&self, path: &str) -> Result<bool> {
        let folder = normalize_path(path);
        if folder.is_empty() {
            return Ok(true);
        }
        let primary = self.primary()?;
        if primary.exists(&stub_path(&folder)).await? {
            return Ok(true);
        }
        Ok(!primary.list(&folder_prefix(&folder)).await?.is_empty())
    }

    /// Direct children of a folder, folders first / 列出目录
    pub async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let folder = normalize_path(prefix);
        let objects = self.primary()?.list(&folder_prefix(&folder)).await?;
        Ok(group_listing(&folder, &objects))
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.primary()?.exists(&normalize_path(path)).await
    }

    pub async fn open_reader(&self, path: &str) -> Result<Option<ObjectReader>> {
        self.primary()?.open_reader(&normalize_path(path)).await
    }

    pub async fn get_metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        self.primary()?.get_metadata(&normalize_path(path)).await
    }

    /// Read a whole object into memory / 读取整个对象
    pub async fn read_to_bytes(&self, path: &str) -> Result<Option<Bytes>> {
        let mut reader = match self.open_reader(path).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(Some(Bytes::from(buf)))
    }

    /// Copy a file or folder; the destination must not exist / 复制
    pub async fn copy(&self, src: &str, dst: &str) -> Result<TouchedPaths> {
        self.transfer(src, dst, false).await
    }

    /// Copy then delete the source / 重命名
    pub async fn rename(&self, src: &str, dst: &str) -> Result<TouchedPaths> {
        self.transfer(src, dst, true).await
    }

    /// Whether `src` is a file or a folder on the primary / 判断源是文件还是目录
    async fn source_is_folder(&self, src: &str) -> Result<bool> {
        let primary = self.primary()?;
        if primary.exists(src).await? {
            return Ok(false);
        }
        if primary.list(&folder_prefix(src)).await?.is_empty() {
            return Err(StorageError::NotFound(src.to_string()));
        }
        Ok(true)
    }

    /// Source objects on one driver and their mapped destinations / 计算单个驱动上的复制计划
    ///
    /// Folders are planned from each driver's own listing, so objects that
    /// only reached some replicas are still moved where they exist.
    async fn plan_on(driver: &DriverBox, src: &str, dst: &str, is_folder: bool) -> Result<Vec<Transfer>> {
        if !is_folder {
            return Ok(vec![Transfer {
                src: src.to_string(),
                dst: dst.to_string(),
            }]);
        }
        let base = folder_prefix(src);
        let objects = driver.list(&base).await?;
        Ok(objects
            .iter()
            .filter_map(|o| {
                let rest = o.path.strip_prefix(&base)?;
                Some(Transfer {
                    src: o.path.clone(),
                    dst: format!("{}{}", folder_prefix(dst), rest),
                })
            })
            .collect())
    }

    /// Whether any destination object already exists on `driver` / 检查目标冲突
    async fn destination_taken(driver: &DriverBox, dst: &str, transfers: &[Transfer], is_folder: bool) -> Result<bool> {
        if driver.exists(dst).await? {
            return Ok(true);
        }
        if is_folder && !driver.list(&folder_prefix(dst)).await?.is_empty() {
            return Ok(true);
        }
        for transfer in transfers {
            if driver.exists(&transfer.dst).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn copy_all(driver: &DriverBox, transfers: &[Transfer]) -> Result<()> {
        for transfer in transfers {
            driver.copy(&transfer.src, &transfer.dst).await?;
        }
        for transfer in transfers {
            if !driver.exists(&transfer.dst).await? {
                return Err(StorageError::Fatal(format!(
                    "copy of {} to {} not visible on driver {}",
                    transfer.src,
                    transfer.dst,
                    driver.id()
                )));
            }
        }
        Ok(())
    }

    /// Remove whatever a failed transfer left behind / 清理失败的复制
    async fn cleanup_destinations(&self, plans: &[Vec<Transfer>]) {
        let results = join_all(self.drivers.iter().zip(plans).map(|(driver, transfers)| async move {
            for transfer in transfers {
                match driver.exists(&transfer.dst).await {
                    Ok(true) => driver.delete(&transfer.dst).await?,
                    Ok(false) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok::<(), StorageError>(())
        }))
        .await;
        for (driver, result) in self.drivers.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Cleanup after failed copy incomplete on driver {}: {}", driver.id(), e);
            }
        }
    }

    /// Delete the moved sources on one driver / 删除已复制的源对象
    ///
    /// The folder itself is swept only once nothing is left under it, so an
    /// object that was never copied is never removed.
    async fn remove_sources(driver: &DriverBox, src: &str, transfers: &[Transfer], is_folder: bool) -> Result<()> {
        for transfer in transfers {
            driver.delete(&transfer.src).await?;
        }
        if is_folder {
            let remaining = driver.list(&folder_prefix(src)).await?;
            if remaining.is_empty() {
                driver.delete_recursive(src).await?;
            } else {
                tracing::warn!(
                    "{} object(s) appeared under {} on driver {} during rename, left in place",
                    remaining.len(),
                    src,
                    driver.id()
                );
            }
        }
        Ok(())
    }

    /// Log every failed driver and keep the first error / 记录失败并返回第一个错误
    fn first_error(&self, name: &str, results: Vec<Result<()>>) -> Result<()> {
        let mut first_error = None;
        for (driver, result) in self.drivers.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!("{} failed on driver {}: {}", name, driver.id(), e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn transfer(&self, src: &str, dst: &str, remove_source: bool) -> Result<TouchedPaths> {
        self.ensure_configured()?;
        let src = normalize_path(src);
        let dst = normalize_path(dst);
        let op = if remove_source { "rename" } else { "copy" };
        if src.is_empty() || dst.is_empty() {
            return Err(StorageError::Conflict(format!("cannot {} the root folder", op)));
        }
        if is_sub_path(&src, &dst) {
            return Err(StorageError::Conflict(format!("{} {} into itself ({})", op, src, dst)));
        }

        let is_folder = self.source_is_folder(&src).await?;
        let plans = join_all(
            self.drivers
                .iter()
                .map(|driver| Self::plan_on(driver, &src, &dst, is_folder)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        // 1. 任一驱动上目标已存在则不做任何修改
        let taken = join_all(
            self.drivers
                .iter()
                .zip(&plans)
                .map(|(driver, transfers)| Self::destination_taken(driver, &dst, transfers, is_folder)),
        )
        .await;
        for (driver, result) in self.drivers.iter().zip(taken) {
            if result? {
                return Err(StorageError::Conflict(format!(
                    "{} already exists on driver {}",
                    dst,
                    driver.id()
                )));
            }
        }

        // 2-3. 复制并验证
        let copied = join_all(
            self.drivers
                .iter()
                .zip(&plans)
                .map(|(driver, transfers)| Self::copy_all(driver, transfers)),
        )
        .await;
        if let Err(e) = self.first_error(&format!("{} {} -> {}", op, src, dst), copied) {
            self.cleanup_destinations(&plans).await;
            return Err(e);
        }

        // 4. 删除源
        if remove_source {
            let removed = join_all(
                self.drivers
                    .iter()
                    .zip(&plans)
                    .map(|(driver, transfers)| Self::remove_sources(driver, &src, transfers, is_folder)),
            )
            .await;
            self.first_error("rename cleanup", removed)?;
        }

        let objects: usize = plans.iter().map(|p| p.len()).max().unwrap_or(0);
        tracing::info!("{} {} -> {} ({} objects)", op, src, dst, objects);
        Ok(TouchedPaths {
            destination: dst,
            source: if remove_source { Some(src) } else { None },
            is_folder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::local::LocalDriver;
    use crate::storage::{Capability, DriverKind, StorageDriver};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Local driver whose copy can be made to fail / 可注入故障的驱动
    struct FlakyDriver {
        inner: LocalDriver,
        capability: Capability,
        fail_copy: AtomicBool,
    }

    impl FlakyDriver {
        fn new(id: &str, root: &std::path::Path) -> Self {
            let inner = LocalDriver::new(id, root.to_path_buf());
            Self {
                capability: inner.capabilities(),
                inner,
                fail_copy: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl StorageDriver for FlakyDriver {
        fn id(&self) -> &str {
            self.inner.id()
        }
        fn kind(&self) -> DriverKind {
            self.inner.kind()
        }
        fn capabilities(&self) -> Capability {
            self.capability.clone()
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }
        async fn open_reader(&self, path: &str) -> Result<Option<ObjectReader>> {
            self.inner.open_reader(path).await
        }
        async fn append_chunk(&self, data: Bytes, meta: &ChunkMetadata, ts: i64) -> Result<()> {
            self.inner.append_chunk(data, meta, ts).await
        }
        async fn upload_whole(&self, data: Bytes, meta: &ChunkMetadata, ts: i64) -> Result<()> {
            self.inner.upload_whole(data, meta, ts).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
            self.inner.list(prefix).await
        }
        async fn copy(&self, src: &str, dst: &str) -> Result<()> {
            // 复制一半后失败，留下部分目标
            self.inner.copy(src, dst).await?;
            if self.fail_copy.load(Ordering::SeqCst) {
                return Err(StorageError::Transient("injected copy failure".to_string()));
            }
            Ok(())
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }
        async fn delete_recursive(&self, prefix: &str) -> Result<()> {
            self.inner.delete_recursive(prefix).await
        }
        async fn create_folder(&self, path: &str) -> Result<()> {
            self.inner.create_folder(path).await
        }
        async fn get_metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
            self.inner.get_metadata(path).await
        }
    }

    struct Fixture {
        _dirs: Vec<TempDir>,
        flaky: Arc<FlakyDriver>,
        context: StorageContext,
    }

    fn fixture() -> Fixture {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let primary: DriverBox = Arc::new(LocalDriver::new("a", a.path().to_path_buf()));
        let flaky = Arc::new(FlakyDriver::new("b", b.path()));
        let sessions: Arc<dyn SessionCache> = Arc::new(MemorySessionCache::new());
        let context = StorageContext::new(vec![primary, flaky.clone()], Some("a"), Some(sessions));
        Fixture {
            _dirs: vec![a, b],
            flaky,
            context,
        }
    }

    fn chunk(folder: &str, name: &str, index: u32, total: u32, size: u64) -> ChunkMetadata {
        ChunkMetadata {
            upload_uid: format!("uid-{}", name),
            file_name: name.to_string(),
            relative_path: folder.to_string(),
            content_type: String::new(),
            total_file_size: size,
            total_chunks: total,
            chunk_index: index,
            image_width: None,
            image_height: None,
            cache_control: None,
        }
    }

    async fn put(context: &StorageContext, path: &str, body: &'static [u8]) {
        let folder = crate::utils::parent_path(path).to_string();
        let name = crate::utils::file_name(path).to_string();
        context
            .upload_whole(Bytes::from_static(body), &chunk(&folder, &name, 0, 1, body.len() as u64))
            .await
            .unwrap();
    }

    async fn read_all(driver: &dyn StorageDriver, path: &str) -> Option<Vec<u8>> {
        let mut reader = driver.open_reader(path).await.unwrap()?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        Some(buf)
    }

    #[tokio::test]
    async fn test_chunked_upload_replicates() {
        let f = fixture();
        let parts: [&[u8]; 3] = [b"hello ", b"chunked ", b"world"];
        for (i, part) in parts.iter().enumerate() {
            f.context
                .append_chunk(Bytes::copy_from_slice(part), &chunk("docs", "a.txt", i as u32, 3, 19))
                .await
                .unwrap();
        }

        for driver in f.context.drivers() {
            assert_eq!(read_all(driver.as_ref(), "docs/a.txt").await.unwrap(), b"hello chunked world");
            let meta = driver.get_metadata("docs/a.txt").await.unwrap().unwrap();
            assert_eq!(meta.total_size(), Some(19));
            assert_eq!(meta.content_length, 19);
        }
        assert_eq!(
            f.context.read_to_bytes("docs/a.txt").await.unwrap().unwrap(),
            Bytes::from_static(b"hello chunked world")
        );
    }

    #[tokio::test]
    async fn test_invalid_chunk_rejected() {
        let f = fixture();
        let err = f
            .context
            .append_chunk(Bytes::from_static(b"x"), &chunk("", "a.txt", 3, 3, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidChunk(_)));
        assert!(!f.context.exists("a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_small_part_rejected_before_any_write() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let primary: DriverBox = Arc::new(LocalDriver::new("a", a.path().to_path_buf()));
        let mut strict = FlakyDriver::new("b", b.path());
        strict.capability.min_part_size = Some(8);
        let sessions: Arc<dyn SessionCache> = Arc::new(MemorySessionCache::new());
        let context = StorageContext::new(vec![primary, Arc::new(strict)], Some("a"), Some(sessions));

        let err = context
            .append_chunk(Bytes::from_static(b"tiny"), &chunk("", "a.bin", 0, 2, 12))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidChunk(_)));
        for driver in context.drivers() {
            assert!(driver.list("").await.unwrap().is_empty());
        }

        // 最后一个分片不受限制
        context
            .append_chunk(Bytes::from_static(b"12345678"), &chunk("", "b.bin", 0, 2, 11))
            .await
            .unwrap();
        context
            .append_chunk(Bytes::from_static(b"9ab"), &chunk("", "b.bin", 1, 2, 11))
            .await
            .unwrap();
        for driver in context.drivers() {
            assert_eq!(read_all(driver.as_ref(), "b.bin").await.unwrap(), b"123456789ab");
        }
    }

    #[tokio::test]
    async fn test_create_folder_is_idempotent() {
        let f = fixture();
        let first = f.context.create_folder("/projects/new/").await.unwrap();
        let second = f.context.create_folder("projects/new").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.path, "projects/new");

        for driver in f.context.drivers() {
            let stubs = driver.list("projects/").await.unwrap();
            assert_eq!(stubs.len(), 1);
            assert_eq!(stubs[0].path, "projects/new/folder.stubxx");
        }
    }

    #[tokio::test]
    async fn test_stub_only_folder_lists_empty() {
        let f = fixture();
        f.context.create_folder("empty").await.unwrap();
        put(&f.context, "top.txt", b"t").await;

        let root = f.context.list("").await.unwrap();
        assert_eq!(root.len(), 2);
        assert!(root[0].is_dir);
        assert_eq!(root[0].name, "empty");
        assert_eq!(root[1].name, "top.txt");

        assert!(f.context.folder_exists("empty").await.unwrap());
        assert!(f.context.list("empty").await.unwrap().is_empty());

        f.context.delete_folder("empty").await.unwrap();
        assert!(!f.context.folder_exists("empty").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_conflict_leaves_destination() {
        let f = fixture();
        put(&f.context, "a.txt", b"source").await;
        put(&f.context, "b.txt", b"existing").await;

        let err = f.context.copy("a.txt", "b.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        for driver in f.context.drivers() {
            assert_eq!(read_all(driver.as_ref(), "b.txt").await.unwrap(), b"existing");
        }
    }

    #[tokio::test]
    async fn test_rename_folder() {
        let f = fixture();
        put(&f.context, "site/index.html", b"<html>").await;
        put(&f.context, "site/css/main.css", b"body{}").await;
        f.context.create_folder("site/img").await.unwrap();

        let touched = f.context.rename("site", "www").await.unwrap();
        assert!(touched.is_folder);
        assert_eq!(touched.purge_paths(), vec!["www/*".to_string(), "site/*".to_string()]);

        for driver in f.context.drivers() {
            assert!(driver.list("site/").await.unwrap().is_empty());
            assert_eq!(read_all(driver.as_ref(), "www/css/main.css").await.unwrap(), b"body{}");
            assert!(driver.exists("www/img/folder.stubxx").await.unwrap());
            let meta = driver.get_metadata("www/index.html").await.unwrap().unwrap();
            assert_eq!(meta.upload_uid(), Some("uid-index.html"));
        }
    }

    #[tokio::test]
    async fn test_failed_rename_cleans_up() {
        let f = fixture();
        put(&f.context, "docs/a.txt", b"a").await;
        put(&f.context, "docs/b.txt", b"b").await;
        f.flaky.fail_copy.store(true, Ordering::SeqCst);

        let err = f.context.rename("docs", "moved").await.unwrap_err();
        assert!(err.is_transient());

        for driver in f.context.drivers() {
            assert!(driver.list("moved/").await.unwrap().is_empty());
            assert_eq!(read_all(driver.as_ref(), "docs/a.txt").await.unwrap(), b"a");
            assert_eq!(read_all(driver.as_ref(), "docs/b.txt").await.unwrap(), b"b");
        }
    }

    #[tokio::test]
    async fn test_rename_folder_keeps_replica_only_objects() {
        let f = fixture();
        put(&f.context, "docs/a.txt", b"a").await;
        // 仅存在于副本b上的对象
        f.flaky
            .inner
            .upload_whole(Bytes::from_static(b"extra"), &chunk("docs", "extra.txt", 0, 1, 5), 0)
            .await
            .unwrap();

        f.context.rename("docs", "moved").await.unwrap();

        let b = &f.flaky.inner;
        assert_eq!(read_all(b, "moved/extra.txt").await.unwrap(), b"extra");
        assert!(!b.exists("docs/extra.txt").await.unwrap());
        for driver in f.context.drivers() {
            assert_eq!(read_all(driver.as_ref(), "moved/a.txt").await.unwrap(), b"a");
            assert!(driver.list("docs/").await.unwrap().is_empty());
        }
        assert!(!f.context.drivers()[0].exists("moved/extra.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_into_itself_rejected() {
        let f = fixture();
        put(&f.context, "docs/a.txt", b"a").await;
        assert!(matches!(
            f.context.rename("docs", "docs/inner").await.unwrap_err(),
            StorageError::Conflict(_)
        ));
        assert!(f.context.rename("missing", "x").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_is_configured() {
        let dir = tempfile::tempdir().unwrap();
        let driver = || -> DriverBox { Arc::new(LocalDriver::new("x", dir.path().to_path_buf())) };
        assert!(!StorageContext::new(Vec::new(), None, None).is_configured());
        assert!(StorageContext::new(vec![driver()], None, None).is_configured());
        assert!(!StorageContext::new(vec![driver(), driver()], None, None).is_configured());

        let mut session_backed = FlakyDriver::new("s", dir.path());
        session_backed.capability.needs_session = true;
        let session_backed: DriverBox = Arc::new(session_backed);
        assert!(!StorageContext::new(vec![session_backed.clone()], None, None).is_configured());
        let sessions: Arc<dyn SessionCache> = Arc::new(MemorySessionCache::new());
        assert!(StorageContext::new(vec![session_backed], None, Some(sessions)).is_configured());
    }
}
