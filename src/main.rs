use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use omnistore::cdn::PurgeService;
use omnistore::config;
use omnistore::credentials::{ChainedCredentials, EnvCredentials};
use omnistore::storage::{ChunkMetadata, StorageContext, StorageManager, TouchedPaths};
use omnistore::utils::{file_name, guess_content_type, parent_path};

/// Default upload chunk size, above the S3 minimum part size / 默认分片大小
const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify every configured driver / 检查驱动
    Check,
    /// List entries under a folder / 列出目录
    Ls {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Create a folder on every driver / 创建目录
    Mkdir { path: String },
    /// Delete a file, or a folder with --recursive / 删除
    Rm {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Upload a local file in chunks / 分片上传本地文件
    Put {
        local: PathBuf,
        dest: String,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Copy a file or folder / 复制
    Cp { src: String, dst: String },
    /// Rename a file or folder / 重命名
    Mv { src: String, dst: String },
    /// Purge paths from every CDN / 刷新CDN
    Purge {
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Purge what a copy or rename touched, when a CDN is configured / 刷新受影响路径
async fn purge_touched(purge: &PurgeService, touched: &TouchedPaths) -> anyhow::Result<()> {
    let results = purge.purge_touched(touched).await;
    print_json(&serde_json::json!({
        "destination": touched.destination,
        "source": touched.source,
        "is_folder": touched.is_folder,
        "purge": results,
    }))
}

async fn put_file(
    storage: &StorageContext,
    local: &Path,
    dest: &str,
    chunk_size: usize,
) -> anyhow::Result<()> {
    if chunk_size == 0 {
        return Err(anyhow!("chunk size must be positive"));
    }
    let file = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("Failed to open {:?}", local))?;
    let total_file_size = file.metadata().await?.len();
    let total_chunks = total_file_size.div_ceil(chunk_size as u64).max(1) as u32;

    let dest = omnistore::utils::normalize_path(dest);
    let name = file_name(&dest).to_string();
    let mut meta = ChunkMetadata {
        upload_uid: uuid::Uuid::new_v4().to_string(),
        file_name: name.clone(),
        relative_path: parent_path(&dest).to_string(),
        content_type: guess_content_type(&name),
        total_file_size,
        total_chunks,
        chunk_index: 0,
        image_width: None,
        image_height: None,
        cache_control: None,
    };

    let mut reader = file;
    for chunk_index in 0..total_chunks {
        let mut buf = Vec::with_capacity(chunk_size);
        (&mut reader).take(chunk_size as u64).read_to_end(&mut buf).await?;
        meta.chunk_index = chunk_index;
        storage.append_chunk(Bytes::from(buf), &meta).await?;
        tracing::info!("Uploaded chunk {}/{} of {}", chunk_index + 1, total_chunks, dest);
    }

    print_json(&storage.get_metadata(&dest).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "omnistore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration / 加载配置
    let config_path = cli.config.unwrap_or_else(config::get_config_path);
    let app_config = config::load_config_from(&config_path).map_err(|e| anyhow!(e))?;
    tracing::info!("omnistore {} (built {})", env!("CARGO_PKG_VERSION"), env!("BUILD_TIME"));

    let credentials = ChainedCredentials::new(vec![
        Box::new(app_config.static_credentials()),
        Box::new(EnvCredentials),
    ]);

    let storage_manager = StorageManager::new();
    omnistore::register_storage_drivers(&storage_manager).await?;

    let purge = PurgeService::from_config(&app_config.cdn, &credentials)?;

    // CDN purge needs no storage / 刷新CDN不需要存储
    if let Command::Purge { ref paths } = cli.command {
        if purge.is_empty() {
            return Err(anyhow!("no CDN provider configured"));
        }
        return print_json(&purge.purge(paths).await);
    }

    let storage = StorageContext::from_config(&app_config, &storage_manager, &credentials).await?;

    match cli.command {
        Command::Check => {
            let mut healthy = true;
            for driver in storage.drivers() {
                healthy &= storage_manager.verify_driver(driver).await;
            }
            let errors = storage_manager.get_all_driver_errors().await;
            print_json(&serde_json::json!({
                "driver_types": storage_manager.list_driver_types().await,
                "drivers": storage
                    .drivers()
                    .iter()
                    .map(|d| serde_json::json!({
                        "id": d.id(),
                        "type": d.kind().as_str(),
                        "capabilities": d.capabilities(),
                    }))
                    .collect::<Vec<_>>(),
                "primary": storage.primary()?.id(),
                "cdn_providers": !purge.is_empty(),
                "errors": errors,
            }))?;
            if !healthy || !errors.is_empty() {
                return Err(anyhow!("{} driver(s) failed verification", errors.len()));
            }
        }
        Command::Ls { prefix } => print_json(&storage.list(&prefix).await?)?,
        Command::Mkdir { path } => print_json(&storage.create_folder(&path).await?)?,
        Command::Rm { path, recursive } => {
            if recursive {
                storage.delete_folder(&path).await?;
            } else {
                storage.delete(&path).await?;
            }
            tracing::info!("Deleted {}", path);
        }
        Command::Put {
            local,
            dest,
            chunk_size,
        } => put_file(&storage, &local, &dest, chunk_size).await?,
        Command::Cp { src, dst } => {
            let touched = storage.copy(&src, &dst).await?;
            purge_touched(&purge, &touched).await?;
        }
        Command::Mv { src, dst } => {
            let touched = storage.rename(&src, &dst).await?;
            purge_touched(&purge, &touched).await?;
        }
        Command::Purge { .. } => {}
    }

    Ok(())
}
