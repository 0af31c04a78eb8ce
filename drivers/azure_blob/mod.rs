//! Azure Blob storage driver / Azure Blob 存储驱动
//!
//! Files are append blobs: chunk 0 recreates the blob, every chunk is
//! appended in blocks of at most 2.5 MiB, the last chunk seals it.

mod config;
mod driver;
mod factory;

pub use config::AzureBlobConfig;
pub use driver::{AzureBlobDriver, MAX_APPEND_BLOCK_SIZE};
pub use factory::AzureBlobDriverFactory;
