//! Azure File share driver / Azure 文件共享驱动
//!
//! Files are created with their final length up front and filled with
//! positional range writes (at most 4 MiB each). The write cursor lives in
//! the upload session cache between chunks.

mod config;
mod driver;
mod factory;

pub use config::AzureFileConfig;
pub use driver::{AzureFileDriver, MAX_RANGE_SIZE};
pub use factory::AzureFileDriverFactory;
