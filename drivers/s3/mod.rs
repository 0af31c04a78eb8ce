//! Amazon S3 driver / S3 存储驱动
//!
//! Chunked uploads map onto S3 multipart uploads: chunk 0 initiates,
//! chunk `n` becomes part `n + 1`, the last chunk completes. The upload id
//! and part receipts live in the session cache between chunks.

mod client;
mod config;
mod driver;
mod factory;

pub use client::{BucketClient, PutOptions, S3Client, S3Object};
pub use config::S3Config;
pub use driver::{S3Driver, MIN_PART_SIZE};
pub use factory::S3DriverFactory;
