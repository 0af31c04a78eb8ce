//! S3 API seam / S3接口封装
//!
//! The driver talks to S3 only through [`S3Client`]; [`BucketClient`] is the
//! rust-s3 implementation. rust-s3 is built without `fail-on-err`, so every
//! response status is checked here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::serde_types::Part;
use s3::Region;
use std::collections::BTreeMap;

use crate::credentials::Credential;
use crate::error::{Result, StorageError};
use crate::storage::{ObjectMetadata, PartReceipt};
use super::config::S3Config;

/// Headers sent when an object is created / 创建对象时的头信息
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: String,
    pub cache_control: Option<String>,
    /// Custom metadata, sent as `x-amz-meta-*`
    pub metadata: Vec<(&'static str, String)>,
}

/// One object of a listing / 列表中的对象
#[derive(Debug, Clone)]
pub struct S3Object {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// S3 operations used by the driver / S3操作
#[async_trait]
pub trait S3Client: Send + Sync {
    async fn put_object(&self, key: &str, data: &[u8], options: &PutOptions) -> Result<()>;

    /// Returns the upload id / 返回上传ID
    async fn initiate_multipart(&self, key: &str, options: &PutOptions) -> Result<String>;

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: Vec<u8>) -> Result<PartReceipt>;

    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: Vec<PartReceipt>) -> Result<()>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>>;

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every object whose key starts with `prefix` / 按前缀列出
    async fn list_objects(&self, prefix: &str) -> Result<Vec<S3Object>>;

    async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()>;

    /// Absent keys are not an error / 不存在不报错
    async fn delete_object(&self, key: &str) -> Result<()>;
}

fn check_status(status: u16, context: &str) -> Result<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(StorageError::from_status(status, context.to_string()))
    }
}

/// rust-s3 backed client / rust-s3实现
pub struct BucketClient {
    bucket: Box<Bucket>,
}

impl BucketClient {
    /// 创建S3 Bucket客户端
    pub fn new(config: &S3Config, credential: Option<Credential>) -> Result<Self> {
        let credentials = match credential {
            Some(Credential::AwsAccessKey {
                access_key_id,
                secret_access_key,
                session_token,
            }) => Credentials::new(
                Some(&access_key_id),
                Some(&secret_access_key),
                session_token.as_deref(),
                None,
                None,
            )
            .map_err(|e| StorageError::Fatal(format!("创建S3凭证失败: {}", e)))?,
            Some(other) => {
                return Err(StorageError::Fatal(format!(
                    "S3 driver needs an aws_access_key credential, got {}",
                    other.kind()
                )))
            }
            // 使用环境变量或实例角色
            None => Credentials::default()
                .map_err(|e| StorageError::Fatal(format!("创建S3凭证失败: {}", e)))?,
        };

        let endpoint = if config.endpoint.is_empty() {
            format!("https://s3.{}.amazonaws.com", config.region)
        } else {
            config.endpoint.clone()
        };
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint,
        };

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| StorageError::Fatal(format!("创建S3 Bucket失败: {}", e)))?;
        let bucket = if config.force_path_style {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self { bucket })
    }

    /// Bucket handle carrying the object headers / 带对象头的Bucket
    fn bucket_with(&self, options: &PutOptions) -> Box<Bucket> {
        let mut bucket = self.bucket.clone();
        if let Some(ref cache_control) = options.cache_control {
            bucket.add_header("Cache-Control", cache_control);
        }
        for (name, value) in &options.metadata {
            bucket.add_header(&format!("x-amz-meta-{}", name), value);
        }
        bucket
    }
}

#[async_trait]
impl S3Client for BucketClient {
    async fn put_object(&self, key: &str, data: &[u8], options: &PutOptions) -> Result<()> {
        let response = self
            .bucket_with(options)
            .put_object_with_content_type(key, data, &options.content_type)
            .await?;
        check_status(response.status_code(), &format!("PUT {}", key))
    }

    async fn initiate_multipart(&self, key: &str, options: &PutOptions) -> Result<String> {
        let response = self
            .bucket_with(options)
            .initiate_multipart_upload(key, &options.content_type)
            .await?;
        Ok(response.upload_id)
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: Vec<u8>) -> Result<PartReceipt> {
        let part = self
            .bucket
            .put_multipart_chunk(data, key, part_number, upload_id, "application/octet-stream")
            .await?;
        if part.etag.is_empty() {
            return Err(StorageError::Fatal(format!(
                "UploadPart {} part {} returned no ETag",
                key, part_number
            )));
        }
        Ok(PartReceipt {
            part_number: part.part_number,
            etag: part.etag,
        })
    }

    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: Vec<PartReceipt>) -> Result<()> {
        let parts = parts
            .into_iter()
            .map(|p| Part {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();
        let response = self
            .bucket
            .complete_multipart_upload(key, upload_id, parts)
            .await?;
        check_status(response.status_code(), &format!("CompleteMultipartUpload {}", key))
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.bucket.abort_upload(key, upload_id).await?;
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let (head, status) = match self.bucket.head_object(key).await {
            Ok(r) => r,
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if status == 404 {
            return Ok(None);
        }
        check_status(status, &format!("HEAD {}", key))?;

        let tags: BTreeMap<String, String> = head
            .metadata
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| {
                let k = k.to_lowercase();
                let name = k.strip_prefix("x-amz-meta-").unwrap_or(&k).to_string();
                (name, v)
            })
            .collect();

        Ok(Some(ObjectMetadata {
            content_length: head.content_length.unwrap_or(0).max(0) as u64,
            content_type: head.content_type,
            etag: head.e_tag,
            last_modified: head
                .last_modified
                .as_deref()
                .and_then(crate::drivers::azure_rest::parse_date),
            tags,
        }))
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = match self.bucket.get_object(key).await {
            Ok(r) => r,
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if response.status_code() == 404 {
            return Ok(None);
        }
        check_status(response.status_code(), &format!("GET {}", key))?;
        Ok(Some(response.bytes().to_vec()))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<S3Object>> {
        let pages = self.bucket.list(prefix.to_string(), None).await?;
        let mut objects = Vec::new();
        for page in pages {
            for obj in page.contents {
                objects.push(S3Object {
                    last_modified: crate::drivers::azure_rest::parse_date(&obj.last_modified),
                    key: obj.key,
                    size: obj.size,
                });
            }
        }
        Ok(objects)
    }

    async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()> {
        // copy_object_internal的from参数需要URL编码（中文等非ASCII字符）
        let encoded_src = urlencoding::encode(src_key);
        let status = self
            .bucket
            .copy_object_internal(&encoded_src, dst_key)
            .await?;
        check_status(status, &format!("CopyObject {} -> {}", src_key, dst_key))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let response = match self.bucket.delete_object(key).await {
            Ok(r) => r,
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if response.status_code() == 404 {
            return Ok(());
        }
        check_status(response.status_code(), &format!("DELETE {}", key))
    }
}
