use crate::domain::ports::ObjectStore;
use crate::utils::error::{Result, WriterError};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// 依內容雜湊命名物件，相同圖片只存一份
pub fn object_key(data: &[u8], content_type: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(data));
    format!("{}.{}", &digest[..32], extension_for(content_type))
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        _ => "bin",
    }
}

/// Directory served under `public_base_url` (e.g. by a static file server or CDN origin).
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    dir: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(dir: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            dir: dir.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl LocalObjectStore {
    fn write_atomic(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl ObjectStore for LocalObjectStore {
    async fn upload(&self, data: &[u8], content_type: &str) -> Result<String> {
        if data.is_empty() {
            return Err(WriterError::UploadError {
                message: "refusing to upload an empty object".to_string(),
            });
        }

        let key = object_key(data, content_type);
        let path = self.dir.join(&key);
        let complete = fs::metadata(&path)
            .map(|meta| meta.len() == data.len() as u64)
            .unwrap_or(false);
        if !complete {
            self.write_atomic(&path, data)
                .map_err(|e| WriterError::UploadError {
                    message: format!("Failed to store {}: {}", path.display(), e),
                })?;
        }

        let url = format!("{}/{}", self.public_base_url, key);
        tracing::debug!("☁️ Stored {} bytes as {}", data.len(), url);
        Ok(url)
    }
}

#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

#[cfg(feature = "s3")]
mod s3 {
    use super::object_key;
    use crate::domain::ports::ObjectStore;
    use crate::utils::error::{Result, WriterError};
    use aws_sdk_s3::error::ProvideErrorMetadata;
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::Client as S3Client;

    #[derive(Debug, Clone)]
    pub struct S3ObjectStore {
        client: S3Client,
        bucket: String,
        prefix: String,
        public_base_url: String,
    }

    impl S3ObjectStore {
        pub fn new(client: S3Client, bucket: &str, prefix: &str, public_base_url: &str) -> Self {
            Self {
                client,
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
                public_base_url: public_base_url.trim_end_matches('/').to_string(),
            }
        }

        /// 使用預設憑證鏈建立客戶端
        pub async fn from_env(
            bucket: &str,
            prefix: Option<&str>,
            region: Option<&str>,
            public_base_url: Option<&str>,
        ) -> Self {
            let region = region.unwrap_or("ap-southeast-2").to_string();
            let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(region.clone()))
                .load()
                .await;
            let default_url = format!("https://{}.s3.{}.amazonaws.com", bucket, region);
            Self::new(
                S3Client::new(&sdk_config),
                bucket,
                prefix.unwrap_or("images"),
                public_base_url.unwrap_or(&default_url),
            )
        }

        fn key_for(&self, name: &str) -> String {
            if self.prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", self.prefix, name)
            }
        }
    }

    impl ObjectStore for S3ObjectStore {
        async fn upload(&self, data: &[u8], content_type: &str) -> Result<String> {
            let key = self.key_for(&object_key(data, content_type));
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .content_type(content_type)
                .body(ByteStream::from(data.to_vec()))
                .send()
                .await
                .map_err(|err| {
                    let err = err.into_service_error();
                    WriterError::UploadError {
                        message: format!(
                            "S3 put_object {} failed: {} {}",
                            key,
                            err.code().unwrap_or("unknown"),
                            err.message().unwrap_or_default()
                        ),
                    }
                })?;

            Ok(format!("{}/{}", self.public_base_url, key))
        }
    }
}
