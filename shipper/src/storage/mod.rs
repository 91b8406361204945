pub mod s3;

#[cfg(test)]
pub mod fake;

use crate::model::ObjectDescriptor;
use async_trait::async_trait;
use shipper_core::Result;
use std::pin::Pin;
use tokio::io::AsyncRead;

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Read-only access to a remote bucket. Calls are idempotent so callers may
/// retry any failure.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// One listing snapshot of the bucket, in the order the service returns it.
    async fn list(&self, bucket: &str) -> Result<Vec<ObjectDescriptor>>;

    /// Open the content of one object.
    async fn open(&self, bucket: &str, object: &ObjectDescriptor) -> Result<ByteStream>;
}

pub use s3::S3Storage;
