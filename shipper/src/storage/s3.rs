use super::{ByteStream, ObjectStorage};
use crate::model::ObjectDescriptor;
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use shipper_core::config::StorageConfig;
use shipper_core::{Error, Result};
use std::num::NonZeroU32;
use tracing::{debug, instrument};

/// S3-compatible object storage. Credentials come from the SDK's default chain.
pub struct S3Storage {
    client: S3Client,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl S3Storage {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(profile) = &config.aws_profile {
            config_loader = config_loader.profile_name(profile);
        }

        let sdk_config = config_loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());

        let limiter = match config.max_requests_per_second {
            Some(rps) => {
                let rps = NonZeroU32::new(rps).ok_or_else(|| {
                    Error::Config("storage.max_requests_per_second must be greater than 0".into())
                })?;
                Some(RateLimiter::direct(Quota::per_second(rps)))
            }
            None => None,
        };

        Ok(Self { client, limiter })
    }

    async fn throttle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos())
}

#[async_trait]
impl ObjectStorage for S3Storage {
    #[instrument(skip(self))]
    async fn list(&self, bucket: &str) -> Result<Vec<ObjectDescriptor>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            self.throttle().await;

            let page = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    let details = match e {
                        aws_sdk_s3::error::SdkError::ServiceError(ref err) => {
                            format!("list service error: {:?}", err.err())
                        }
                        _ => format!("list failed: {}", e),
                    };
                    Error::storage(bucket, details)
                })?;

            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                objects.push(ObjectDescriptor {
                    name: key.to_string(),
                    size: obj.size().unwrap_or_default().max(0) as u64,
                    generation: obj
                        .e_tag()
                        .map(|t| t.trim_matches('"').to_string())
                        .unwrap_or_default(),
                    content_type: None,
                    last_modified: obj.last_modified().and_then(to_chrono),
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(bucket, objects = objects.len(), "Listed bucket");

        Ok(objects)
    }

    async fn open(&self, bucket: &str, object: &ObjectDescriptor) -> Result<ByteStream> {
        self.throttle().await;

        debug!(
            bucket,
            object = %object.name,
            "Fetching object"
        );

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(&object.name)
            .send()
            .await
            .map_err(|e| {
                let details = match e {
                    aws_sdk_s3::error::SdkError::ServiceError(ref err) => {
                        format!("service error for key '{}': {:?}", object.name, err.err())
                    }
                    _ => format!("failed to fetch key '{}': {}", object.name, e),
                };
                Error::storage(bucket, details)
            })?;

        Ok(Box::pin(response.body.into_async_read()))
    }
}
