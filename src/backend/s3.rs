//! S3 backend over the AWS SDK: ranged `GetObject`, with `HeadObject` size
//! discovery on offset-0 fetches. Object keys are `s3://bucket/object` URIs.

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::types::RequestPayer;
use aws_sdk_s3::Client;
use futures::stream;
use tokio_util::io::StreamReader;

use crate::backend::parse_bucket_object;
use crate::error::{Error, Result};
use crate::source::{StreamAtResponse, StreamSource};

/// S3 backend configuration options.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// AWS region override; falls back to the default provider chain.
    pub region: Option<String>,
    /// Custom endpoint URL (e.g. for MinIO or localstack).
    pub endpoint: Option<String>,
    /// Force path-style access, required by some S3-compatible services.
    pub force_path_style: bool,
    /// Bill the requester for the request.
    pub request_payer: bool,
}

pub struct S3Backend {
    client: Client,
    request_payer: bool,
}

impl S3Backend {
    /// Backend using the default credential and region chain.
    pub async fn new() -> Self {
        Self::with_config(S3Config::default()).await
    }

    pub async fn with_config(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        builder = builder.force_path_style(config.force_path_style);
        Self {
            client: Client::from_conf(builder.build()),
            request_payer: config.request_payer,
        }
    }

    /// Wrap a preconfigured [`Client`].
    pub fn from_client(client: Client, request_payer: bool) -> Self {
        Self {
            client,
            request_payer,
        }
    }
}

enum ApiFailure {
    NotFound,
    PastEnd,
    Other,
}

fn classify<E: ProvideErrorMetadata>(err: &E) -> ApiFailure {
    match err.code() {
        Some("InvalidRange") => ApiFailure::PastEnd,
        Some("NoSuchKey" | "NoSuchBucket" | "NotFound") => ApiFailure::NotFound,
        _ => ApiFailure::Other,
    }
}

#[async_trait]
impl StreamSource for S3Backend {
    async fn stream_at(&self, key: &str, offset: u64, len: u64) -> Result<StreamAtResponse> {
        let (bucket, object) = parse_bucket_object("s3", key)?;

        // Range responses do not carry the total length, so learn it once on
        // the offset-0 fetch.
        let mut total_size = None;
        if offset == 0 {
            let mut request = self.client.head_object().bucket(&bucket).key(&object);
            if self.request_payer {
                request = request.request_payer(RequestPayer::Requester);
            }
            match request.send().await {
                Ok(output) => total_size = output.content_length().map(|l| l as u64),
                Err(err) => {
                    return match classify(&err) {
                        ApiFailure::NotFound => Err(Error::NotFound(key.to_string())),
                        ApiFailure::PastEnd => Ok(StreamAtResponse::past_end(None)),
                        ApiFailure::Other => Err(Error::Backend(anyhow::Error::new(err))),
                    };
                }
            }
        }

        let mut request = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&object)
            .range(format!("bytes={}-{}", offset, offset + len - 1));
        if self.request_payer {
            request = request.request_payer(RequestPayer::Requester);
        }
        match request.send().await {
            Ok(output) => {
                let chunks = stream::try_unfold(output.body, |mut body| async move {
                    match body.try_next().await {
                        Ok(Some(chunk)) => Ok(Some((chunk, body))),
                        Ok(None) => Ok(None),
                        Err(err) => Err(std::io::Error::other(err)),
                    }
                });
                Ok(StreamAtResponse {
                    body: Some(Box::new(StreamReader::new(Box::pin(chunks)))),
                    total_size,
                })
            }
            Err(err) => match classify(&err) {
                ApiFailure::PastEnd => Ok(StreamAtResponse::past_end(total_size)),
                ApiFailure::NotFound => Err(Error::NotFound(key.to_string())),
                ApiFailure::Other => Err(Error::Backend(anyhow::Error::new(err))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_invalid_uri() {
        let backend = S3Backend::with_config(S3Config {
            region: Some("eu-central-1".to_string()),
            ..Default::default()
        })
        .await;
        let err = backend.stream_at("s3://bucket-only", 0, 1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
