//! Object-store director.
//!
//! Every request is rewritten to a presigned S3 URL for the object at
//! `{prefix}/{path}` in the configured bucket.  The URL carries its own
//! credentials, so the outbound request needs no further signing.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use axum::http::{HeaderName, HeaderValue, Method};
use chrono::Utc;
use tracing::{debug, instrument};
use url::Url;

use super::{BackendDirective, effective_key};
use crate::config::{Config, S3Config};

pub struct S3Director {
    client: Client,
    bucket: String,
    prefix: String,
    presign_ttl: Duration,
}

impl std::fmt::Debug for S3Director {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Director")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("presign_ttl", &self.presign_ttl)
            .finish_non_exhaustive()
    }
}

impl S3Director {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let client = build_s3_client(&config.s3).await;
        Self::new(client, &config.backend, config.s3.presign_ttl)
    }

    /// Bucket is the URI host; the prefix is the URI path without slashes.
    pub fn new(client: Client, backend: &Url, presign_ttl: Duration) -> Result<Self> {
        let bucket = backend
            .host_str()
            .filter(|h| !h.is_empty())
            .with_context(|| format!("backend URI has no bucket: {backend}"))?
            .to_string();
        let prefix = backend.path().trim_matches('/').to_string();

        Ok(Self {
            client,
            bucket,
            prefix,
            presign_ttl,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Presign a GetObject (for `GET`) or PutObject (for `PUT`) request.
    ///
    /// Any other method is rejected; callers filter those out before
    /// directing.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn direct(&self, method: &Method, path: &str) -> Result<BackendDirective> {
        let key = effective_key(&self.prefix, path);

        let presigning = PresigningConfig::builder()
            .expires_in(self.presign_ttl)
            .build()
            .context("build PresigningConfig")?;
        let issued_at = Utc::now();

        let presigned = match *method {
            Method::GET => self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .presigned(presigning)
                .await
                .context("presign S3 GetObject")?,
            Method::PUT => self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .presigned(presigning)
                .await
                .context("presign S3 PutObject")?,
            _ => bail!("method {method} cannot be directed to an object store"),
        };

        let url = Url::parse(presigned.uri())
            .with_context(|| format!("presigned URL is not valid: {}", presigned.uri()))?;
        let headers = presigned
            .headers()
            .filter_map(|(name, value)| {
                Some((
                    HeaderName::from_bytes(name.as_bytes()).ok()?,
                    HeaderValue::from_str(value).ok()?,
                ))
            })
            .collect();
        let expires_at = chrono::Duration::from_std(self.presign_ttl)
            .ok()
            .map(|ttl| issued_at + ttl);

        debug!(%key, "presigned backend request");
        Ok(BackendDirective {
            key,
            url,
            headers,
            expires_at,
        })
    }
}

/// Build an S3 client from the ambient AWS configuration chain, applying the
/// optional region and endpoint overrides.
async fn build_s3_client(settings: &S3Config) -> Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &settings.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    let aws_config = loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(endpoint) = &settings.endpoint_url {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }

    let client = Client::from_conf(builder.build());
    tracing::info!(
        region = ?aws_config.region(),
        endpoint = settings.endpoint_url.as_deref().unwrap_or("default"),
        "S3 client initialised"
    );
    client
}

#[cfg(test)]
mod tests {
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};

    use super::*;

    fn offline_client(endpoint: Option<&str>) -> Client {
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new(
                "AKIDEXAMPLE",
                "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
                None,
                None,
                "test",
            ));
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Client::from_conf(builder.build())
    }

    fn director(endpoint: Option<&str>) -> S3Director {
        S3Director::new(
            offline_client(endpoint),
            &Url::parse("s3://mybucket/prefix/").unwrap(),
            Duration::from_secs(600),
        )
        .unwrap()
    }

    #[test]
    fn bucket_and_prefix_come_from_backend_uri() {
        let d = director(None);
        assert_eq!(d.bucket(), "mybucket");
        assert_eq!(d.prefix, "prefix");
    }

    #[test]
    fn backend_uri_without_bucket_is_rejected() {
        let url = Url::parse("s3:///prefix").unwrap();
        assert!(S3Director::new(offline_client(None), &url, Duration::from_secs(600)).is_err());
    }

    #[tokio::test]
    async fn get_is_presigned_for_effective_key() {
        let d = director(None);
        let before = Utc::now();
        let directive = d.direct(&Method::GET, "/ab/cd12").await.unwrap();

        assert_eq!(directive.key, "prefix/ab/cd12");
        assert_eq!(directive.url.path(), "/prefix/ab/cd12");
        assert!(directive.url.host_str().unwrap().starts_with("mybucket."));

        let query = directive.url.query().unwrap();
        assert!(query.contains("X-Amz-Expires=600"));
        assert!(query.contains("X-Amz-Signature="));
        assert!(query.contains("AKIDEXAMPLE"));

        let expires_at = directive.expires_at.unwrap();
        assert!(expires_at >= before + chrono::Duration::seconds(600));
        assert!(expires_at <= Utc::now() + chrono::Duration::seconds(600));
    }

    #[tokio::test]
    async fn put_is_presigned_with_path_style_endpoint() {
        let d = director(Some("http://localhost:9000"));
        let directive = d.direct(&Method::PUT, "/cas/ff").await.unwrap();

        assert_eq!(directive.url.host_str(), Some("localhost"));
        assert_eq!(directive.url.path(), "/mybucket/prefix/cas/ff");
        assert!(directive.url.query().unwrap().contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn other_methods_are_rejected() {
        let d = director(None);
        assert!(d.direct(&Method::DELETE, "/ab").await.is_err());
        assert!(d.direct(&Method::HEAD, "/ab").await.is_err());
    }
}
