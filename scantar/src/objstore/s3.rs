use super::{BodyStream, ListPage, ObjectEntry, ObjectStore, UploadedPart};
use crate::credentials::RefreshingCredentials;
use crate::{error, Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_smithy_types::byte_stream::{ByteStream, Length};
use snafu::prelude::*;
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info};

/// [`ObjectStore`] implementation for S3 and S3-compatible APIs.
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    /// Resolve region and credentials and construct the client.
    ///
    /// The signing identity comes from the SDK's default chain (environment, profile, then the
    /// instance metadata service), wrapped so it is re-materialized on the configured refresh
    /// interval; in-flight requests keep whichever identity they dispatched with.
    pub async fn connect(config: &Config) -> Result<Self> {
        let region_provider = RegionProviderChain::default_provider().or_else("us-east-1");

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider);
        if let Some(endpoint) = &config.s3_endpoint {
            loader = loader.endpoint_url(endpoint.as_str());
        }
        let sdk_config = loader.load().await;

        let region = sdk_config
            .region()
            .context(error::MissingRegionSnafu)?
            .clone();
        info!(%region, "resolved AWS region");

        let credentials = RefreshingCredentials::new(config.refresh_interval).await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            // S3-compatible services generally want path-style addressing when a custom
            // endpoint is in play
            .force_path_style(config.s3_endpoint.is_some())
            .build();

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_prefix(prefix.map(str::to_owned))
            .set_delimiter(delimiter.map(str::to_owned))
            .set_continuation_token(continuation)
            .send()
            .await
            .context(error::ListObjectsSnafu { bucket })?;

        let entries = output
            .contents
            .unwrap_or_default()
            .into_iter()
            // Listings occasionally surface entries with no key or size; those are unusable
            // and dropped silently
            .filter_map(|object| {
                let key = object.key?;
                let size = object.size.filter(|size| *size >= 0)?;
                Some(ObjectEntry {
                    key,
                    size: size as u64,
                })
            })
            .collect();

        Ok(ListPage {
            entries,
            next: output.next_continuation_token,
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<BodyStream> {
        let mut request = self.client.get_object().bucket(bucket).key(key);
        if let Some(range) = &range {
            // HTTP ranges are inclusive on both ends
            request = request.range(format!("bytes={}-{}", range.start, range.end - 1));
        }

        debug!(bucket, key, ?range, "fetching object");

        let output = request
            .send()
            .await
            .context(error::GetObjectSnafu { bucket, key })?;

        let key = key.to_owned();
        let stream = futures::stream::try_unfold(output.body, move |mut body| {
            let key = key.clone();
            async move {
                match body.try_next().await {
                    Ok(Some(bytes)) => Ok(Some((bytes, body))),
                    Ok(None) => Ok(None),
                    Err(source) => Err(source).context(error::ReadObjectBodySnafu { key }),
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_metadata(Some(metadata.clone()))
            .send()
            .await
            .context(error::CreateMultipartSnafu { bucket, key })?;

        output
            .upload_id
            .context(error::MissingUploadIdSnafu { key })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        path: &Path,
        offset: u64,
        length: u64,
    ) -> Result<UploadedPart> {
        let body = ByteStream::read_from()
            .path(path)
            .offset(offset)
            .length(Length::Exact(length))
            .build()
            .await
            .context(error::OpenUploadSectionSnafu { path })?;

        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(body)
            .send()
            .await
            .context(error::UploadPartSnafu { key, part_number })?;

        let etag = output
            .e_tag
            .context(error::MissingEtagSnafu { key, part_number })?;

        Ok(UploadedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|part| {
                        aws_sdk_s3::types::CompletedPart::builder()
                            .part_number(part.part_number)
                            .e_tag(part.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .context(error::CompleteMultipartSnafu { key })?;

        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        // Best effort; an abort that fails leaves orphaned parts for a bucket lifecycle rule
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(key, upload_id, error = %e, "abort of multipart upload failed");
        }

        Ok(())
    }
}
