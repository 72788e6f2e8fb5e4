use std::{
    io::Cursor,
    sync::atomic::{AtomicBool, Ordering},
    time::SystemTime,
};

use async_trait::async_trait;
use google_cloud_storage::{
    client::{Client, ClientConfig},
    http::{
        objects::{
            delete::DeleteObjectRequest,
            download::Range,
            get::GetObjectRequest,
            list::ListObjectsRequest,
            upload::{Media, UploadObjectRequest, UploadType},
        },
        Error as GcsError,
    },
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::instrument;

use crate::{
    adapters::{range_end, Bucket, IterWithAttributesFn},
    context::Context,
    model::{
        attrs::{IterObjectAttributes, ObjectAttributes},
        error::{Error, Result},
        iter::{apply_iter_options, validate_iter_options, IterOption},
    },
    reader::ObjectReader,
    util::object::Provider,
    DIR_DELIM,
};

const SUPPORTED_ITER_OPTIONS: &[IterOption] = &[IterOption::Recursive, IterOption::WithUpdatedAt];

/// Bucket backed by Google Cloud Storage.
pub struct GcsBucket {
    client: Client,
    bucket: String,
    closed: AtomicBool,
}

impl GcsBucket {
    pub fn new(client: Client, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Builds a client from the ambient Google credentials.
    pub async fn from_env(bucket: &str) -> Result<Self> {
        if bucket.is_empty() {
            return Err(Error::backend(
                "missing Google Cloud Storage bucket name",
            ));
        }

        let config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|err| Error::backend(format!("failed to load gcs credentials: {}", err)))?;

        Ok(Self::new(Client::new(config), bucket))
    }

    fn ensure_open(&self, ctx: &Context) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        ctx.check()
    }

    fn object_request(&self, name: &str) -> GetObjectRequest {
        GetObjectRequest {
            bucket: self.bucket.clone(),
            object: name.to_string(),
            ..Default::default()
        }
    }
}

fn status_code(err: &GcsError) -> Option<u16> {
    match err {
        GcsError::Response(resp) => Some(resp.code),
        GcsError::HttpClient(err) => err.status().map(|status| status.as_u16()),
        _ => None,
    }
}

fn map_err(op: &str, name: &str, err: GcsError) -> Error {
    match status_code(&err) {
        Some(404) => Error::not_found(name),
        _ => Error::backend(format!("failed to {} at: {}, {}", op, name, err)),
    }
}

#[async_trait]
impl Bucket for GcsBucket {
    fn name(&self) -> &str {
        &self.bucket
    }

    fn provider(&self) -> Provider {
        Provider::GCS
    }

    fn supported_iter_options(&self) -> &[IterOption] {
        SUPPORTED_ITER_OPTIONS
    }

    #[instrument(level = "debug", skip_all, fields(dir = %dir))]
    async fn iter_with_attributes(
        &self,
        ctx: &Context,
        dir: &str,
        f: &mut IterWithAttributesFn<'_>,
        options: &[IterOption],
    ) -> Result<()> {
        validate_iter_options(SUPPORTED_ITER_OPTIONS, options)?;
        self.ensure_open(ctx)?;

        // Without the trailing delimiter the prefix would only match the object itself.
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}{}", dir.trim_end_matches(DIR_DELIM), DIR_DELIM)
        };

        let params = apply_iter_options(options);
        let delimiter = if params.recursive {
            None
        } else {
            Some(DIR_DELIM.to_string())
        };

        let mut page_token: Option<String> = None;
        loop {
            let req = ListObjectsRequest {
                bucket: self.bucket.clone(),
                prefix: Some(prefix.clone()),
                delimiter: delimiter.clone(),
                page_token: page_token.clone(),
                ..Default::default()
            };

            let page = ctx
                .run(async {
                    self.client
                        .list_objects(&req)
                        .await
                        .map_err(|err| map_err("list_objects", &prefix, err))
                })
                .await?;

            let mut entries: Vec<IterObjectAttributes> = Vec::new();
            for obj in page.items.unwrap_or_default() {
                let mut attrs = IterObjectAttributes::new(obj.name);
                if params.last_modified {
                    if let Some(updated) = obj.updated {
                        attrs.set_last_modified(SystemTime::from(updated));
                    }
                }
                entries.push(attrs);
            }
            for dir_prefix in page.prefixes.unwrap_or_default() {
                entries.push(IterObjectAttributes::new(dir_prefix));
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            for attrs in entries {
                ctx.check()?;
                f(attrs)?;
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(())
    }

    async fn get(&self, ctx: &Context, name: &str) -> Result<ObjectReader> {
        self.get_range(ctx, name, 0, None).await
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    async fn get_range(
        &self,
        ctx: &Context,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader> {
        self.ensure_open(ctx)?;

        if length == Some(0) {
            // An inclusive byte range cannot express zero bytes.
            self.attributes(ctx, name).await?;
            return Ok(ObjectReader::new(ctx, tokio::io::empty(), Some(0)));
        }

        let range = match length.and_then(|length| range_end(offset, length)) {
            Some(end) => Range(Some(offset), Some(end)),
            None if offset > 0 => Range(Some(offset), None),
            None => Range::default(),
        };

        let req = self.object_request(name);
        let bytes = ctx
            .run(async {
                match self.client.download_object(&req, &range).await {
                    Ok(bytes) => Ok(bytes),
                    // The offset is past the end of an existing object.
                    Err(err) if status_code(&err) == Some(416) => Ok(Vec::new()),
                    Err(err) => Err(map_err("download_object", name, err)),
                }
            })
            .await?;

        let size = bytes.len() as u64;
        Ok(ObjectReader::new(ctx, Cursor::new(bytes), Some(size)))
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    async fn attributes(&self, ctx: &Context, name: &str) -> Result<ObjectAttributes> {
        self.ensure_open(ctx)?;

        let req = self.object_request(name);
        let obj = ctx
            .run(async {
                self.client
                    .get_object(&req)
                    .await
                    .map_err(|err| map_err("get_object", name, err))
            })
            .await?;

        Ok(ObjectAttributes {
            size: u64::try_from(obj.size).unwrap_or_default(),
            last_modified: obj.updated.map(SystemTime::from),
        })
    }

    async fn exists(&self, ctx: &Context, name: &str) -> Result<bool> {
        match self.attributes(ctx, name).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    async fn upload(
        &self,
        ctx: &Context,
        name: &str,
        r: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        self.ensure_open(ctx)?;

        let req = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };

        ctx.run(async {
            let mut body = Vec::new();
            r.read_to_end(&mut body)
                .await
                .map_err(|err| Error::from_io_source("read", name, err))?;

            self.client
                .upload_object(&req, body, &UploadType::Simple(Media::new(name.to_string())))
                .await
                .map_err(|err| map_err("put_object", name, err))?;

            Ok(())
        })
        .await
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    async fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        self.ensure_open(ctx)?;

        let req = DeleteObjectRequest {
            bucket: self.bucket.clone(),
            object: name.to_string(),
            ..Default::default()
        };

        ctx.run(async {
            self.client
                .delete_object(&req)
                .await
                .map_err(|err| map_err("delete_object", name, err))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use google_cloud_storage::http::error::ErrorResponse;

    use super::*;

    fn response(code: u16) -> GcsError {
        GcsError::Response(ErrorResponse {
            code,
            errors: Vec::new(),
            message: format!("status {}", code),
        })
    }

    #[test]
    fn test_map_err() {
        let cases = vec![(404, true), (416, false), (500, false)];

        for (code, not_found) in cases {
            assert_eq!(status_code(&response(code)), Some(code), "failed for case: {}", code);
            let err = map_err("get_object", "folder/file", response(code));
            assert_eq!(err.is_not_found(), not_found, "failed for case: {}", code);
        }

        let err = GcsError::InvalidRangeHeader("bytes".to_string());
        assert_eq!(status_code(&err), None);
    }
}
