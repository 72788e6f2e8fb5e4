use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use aws_sdk_s3::{primitives::ByteStream, Client};
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

/// Bucket backed by AWS S3 or an S3 compatible service.
pub struct S3Bucket {
    client: Client,
    bucket: String,
    closed: AtomicBool,
}

impl S3Bucket {
    pub fn new(client: Client, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Builds a client from the standard AWS environment and profile chain.
    pub async fn from_env(bucket: &str) -> Result<Self> {
        if bucket.is_empty() {
            return Err(Error::backend("missing S3 bucket name"));
        }

        let config = aws_config::load_from_env().await;
        Ok(Self::new(Client::new(&config), bucket))
    }

    fn ensure_open(&self, ctx: &Context) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        ctx.check()
    }
}

fn to_system_time(t: &aws_sdk_s3::primitives::DateTime) -> SystemTime {
    let secs = u64::try_from(t.secs()).unwrap_or(0);
    SystemTime::UNIX_EPOCH + Duration::new(secs, t.subsec_nanos())
}

#[async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.bucket
    }

    fn provider(&self) -> Provider {
        Provider::AWS
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

        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}{}", dir.trim_end_matches(DIR_DELIM), DIR_DELIM)
        };
        let params = apply_iter_options(options);

        let mut continuation_token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);

            if !params.recursive {
                req = req.delimiter(DIR_DELIM);
            }
            if let Some(tok) = continuation_token.take() {
                req = req.continuation_token(tok);
            }

            let lo = ctx
                .run(async {
                    req.send().await.map_err(|err| {
                        Error::backend(format!("failed to list_objects at: {}, {}", prefix, err))
                    })
                })
                .await?;

            let mut entries: Vec<IterObjectAttributes> = Vec::new();
            for o in lo.contents() {
                let mut attrs = IterObjectAttributes::new(o.key().unwrap_or_default());
                if params.last_modified {
                    if let Some(t) = o.last_modified() {
                        attrs.set_last_modified(to_system_time(t));
                    }
                }
                entries.push(attrs);
            }
            for p in lo.common_prefixes() {
                if let Some(p) = p.prefix() {
                    entries.push(IterObjectAttributes::new(p));
                }
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            for attrs in entries {
                ctx.check()?;
                f(attrs)?;
            }

            continuation_token = lo.next_continuation_token().map(|tok| tok.to_string());
            if continuation_token.is_none() {
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
            self.attributes(ctx, name).await?;
            return Ok(ObjectReader::new(ctx, tokio::io::empty(), Some(0)));
        }

        let range = match length.and_then(|length| range_end(offset, length)) {
            Some(end) => Some(format!("bytes={}-{}", offset, end)),
            None if offset > 0 => Some(format!("bytes={}-", offset)),
            None => None,
        };
        let req = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .set_range(range);

        let o = ctx
            .run(async {
                match req.send().await {
                    Ok(o) => Ok(Some(o)),
                    // The offset is past the end of an existing object.
                    Err(err)
                        if err
                            .raw_response()
                            .is_some_and(|resp| resp.status().as_u16() == 416) =>
                    {
                        Ok(None)
                    }
                    Err(err)
                        if err
                            .as_service_error()
                            .is_some_and(|svc_err| svc_err.is_no_such_key()) =>
                    {
                        Err(Error::not_found(name))
                    }
                    Err(err) => Err(Error::backend(format!(
                        "failed to get_object: {}, {}",
                        name, err
                    ))),
                }
            })
            .await?;

        let Some(o) = o else {
            return Ok(ObjectReader::new(ctx, tokio::io::empty(), Some(0)));
        };

        let size = o.content_length().and_then(|len| u64::try_from(len).ok());
        Ok(ObjectReader::new(ctx, o.body.into_async_read(), size))
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    async fn attributes(&self, ctx: &Context, name: &str) -> Result<ObjectAttributes> {
        self.ensure_open(ctx)?;

        let req = self.client.head_object().bucket(&self.bucket).key(name);
        let ho = ctx
            .run(async {
                req.send().await.map_err(|err| {
                    if err
                        .as_service_error()
                        .is_some_and(|svc_err| svc_err.is_not_found())
                    {
                        return Error::not_found(name);
                    }

                    Error::backend(format!("failed to head_object: {}, {}", name, err))
                })
            })
            .await?;

        Ok(ObjectAttributes {
            size: ho
                .content_length()
                .and_then(|len| u64::try_from(len).ok())
                .unwrap_or(0),
            last_modified: ho.last_modified().map(to_system_time),
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

        ctx.run(async {
            let mut body = Vec::new();
            r.read_to_end(&mut body)
                .await
                .map_err(|err| Error::from_io_source("read", name, err))?;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(name)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|err| Error::backend(format!("failed to put_object at: {}, {}", name, err)))?;

            Ok(())
        })
        .await
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    async fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        // S3 deletes of missing keys succeed silently.
        if !self.exists(ctx, name).await? {
            return Err(Error::not_found(name));
        }

        let req = self.client.delete_object().bucket(&self.bucket).key(name);
        ctx.run(async {
            req.send().await.map_err(|err| {
                Error::backend(format!("failed to delete_object at: {}, {}", name, err))
            })?;

            Ok(())
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
    use super::*;

    #[test]
    fn test_to_system_time() {
        let cases = vec![
            (0, 0, SystemTime::UNIX_EPOCH),
            (
                1_700_000_000,
                500,
                SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 500),
            ),
            (-5, 0, SystemTime::UNIX_EPOCH),
        ];

        for (secs, nanos, expected) in cases {
            let t = aws_sdk_s3::primitives::DateTime::from_secs_and_nanos(secs, nanos);
            assert_eq!(to_system_time(&t), expected, "failed for case: {}", secs);
        }
    }
}
