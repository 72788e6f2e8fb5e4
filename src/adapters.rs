use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::{
    context::Context,
    model::{
        attrs::{IterObjectAttributes, ObjectAttributes},
        error::{Error, Result},
        iter::IterOption,
    },
    reader::ObjectReader,
    util::object::{parse_bucket_from_uri, parse_provider_from_uri, Provider},
};

pub mod filesystem;
pub mod gcs;
pub mod memory;
pub mod s3;

/// Callback invoked once per listed entry. Returning an error stops the listing.
pub type IterWithAttributesFn<'a> = dyn FnMut(IterObjectAttributes) -> Result<()> + Send + 'a;

/// Callback invoked once per listed name. Returning an error stops the listing.
pub type IterFn<'a> = dyn FnMut(&str) -> Result<()> + Send + 'a;

/// Operations every object storage backend provides.
///
/// A bucket is created once, shared by any number of concurrent callers and
/// closed once by its owner. Every operation observes the `Context` it is
/// given and fails with `Error::Cancelled` (or `Error::DeadlineExceeded`)
/// without side effects when the context is already done.
#[async_trait]
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    fn provider(&self) -> Provider;

    fn supported_iter_options(&self) -> &[IterOption];

    /// Calls `f` for each entry under `dir`, in an order fixed per backend.
    async fn iter_with_attributes(
        &self,
        ctx: &Context,
        dir: &str,
        f: &mut IterWithAttributesFn<'_>,
        options: &[IterOption],
    ) -> Result<()>;

    /// Calls `f` with the full name of each entry under `dir`.
    ///
    /// Only `IterOption::Recursive` is forwarded since no attributes are needed.
    async fn iter(
        &self,
        ctx: &Context,
        dir: &str,
        f: &mut IterFn<'_>,
        options: &[IterOption],
    ) -> Result<()> {
        let filtered: Vec<IterOption> = options
            .iter()
            .copied()
            .filter(|opt| *opt == IterOption::Recursive)
            .take(1)
            .collect();

        self.iter_with_attributes(ctx, dir, &mut |attrs| f(&attrs.name), &filtered)
            .await
    }

    async fn get(&self, ctx: &Context, name: &str) -> Result<ObjectReader>;

    /// Reads `length` bytes starting at `offset`, or up to the end when `length` is `None`.
    async fn get_range(
        &self,
        ctx: &Context,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader>;

    async fn attributes(&self, ctx: &Context, name: &str) -> Result<ObjectAttributes>;

    /// `Ok(false)` when the object does not exist.
    async fn exists(&self, ctx: &Context, name: &str) -> Result<bool>;

    /// Stores the whole of `r` as `name`. Nothing is visible under `name` on failure.
    async fn upload(
        &self,
        ctx: &Context,
        name: &str,
        r: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()>;

    async fn delete(&self, ctx: &Context, name: &str) -> Result<()>;

    /// Releases backend resources. Later operations fail with `Error::Closed`.
    async fn close(&self) -> Result<()>;

    fn is_obj_not_found_err(&self, err: &Error) -> bool {
        err.is_not_found()
    }
}

/// Opens the bucket a URI points at: `file:///path`, `gs://bucket`,
/// `s3://bucket` or `mem://`.
pub async fn new_bucket(uri: &str) -> Result<Arc<dyn Bucket>> {
    let provider = parse_provider_from_uri(uri)?;
    let bucket = parse_bucket_from_uri(uri);

    let bkt: Arc<dyn Bucket> = match provider {
        Provider::Filesystem => Arc::new(filesystem::FilesystemBucket::new(bucket)?),
        Provider::GCS => Arc::new(gcs::GcsBucket::from_env(bucket).await?),
        Provider::AWS => Arc::new(s3::S3Bucket::from_env(bucket).await?),
        Provider::Memory => Arc::new(memory::MemoryBucket::new()),
    };

    Ok(bkt)
}

/// Inclusive end of a `length` byte range starting at `offset`, as HTTP range
/// headers expect. `None` when the range runs past `u64::MAX`, meaning "to the end".
pub(crate) fn range_end(offset: u64, length: u64) -> Option<u64> {
    offset.checked_add(length.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().display());

        let cases = vec![(uri.as_str(), Provider::Filesystem), ("mem://", Provider::Memory)];

        for (uri, expected) in cases {
            let bkt = new_bucket(uri).await.unwrap();
            assert_eq!(bkt.provider(), expected, "failed for case: {}", uri);
        }

        assert!(new_bucket("ftp://bucket").await.is_err());
    }

    #[test]
    fn test_range_end() {
        let cases = vec![
            (0, 1, Some(0)),
            (3, 4, Some(6)),
            (0, u64::MAX, Some(u64::MAX - 1)),
            (1, u64::MAX, Some(u64::MAX)),
            (2, u64::MAX, None),
            (u64::MAX, 2, None),
        ];

        for (offset, length, expected) in cases {
            assert_eq!(
                range_end(offset, length),
                expected,
                "failed for case: {} {}",
                offset,
                length
            );
        }
    }

    #[tokio::test]
    async fn test_iter_forwards_recursive_only() {
        let bkt = memory::MemoryBucket::with_supported_iter_options(&[IterOption::Recursive]);
        let ctx = Context::background();

        for key in ["a/x", "a/b/y"] {
            bkt.upload(&ctx, key, &mut &b"data"[..]).await.unwrap();
        }

        // WithUpdatedAt is dropped instead of being rejected.
        let mut names = Vec::new();
        bkt.iter(
            &ctx,
            "a/",
            &mut |name| {
                names.push(name.to_string());
                Ok(())
            },
            &[IterOption::WithUpdatedAt, IterOption::Recursive],
        )
        .await
        .unwrap();
        assert_eq!(names, vec!["a/b/y", "a/x"]);

        let err = bkt
            .iter_with_attributes(&ctx, "a/", &mut |_| Ok(()), &[IterOption::WithUpdatedAt])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OptionNotSupported(IterOption::WithUpdatedAt)));
    }
}
