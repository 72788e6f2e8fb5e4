use std::{
    collections::BTreeMap,
    io::Cursor,
    sync::{
        atomic::{AtomicBool, Ordering},
        PoisonError, RwLock,
    },
    time::SystemTime,
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    adapters::{Bucket, IterWithAttributesFn},
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

struct Object {
    data: Vec<u8>,
    modified_time: SystemTime,
}

/// Bucket keeping every object in process memory. Meant for tests.
pub struct MemoryBucket {
    objects: RwLock<BTreeMap<String, Object>>,
    supported: Vec<IterOption>,
    closed: AtomicBool,
}

impl Default for MemoryBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::with_supported_iter_options(SUPPORTED_ITER_OPTIONS)
    }

    /// Restricts the iter options this bucket accepts, to mimic backends
    /// that lack some of them.
    pub fn with_supported_iter_options(supported: &[IterOption]) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            supported: supported.to_vec(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self, ctx: &Context) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        ctx.check()
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        "memory"
    }

    fn provider(&self) -> Provider {
        Provider::Memory
    }

    fn supported_iter_options(&self) -> &[IterOption] {
        &self.supported
    }

    async fn iter_with_attributes(
        &self,
        ctx: &Context,
        dir: &str,
        f: &mut IterWithAttributesFn<'_>,
        options: &[IterOption],
    ) -> Result<()> {
        validate_iter_options(&self.supported, options)?;
        self.ensure_open(ctx)?;

        let params = apply_iter_options(options);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}{}", dir.trim_end_matches(DIR_DELIM), DIR_DELIM)
        };

        // Snapshot first so the callback may use the bucket.
        let mut entries: Vec<IterObjectAttributes> = Vec::new();
        {
            let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
            for (key, obj) in objects.range(prefix.clone()..) {
                let Some(rest) = key.strip_prefix(&prefix) else {
                    break;
                };

                let name = match rest.find(DIR_DELIM) {
                    Some(pos) if !params.recursive => {
                        format!("{}{}", prefix, &rest[..=pos])
                    }
                    _ => key.clone(),
                };

                match entries.last_mut() {
                    Some(last) if last.name == name => {
                        if let Some(prev) = last.last_modified() {
                            if prev < obj.modified_time {
                                last.set_last_modified(obj.modified_time);
                            }
                        }
                    }
                    _ => {
                        let mut attrs = IterObjectAttributes::new(name);
                        if params.last_modified {
                            attrs.set_last_modified(obj.modified_time);
                        }
                        entries.push(attrs);
                    }
                }
            }
        }

        for attrs in entries {
            ctx.check()?;
            f(attrs)?;
        }

        Ok(())
    }

    async fn get(&self, ctx: &Context, name: &str) -> Result<ObjectReader> {
        self.get_range(ctx, name, 0, None).await
    }

    async fn get_range(
        &self,
        ctx: &Context,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader> {
        self.ensure_open(ctx)?;

        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let obj = objects.get(name).ok_or_else(|| Error::not_found(name))?;

        let size = obj.data.len();
        let start = usize::try_from(offset).unwrap_or(size).min(size);
        let end = match length {
            Some(length) => start.saturating_add(usize::try_from(length).unwrap_or(usize::MAX)),
            None => size,
        }
        .min(size);

        let data = obj.data[start..end].to_vec();
        let len = data.len() as u64;

        Ok(ObjectReader::new(ctx, Cursor::new(data), Some(len)))
    }

    async fn attributes(&self, ctx: &Context, name: &str) -> Result<ObjectAttributes> {
        self.ensure_open(ctx)?;

        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let obj = objects.get(name).ok_or_else(|| Error::not_found(name))?;

        Ok(ObjectAttributes {
            size: obj.data.len() as u64,
            last_modified: Some(obj.modified_time),
        })
    }

    async fn exists(&self, ctx: &Context, name: &str) -> Result<bool> {
        self.ensure_open(ctx)?;

        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.contains_key(name))
    }

    async fn upload(
        &self,
        ctx: &Context,
        name: &str,
        r: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        self.ensure_open(ctx)?;

        let mut data = Vec::new();
        ctx.run(async {
            r.read_to_end(&mut data)
                .await
                .map(|_| ())
                .map_err(|err| Error::from_io_source("read", name, err))
        })
        .await?;

        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.insert(
            name.to_string(),
            Object {
                data,
                modified_time: SystemTime::now(),
            },
        );

        Ok(())
    }

    async fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        self.ensure_open(ctx)?;

        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        match objects.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(name)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn list(bkt: &MemoryBucket, dir: &str, options: &[IterOption]) -> Vec<String> {
        let mut names = Vec::new();
        bkt.iter_with_attributes(
            &Context::background(),
            dir,
            &mut |attrs| {
                names.push(attrs.name);
                Ok(())
            },
            options,
        )
        .await
        .unwrap();

        names
    }

    #[tokio::test]
    async fn test_iter() {
        let bkt = MemoryBucket::new();
        let ctx = Context::background();

        for key in ["a/x", "a/b/y", "a/b/z", "ab", "z"] {
            bkt.upload(&ctx, key, &mut &b"data"[..]).await.unwrap();
        }

        let cases = vec![
            ("", vec![], vec!["a/", "ab", "z"]),
            ("a/", vec![], vec!["a/b/", "a/x"]),
            ("a", vec![], vec!["a/b/", "a/x"]),
            (
                "a/",
                vec![IterOption::Recursive],
                vec!["a/b/y", "a/b/z", "a/x"],
            ),
            ("missing/", vec![], vec![]),
        ];

        for (dir, options, expected) in cases {
            assert_eq!(
                list(&bkt, dir, &options).await,
                expected,
                "failed for case: {} {:?}",
                dir,
                options
            );
        }
    }

    #[tokio::test]
    async fn test_object_lifecycle() {
        let bkt = MemoryBucket::new();
        let ctx = Context::background();

        let err = bkt.get(&ctx, "file").await.unwrap_err();
        assert!(bkt.is_obj_not_found_err(&err));
        assert!(!bkt.exists(&ctx, "file").await.unwrap());

        bkt.upload(&ctx, "file", &mut &b"0123456789"[..]).await.unwrap();

        let mut buf = Vec::new();
        bkt.get_range(&ctx, "file", 2, Some(3))
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"234");

        let attrs = bkt.attributes(&ctx, "file").await.unwrap();
        assert_eq!(attrs.size, 10);
        assert!(attrs.last_modified.is_some());

        bkt.delete(&ctx, "file").await.unwrap();
        let err = bkt.delete(&ctx, "file").await.unwrap_err();
        assert!(bkt.is_obj_not_found_err(&err));
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let bkt = MemoryBucket::new();
        let ctx = Context::background();
        ctx.cancel();

        let res = bkt.upload(&ctx, "file", &mut &b"data"[..]).await;
        assert!(matches!(res, Err(Error::Cancelled)));
        assert!(!bkt.exists(&Context::background(), "file").await.unwrap());
    }
}
