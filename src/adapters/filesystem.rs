use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{error, instrument, warn};

use crate::{
    adapters::{Bucket, IterWithAttributesFn},
    context::Context,
    model::{
        attrs::{IterObjectAttributes, ObjectAttributes},
        error::{Error, Result},
        iter::{apply_iter_options, validate_iter_options, IterOption, IterParams},
    },
    reader::ObjectReader,
    util::object::Provider,
    DIR_DELIM,
};

const SUPPORTED_ITER_OPTIONS: &[IterOption] = &[IterOption::Recursive, IterOption::WithUpdatedAt];

/// Suffix of the files uploads stage their content in before renaming.
pub const UPLOAD_SUFFIX: &str = ".objstore-upload";

// Guards "remove file, then prune empty ancestors" for every bucket in the
// process. Uploads hold it while creating parent directories so a prune
// never removes a directory an upload is about to write into.
static PRUNE_LOCK: Mutex<()> = Mutex::new(());

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

fn lock_prune() -> MutexGuard<'static, ()> {
    PRUNE_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bucket backed by a directory tree on the local filesystem.
///
/// Each key is one regular file below the root directory. Nothing else is
/// stored: every operation reads the current state from disk.
pub struct FilesystemBucket {
    root: PathBuf,
    name: String,
    closed: AtomicBool,
}

impl FilesystemBucket {
    /// Opens a bucket rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|err| Error::from_io_source("resolve", root, err))?
                .join(root)
        };

        std::fs::create_dir_all(&root).map_err(|err| Error::from_io_source("mkdir", &root, err))?;

        Ok(Self {
            name: root.display().to_string(),
            root,
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        Ok(())
    }

    /// Maps a key to its file below the root.
    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let key = clean_key(name)?;
        if key.is_empty() {
            return Err(Error::InvalidKey {
                key: name.to_string(),
                reason: "object name is empty",
            });
        }

        Ok(self.root.join(key))
    }

    async fn stat_object(&self, name: &str, path: &Path) -> Result<std::fs::Metadata> {
        let meta = fs::metadata(path)
            .await
            .map_err(|err| Error::from_io("stat", name, path, err))?;

        if meta.is_dir() {
            return Err(Error::InvalidKey {
                key: name.to_string(),
                reason: "key names a directory",
            });
        }

        Ok(meta)
    }

    fn iter_dir<'a, 'b>(
        &'a self,
        ctx: &'a Context,
        dir: String,
        abs_dir: PathBuf,
        f: &'a mut IterWithAttributesFn<'b>,
        params: IterParams,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut read_dir = match fs::read_dir(&abs_dir).await {
                Ok(read_dir) => read_dir,
                Err(err) if is_missing(&err) => return Ok(()),
                Err(err) => return Err(Error::from_io_source("read dir", &abs_dir, err)),
            };

            let mut entries = Vec::new();
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|err| Error::from_io_source("read dir", &abs_dir, err))?
            {
                let file_type = match entry.file_type().await {
                    Ok(file_type) => file_type,
                    Err(err) if is_missing(&err) => continue,
                    Err(err) => return Err(Error::from_io_source("stat", entry.path(), err)),
                };
                entries.push((entry.file_name(), file_type.is_dir()));
            }
            entries.sort();

            for (file_name, is_dir) in entries {
                ctx.check()?;

                let Some(file_name) = file_name.to_str() else {
                    warn!(dir = %abs_dir.display(), file_name = ?file_name, "skipping non UTF-8 entry");
                    continue;
                };

                let abs_path = abs_dir.join(file_name);
                let mut name = if dir.is_empty() {
                    file_name.to_string()
                } else {
                    format!("{}{}{}", dir, DIR_DELIM, file_name)
                };

                if is_dir {
                    if params.recursive {
                        self.iter_dir(ctx, name, abs_path, &mut *f, params).await?;
                        continue;
                    }

                    match has_objects(abs_path.clone()).await {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(err) if is_missing(&err) => continue,
                        Err(err) => return Err(Error::from_io_source("read dir", &abs_path, err)),
                    }

                    name.push_str(DIR_DELIM);
                } else if file_name.ends_with(UPLOAD_SUFFIX) {
                    continue;
                }

                let mut attrs = IterObjectAttributes::new(name);
                if params.last_modified {
                    let meta = match fs::metadata(&abs_path).await {
                        Ok(meta) => meta,
                        Err(err) if is_missing(&err) => continue,
                        Err(err) => return Err(Error::from_io_source("stat", &abs_path, err)),
                    };
                    if let Ok(modified) = meta.modified() {
                        attrs.set_last_modified(modified);
                    }
                }

                f(attrs)?;
            }

            Ok(())
        })
    }
}

#[async_trait]
impl Bucket for FilesystemBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> Provider {
        Provider::Filesystem
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
        self.ensure_open()?;
        validate_iter_options(SUPPORTED_ITER_OPTIONS, options)?;
        ctx.check()?;

        let params = apply_iter_options(options);
        let dir = clean_key(dir)?;
        let abs_dir = self.root.join(&dir);

        self.iter_dir(ctx, dir, abs_dir, f, params).await
    }

    async fn get(&self, ctx: &Context, name: &str) -> Result<ObjectReader> {
        self.get_range(ctx, name, 0, None).await
    }

    #[instrument(level = "debug", skip_all, fields(name = %name, offset = offset, length = ?length))]
    async fn get_range(
        &self,
        ctx: &Context,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader> {
        self.ensure_open()?;
        ctx.check()?;

        let path = self.object_path(name)?;
        let meta = self.stat_object(name, &path).await?;

        ctx.check()?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|err| Error::from_io("open", name, &path, err))?;

        let size = meta.len();
        let start = offset.min(size);
        if start > 0 {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|err| Error::from_io_source("seek", &path, err))?;
        }

        let remaining = size - start;
        let reader = match length {
            None => ObjectReader::new(ctx, file, Some(remaining)),
            Some(length) => ObjectReader::new(ctx, file.take(length), Some(remaining.min(length))),
        };

        Ok(reader)
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    async fn attributes(&self, ctx: &Context, name: &str) -> Result<ObjectAttributes> {
        self.ensure_open()?;
        ctx.check()?;

        let path = self.object_path(name)?;
        let meta = self.stat_object(name, &path).await?;

        Ok(ObjectAttributes {
            size: meta.len(),
            last_modified: meta.modified().ok(),
        })
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    async fn exists(&self, ctx: &Context, name: &str) -> Result<bool> {
        self.ensure_open()?;
        ctx.check()?;

        let path = self.object_path(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(!meta.is_dir()),
            Err(err) if is_missing(&err) => Ok(false),
            Err(err) => Err(Error::from_io_source("stat", &path, err)),
        }
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    async fn upload(
        &self,
        ctx: &Context,
        name: &str,
        r: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        self.ensure_open()?;
        ctx.check()?;

        let path = self.object_path(name)?;
        let staging = staging_path(&path);

        let file = {
            let root = self.root.clone();
            let key = name.to_string();
            let path = path.clone();
            let staging = staging.clone();
            blocking(move || create_staging(&root, &key, &path, &staging)).await?
        };
        let mut file = fs::File::from_std(file);

        let copied = ctx
            .run(async {
                tokio::io::copy(r, &mut file)
                    .await
                    .map_err(|err| Error::from_io_source("copy", &staging, err))?;
                file.flush()
                    .await
                    .map_err(|err| Error::from_io_source("flush", &staging, err))
            })
            .await;
        drop(file);

        let res = match copied {
            Ok(()) => fs::rename(&staging, &path)
                .await
                .map_err(|err| Error::from_io_source("rename", &path, err)),
            Err(err) => Err(err),
        };

        if res.is_err() {
            let root = self.root.clone();
            let cleanup = blocking(move || discard_staging(&root, &path, &staging)).await;
            if let Err(err) = cleanup {
                error!(error_message=%err, error_group="discard_staging", name=name);
            }
        }

        res
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    async fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        self.ensure_open()?;
        ctx.check()?;

        let path = self.object_path(name)?;
        let root = self.root.clone();
        let key = name.to_string();

        blocking(move || remove_and_prune(&root, &key, &path)).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Normalizes a key or prefix into a relative path string: leading, trailing
/// and repeated delimiters are dropped. `.` and `..` segments are rejected.
fn clean_key(name: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in name.split(DIR_DELIM) {
        match segment {
            "" => continue,
            "." | ".." => {
                return Err(Error::InvalidKey {
                    key: name.to_string(),
                    reason: "relative path segment",
                })
            }
            segment => segments.push(segment),
        }
    }

    Ok(segments.join(DIR_DELIM))
}

/// Staging file next to `path`. The name does not embed the key so it stays
/// short whatever the length of the final file name.
fn staging_path(path: &Path) -> PathBuf {
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}-{}{}", process::id(), seq, UPLOAD_SUFFIX))
}

fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

/// True when `path` holds at least one listable object at any depth.
/// Staging files of in-flight uploads and non UTF-8 names do not count.
fn has_objects(path: PathBuf) -> BoxFuture<'static, io::Result<bool>> {
    Box::pin(async move {
        let mut read_dir = fs::read_dir(&path).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(err),
            };

            if file_type.is_dir() {
                match has_objects(entry.path()).await {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(err) if is_missing(&err) => {}
                    Err(err) => return Err(err),
                }
            } else if entry
                .file_name()
                .to_str()
                .is_some_and(|name| !name.ends_with(UPLOAD_SUFFIX))
            {
                return Ok(true);
            }
        }

        Ok(false)
    })
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| Error::backend(format!("failed to join blocking task: {}", err)))?
}

fn create_staging(root: &Path, name: &str, path: &Path, staging: &Path) -> Result<std::fs::File> {
    let _guard = lock_prune();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| Error::from_io_source("mkdir", parent, err))?;
    }

    if path.is_dir() {
        return Err(Error::InvalidKey {
            key: name.to_string(),
            reason: "key names a directory",
        });
    }

    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(staging)
        .map_err(|err| {
            // Parents created above must not outlive the failed upload.
            if let Err(prune_err) = prune_empty_dirs(root, path) {
                error!(error_message=%prune_err, error_group="prune", name=name);
            }
            Error::from_io_source("create", staging, err)
        })
}

/// Removes the staging file of a failed upload and the directories it left empty.
fn discard_staging(root: &Path, path: &Path, staging: &Path) -> Result<()> {
    let _guard = lock_prune();

    match std::fs::remove_file(staging) {
        Ok(()) => {}
        Err(err) if is_missing(&err) => {}
        Err(err) => return Err(Error::from_io_source("rm", staging, err)),
    }

    prune_empty_dirs(root, path)
}

fn remove_and_prune(root: &Path, name: &str, path: &Path) -> Result<()> {
    let _guard = lock_prune();

    let meta = std::fs::symlink_metadata(path).map_err(|err| Error::from_io("stat", name, path, err))?;
    if meta.is_dir() {
        return Err(Error::InvalidKey {
            key: name.to_string(),
            reason: "key names a directory",
        });
    }

    std::fs::remove_file(path).map_err(|err| Error::from_io("rm", name, path, err))?;

    prune_empty_dirs(root, path).inspect_err(|err| {
        error!(error_message=%err, error_group="prune", name=name);
    })
}

/// Removes the empty ancestors of `path` up to, not including, `root`.
///
/// Must be called with the prune lock held. An ancestor that is already gone
/// counts as pruned.
fn prune_empty_dirs(root: &Path, path: &Path) -> Result<()> {
    let mut dir = path.parent();

    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }

        let empty = match std::fs::read_dir(current) {
            Ok(mut read_dir) => read_dir.next().is_none(),
            Err(err) if is_missing(&err) => {
                dir = current.parent();
                continue;
            }
            Err(err) => return Err(Error::from_io_source("read dir", current, err)),
        };

        if !empty {
            break;
        }

        match std::fs::remove_dir(current) {
            Ok(()) => {}
            Err(err) if is_missing(&err) => {}
            Err(err) => return Err(Error::from_io_source("rm", current, err)),
        }

        dir = current.parent();
    }

    Ok(())
}
