//! Uniform access to object storage backends.
//!
//! Every backend implements [`Bucket`]: get, range get, upload, delete,
//! attributes, existence checks and prefix iteration, each driven by a
//! cancellable [`Context`]. The filesystem backend stores one regular file per
//! key below a root directory and prunes empty directories on delete.
//!
//! ```no_run
//! use objstore::{Bucket, Context, FilesystemBucket, IterOption};
//!
//! # async fn run() -> objstore::Result<()> {
//! let bkt = FilesystemBucket::new("/var/lib/objstore")?;
//! let ctx = Context::background();
//!
//! bkt.upload(&ctx, "blocks/01/meta.json", &mut &b"{}"[..]).await?;
//! bkt.iter(&ctx, "blocks/", &mut |name| {
//!     println!("{}", name);
//!     Ok(())
//! }, &[IterOption::Recursive]).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod context;
pub mod model;
pub mod reader;
pub mod util;

/// Delimiter modelling a directory structure in a flat key space.
pub const DIR_DELIM: &str = "/";

pub use adapters::{
    filesystem::FilesystemBucket, gcs::GcsBucket, memory::MemoryBucket, new_bucket, s3::S3Bucket,
    Bucket,
};
pub use context::Context;
pub use model::{
    attrs::{IterObjectAttributes, ObjectAttributes},
    error::{Error, Result},
    iter::{apply_iter_options, validate_iter_options, IterOption, IterParams},
};
pub use reader::ObjectReader;
pub use util::object::Provider;
