use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    task::{Context as TaskContext, Poll},
};

use tokio::io::{AsyncRead, ReadBuf};

use crate::{context::Context, model::error::Error};

/// Readable object body returned by `Bucket::get` and `Bucket::get_range`.
///
/// Reads fail with `Error::Cancelled` or `Error::DeadlineExceeded` (wrapped in
/// an `io::Error`, see `Error::from_io_source`) once the context the reader
/// was opened with is done, including while a read is pending.
pub struct ObjectReader {
    inner: Pin<Box<dyn AsyncRead + Send>>,
    size: Option<u64>,
    done: Pin<Box<dyn Future<Output = Error> + Send>>,
    // Some(true) once the deadline hit, Some(false) once cancelled.
    stopped: Option<bool>,
}

impl ObjectReader {
    pub fn new<R>(ctx: &Context, inner: R, size: Option<u64>) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let ctx = ctx.clone();
        Self {
            inner: Box::pin(inner),
            size,
            done: Box::pin(async move { ctx.done().await }),
            stopped: None,
        }
    }

    /// Number of bytes this reader yields, when the backend reports it.
    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

fn stop_error(deadline: bool) -> io::Error {
    if deadline {
        Error::DeadlineExceeded.into_io()
    } else {
        Error::Cancelled.into_io()
    }
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(deadline) = this.stopped {
            return Poll::Ready(Err(stop_error(deadline)));
        }

        if let Poll::Ready(err) = this.done.as_mut().poll(cx) {
            let deadline = matches!(err, Error::DeadlineExceeded);
            this.stopped = Some(deadline);
            return Poll::Ready(Err(stop_error(deadline)));
        }

        this.inner.as_mut().poll_read(cx, buf)
    }
}

impl fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectReader")
            .field("size", &self.size)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_read_until_cancelled() {
        let ctx = Context::background();
        let mut reader = ObjectReader::new(&ctx, Cursor::new(b"0123456789".to_vec()), Some(10));
        assert_eq!(reader.size(), Some(10));

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0123");

        ctx.cancel();

        let err = reader.read(&mut buf).await.unwrap_err();
        let err = Error::from_io_source("read", "file", err);
        assert!(matches!(err, Error::Cancelled));

        // Stays failed.
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_read_wakes_on_cancel() {
        let ctx = Context::background();
        let (_writer, pipe) = tokio::io::duplex(16);
        let mut reader = ObjectReader::new(&ctx, pipe, None);

        let cancel = ctx.clone();
        tokio::spawn(async move { cancel.cancel() });

        let mut buf = Vec::new();
        let err = reader.read_to_end(&mut buf).await.unwrap_err();
        assert!(Error::from_io_source("read", "file", err).is_cancelled());
    }
}
