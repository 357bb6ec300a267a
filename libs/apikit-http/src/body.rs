use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Progress callback invoked with `(bytes_transferred, total_bytes)`
///
/// `total_bytes` is `None` when the size is not known up front (a download
/// without `Content-Length`).
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Size of the frames a [`RequestBody`] is split into
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// Replayable request body
///
/// Holds the whole payload in memory so retries and token-refresh replays can
/// re-send it. Every clone starts from the beginning. When a progress callback
/// is attached, the body is yielded in [`BODY_CHUNK_SIZE`] frames and the
/// callback fires after each frame is handed to the transport.
#[derive(Default)]
pub struct RequestBody {
    data: Bytes,
    offset: usize,
    progress: Option<ProgressCallback>,
}

impl RequestBody {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
            progress: None,
        }
    }

    /// Attach a progress callback
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Total payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Payload bytes
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl Clone for RequestBody {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            offset: 0,
            progress: self.progress.clone(),
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("len", &self.data.len())
            .field("offset", &self.offset)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl From<Bytes> for RequestBody {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<String> for RequestBody {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let total = this.data.len();
        if this.offset >= total {
            return Poll::Ready(None);
        }

        let end = match this.progress {
            Some(_) => (this.offset + BODY_CHUNK_SIZE).min(total),
            None => total,
        };
        let chunk = this.data.slice(this.offset..end);
        this.offset = end;

        if let Some(progress) = &this.progress {
            progress(end as u64, Some(total as u64));
        }

        Poll::Ready(Some(Ok(Frame::data(chunk))))
    }

    fn is_end_stream(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact((self.data.len() - self.offset.min(self.data.len())) as u64)
    }
}
