//! Pipe - the bidirectional splice between an inbound and outbound stream
//!
//! Two independent copy loops, each crediting a counter per buffer transfer.
//! Cancellation is cooperative: the cancel token is checked between reads,
//! and dropping the halves closes both sockets to unblock peers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use super::stream::Stream;

/// Splice buffer size per direction (16 KiB)
pub const SPLICE_BUFFER_SIZE: usize = 16 * 1024;

/// Cooperative cancellation flag shared between a tracked connection and
/// its two copy loops.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the splice to stop. Idempotent.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before re-checking the flag so a cancel
            // between the check and the await is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-direction byte counter. Credits both the connection record's total
/// and the tracker's global accumulator; never blocks the splice.
#[derive(Clone, Default)]
pub struct Counter {
    total: Arc<AtomicU64>,
    global: Arc<AtomicU64>,
}

impl Counter {
    pub fn new(global: Arc<AtomicU64>) -> Self {
        Self {
            total: Arc::new(AtomicU64::new(0)),
            global,
        }
    }

    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
        self.global.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// The connection-record total, shared with the tracker.
    pub fn handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.total)
    }
}

/// A splice endpoint: one stream plus the shared cancel token.
pub struct Pipe {
    pub stream: Stream,
    pub cancel: CancelToken,
}

impl Pipe {
    pub fn new(stream: Stream, cancel: CancelToken) -> Self {
        Self { stream, cancel }
    }
}

/// Relay data bidirectionally until EOF, error or cancellation.
///
/// Returns `(uploaded, downloaded)` byte totals. Closure of either
/// direction shuts down the opposite write half; the counterpart loop then
/// drains to EOF and exits.
pub async fn relay(
    inbound: Pipe,
    outbound: Stream,
    up: Counter,
    down: Counter,
) -> (u64, u64) {
    let cancel = inbound.cancel.clone();
    let (mut in_read, mut in_write) = tokio::io::split(inbound.stream);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);

    let upload = copy_half(&mut in_read, &mut out_write, up, cancel.clone());
    let download = copy_half(&mut out_read, &mut in_write, down, cancel);

    tokio::join!(upload, download)
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, counter: Counter, cancel: CancelToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPLICE_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            },
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }

        total += n as u64;
        counter.add(n as u64);
    }

    let _ = writer.shutdown().await;
    total
}
