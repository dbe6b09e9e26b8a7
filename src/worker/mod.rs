//! Streaming workers.
//!
//! One worker task per active transport direction moves media between the
//! Bluetooth socket and the client FIFO. Every worker runs a single loop
//! that selects over a cooperative [shutdown token](ShutdownToken), the
//! per-PCM signal channel and its data descriptors; teardown happens on one
//! path only, with scoped ownership releasing buffers, codec handles and
//! descriptors.

use std::{
    fmt,
    os::unix::io::{AsRawFd, RawFd},
    sync::Arc,
};
use tokio::{
    io::{unix::AsyncFd, ReadBuf},
    sync::watch,
    task::JoinHandle,
};

use crate::{
    sock::{self, OwnedFd},
    Result,
};

mod decoder;
mod encoder;
#[cfg(feature = "hfp")]
mod sco;

pub use decoder::spawn_decoder;
pub use encoder::spawn_encoder;
#[cfg(feature = "hfp")]
pub use sco::{spawn_sco_worker, ScoFraming};

/// Creates a linked shutdown trigger and token.
pub fn shutdown_pair() -> (Shutdown, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (Shutdown { tx }, ShutdownToken { rx })
}

/// Trigger side of the cooperative cancellation pair.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Requests shutdown of all linked tokens.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Token observed by worker loops alongside their I/O.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Completes once shutdown has been requested.
    ///
    /// Also completes when the trigger side is gone, which means the
    /// owning transport no longer exists.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Handle of a spawned worker.
pub struct WorkerHandle {
    label: &'static str,
    shutdown: Shutdown,
    join: JoinHandle<()>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WorkerHandle").field("label", &self.label).finish()
    }
}

impl WorkerHandle {
    pub(crate) fn new(label: &'static str, shutdown: Shutdown, join: JoinHandle<()>) -> Self {
        Self { label, shutdown, join }
    }

    /// Worker description for diagnostics.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Requests shutdown and waits for the loop to finish.
    pub async fn stop(self) {
        self.shutdown.trigger();
        if let Err(err) = self.join.await {
            log::error!("Worker {} panicked: {err}", self.label);
        }
    }
}

/// Bluetooth media socket wrapped for async I/O.
///
/// Shared between the up to two workers of a bidirectional codec; the
/// descriptor closes when the owning transport drops its last reference
/// after the workers have been joined.
pub struct BtStream {
    fd: AsyncFd<OwnedFd>,
}

impl fmt::Debug for BtStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BtStream").field("fd", &self.fd.get_ref().as_raw_fd()).finish()
    }
}

impl BtStream {
    /// Wraps a connected Bluetooth socket.
    ///
    /// The descriptor is switched to non-blocking mode.
    pub fn new(fd: OwnedFd) -> Result<Arc<Self>> {
        sock::set_nonblocking(&fd).map_err(crate::Error::from)?;
        Ok(Arc::new(Self { fd: AsyncFd::new(fd).map_err(crate::Error::from)? }))
    }

    /// Raw descriptor, for diagnostics.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }

    /// Receives one datagram.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut buf = ReadBuf::new(buf);
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| sock::read(inner.get_ref(), &mut buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Sends one datagram atomically.
    pub async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| sock::write(inner.get_ref(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Immutable per-stream parameters handed to a worker at spawn time.
#[derive(Clone, Debug)]
pub struct StreamParams {
    /// PCM sampling rate in frames per second.
    pub rate: u32,
    /// Channel count.
    pub channels: u8,
    /// Largest datagram the link accepts for writing.
    pub mtu_write: usize,
    /// Largest datagram the link delivers when reading.
    pub mtu_read: usize,
    /// RTP timestamp clock in ticks per second; usually the sampling rate.
    pub rtp_clock_rate: u32,
    /// Codec-specific RTP media header length, or [None] when the codec
    /// sends bare frames without RTP.
    pub rtp_codec_header_len: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_token_observes_trigger() {
        let (shutdown, mut token) = shutdown_pair();
        assert!(!token.is_cancelled());
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_trigger_cancels_token() {
        let (shutdown, mut token) = shutdown_pair();
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn worker_handle_stop_joins() {
        let (shutdown, mut token) = shutdown_pair();
        let join = tokio::spawn(async move {
            token.cancelled().await;
        });
        let handle = WorkerHandle::new("test", shutdown, join);
        assert_eq!(handle.label(), "test");
        tokio::time::timeout(Duration::from_secs(1), handle.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn bt_stream_over_socketpair() {
        let (a, b) = sock::socketpair(libc::SOCK_SEQPACKET).unwrap();
        let a = BtStream::new(a).unwrap();
        let b = BtStream::new(b).unwrap();
        a.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
