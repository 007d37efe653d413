//! Shared full-duplex connection with receiver fan-out.
//!
//! One [`Connection`] owns one TCP stream and lets any number of
//! transactions share it. Writes are serialized in arrival order; every
//! inbound frame is offered to all registered receivers, front to back,
//! until each decides for itself whether to consume it. This is what allows
//! a client to keep several requests in flight and accept their responses in
//! whatever order the remote produces them.
//!
//! The receiver walk happens under the connection mutex and tolerates
//! removal mid-iteration: a callback returning `true` (quit) is swept from
//! the list before the next frame arrives and its completion is signalled.
//! Callbacks therefore must not block and must not call back into the
//! connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{ModbusError, ModbusResult};
use crate::frame::MAX_ADU_SIZE;

/// Callback invoked for every inbound frame (`Ok`) or terminal read error
/// (`Err`). Returning `true` removes the receiver and signals its
/// completion.
pub type RxCallback = Box<dyn FnMut(Result<&[u8], &ModbusError>) -> bool + Send>;

struct Receiver {
    id: u64,
    callback: RxCallback,
    done: Option<oneshot::Sender<()>>,
}

/// Receiver list and write half, guarded together: holding the lock across
/// a full write keeps ADUs contiguous on the wire, and holding it across
/// the receiver walk makes removal atomic with broadcast.
struct Inner {
    writer: OwnedWriteHalf,
    receivers: VecDeque<Receiver>,
}

struct Shared {
    cancel: CancellationToken,
    next_receiver_id: AtomicU64,
    inner: Mutex<Inner>,
    reader: Mutex<OwnedReadHalf>,
    peer: String,
}

/// One bidirectional byte stream shared by many transactions.
///
/// The connection is *ready* from construction until [`close`](Self::close)
/// is called or the reader loop hits a terminal error; afterwards every
/// operation fails fast with [`ModbusError::Closed`]. Cloning is cheap and
/// shares the underlying stream.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        Self {
            shared: Arc::new(Shared {
                cancel: CancellationToken::new(),
                next_receiver_id: AtomicU64::new(0),
                inner: Mutex::new(Inner {
                    writer: write_half,
                    receivers: VecDeque::new(),
                }),
                reader: Mutex::new(read_half),
                peer,
            }),
        }
    }

    /// Whether the connection is still usable.
    pub fn ready(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    /// Tear the connection down. Idempotent: the first call wakes the reader
    /// loop, every registered receiver and any pending write; further calls
    /// have no effect.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Remote endpoint, for diagnostics.
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Write one ADU to the stream.
    ///
    /// Concurrent calls are serialized in arrival order and each ADU reaches
    /// the wire without interleaving. Returns [`ModbusError::Cancelled`]
    /// when `cancel` fires first and [`ModbusError::Closed`] when the
    /// connection tears down mid-write.
    pub async fn tx(&self, cancel: &CancellationToken, adu: &[u8]) -> ModbusResult<()> {
        if !self.ready() {
            return Err(ModbusError::Closed);
        }
        let mut inner = tokio::select! {
            guard = self.shared.inner.lock() => guard,
            _ = cancel.cancelled() => return Err(ModbusError::Cancelled),
            _ = self.shared.cancel.cancelled() => return Err(ModbusError::Closed),
        };
        tokio::select! {
            written = inner.writer.write_all(adu) => written.map_err(ModbusError::from),
            _ = cancel.cancelled() => Err(ModbusError::Cancelled),
            _ = self.shared.cancel.cancelled() => Err(ModbusError::Closed),
        }
    }

    /// Register `callback` at the head of the receiver list.
    ///
    /// The callback runs under the connection mutex for every inbound frame
    /// until it returns `true` or the connection closes. The returned
    /// [`Completion`] resolves once the receiver has been removed; waiting
    /// on it with a fired `cancel` removes the receiver exactly once even
    /// when racing a natural quit.
    pub async fn rx<F>(&self, cancel: &CancellationToken, callback: F) -> ModbusResult<Completion>
    where
        F: FnMut(Result<&[u8], &ModbusError>) -> bool + Send + 'static,
    {
        if !self.ready() {
            return Err(ModbusError::Closed);
        }
        let id = self.shared.next_receiver_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        let mut inner = self.shared.inner.lock().await;
        inner.receivers.push_front(Receiver {
            id,
            callback: Box::new(callback),
            done: Some(done_tx),
        });
        drop(inner);
        Ok(Completion {
            id,
            done: done_rx,
            cancel: cancel.clone(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Drive the reader loop until the connection terminates.
    ///
    /// Each successful read is broadcast to all registered receivers out of
    /// a private buffer; receivers that need the bytes past the callback
    /// must copy. The loop ends on the first read error or on
    /// [`close`](Self::close); the terminal error is delivered to every
    /// still-registered receiver before the cancel signal fires.
    ///
    /// The client spawns this as a background task; the server awaits it
    /// inline so the worker's lifetime brackets the connection's.
    pub async fn run(&self) -> ModbusResult<()> {
        let mut reader = self.shared.reader.lock().await;
        let mut buf = [0u8; MAX_ADU_SIZE];
        loop {
            let read = tokio::select! {
                _ = self.shared.cancel.cancelled() => Err(ModbusError::Closed),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => Err(ModbusError::io("connection closed by peer")),
                    Ok(n) => Ok(n),
                    Err(err) => Err(ModbusError::from(err)),
                },
            };
            match read {
                Ok(n) => self.broadcast(Ok(&buf[..n])).await,
                Err(err) => {
                    debug!("connection to {} terminated: {err}", self.shared.peer);
                    self.broadcast(Err(&err)).await;
                    self.shared.cancel.cancel();
                    let mut inner = self.shared.inner.lock().await;
                    let _ = inner.writer.shutdown().await;
                    return match err {
                        ModbusError::Closed => Ok(()),
                        other => Err(other),
                    };
                }
            }
        }
    }

    /// Offer one frame (or the terminal error) to every receiver, front to
    /// back, sweeping out those that quit.
    async fn broadcast(&self, frame: Result<&[u8], &ModbusError>) {
        let mut inner = self.shared.inner.lock().await;
        inner.receivers.retain_mut(|receiver| {
            let quit = (receiver.callback)(frame);
            if quit {
                if let Some(done) = receiver.done.take() {
                    let _ = done.send(());
                }
            }
            !quit
        });
    }
}

/// Handle for a registered receiver's removal.
///
/// Produced by [`Connection::rx`]; [`wait`](Self::wait) resolves when the
/// receiver quit naturally, when the registration's cancel token fired, or
/// when the connection closed, removing the receiver itself in the latter
/// two cases.
pub struct Completion {
    id: u64,
    done: oneshot::Receiver<()>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl Completion {
    pub async fn wait(mut self) {
        let cancelled = tokio::select! {
            _ = &mut self.done => false,
            _ = self.cancel.cancelled() => true,
            _ = self.shared.cancel.cancelled() => true,
        };
        if cancelled {
            self.remove().await;
        }
    }

    /// Remove the receiver if the broadcast walk has not already done so.
    /// The presence check under the lock makes removal exactly-once.
    async fn remove(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(pos) = inner.receivers.iter().position(|r| r.id == self.id) {
            if let Some(mut receiver) = inner.receivers.remove(pos) {
                if let Some(done) = receiver.done.take() {
                    let _ = done.send(());
                }
            }
        }
    }
}
