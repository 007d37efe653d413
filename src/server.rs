//! Modbus slave.
//!
//! [`Server::serve`] accepts connections and hands every inbound frame to a
//! [`Handler`]. Each frame is copied out of the connection's broadcast
//! buffer and processed on its own task, so slow handlers do not stall the
//! reader and responses may leave in a different order than their requests
//! arrived; the transaction id carried over from each request keeps the
//! pairing intact.
//!
//! ```no_run
//! use std::sync::Arc;
//! use duplex_modbus::{Config, Mux, RegisterBank, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> duplex_modbus::ModbusResult<()> {
//! let bank = Arc::new(RegisterBank::new());
//! let server = Server::new(Config {
//!     endpoint: "127.0.0.1:502".to_string(),
//!     ..Default::default()
//! });
//! server
//!     .serve(&CancellationToken::new(), Arc::new(Mux::with_bank(bank)))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Exception, ModbusError, ModbusResult};
use crate::frame::{Framer, MAX_PDU_DATA_SIZE, MBAP_HEADER_SIZE};
use crate::handler::Handler;

/// Modbus slave serving MBAP over TCP.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the configured endpoint and serve until `cancel` fires.
    ///
    /// `handler` is invoked concurrently, once per inbound frame, and must
    /// be safe for that. Cancellation stops accepting immediately, then
    /// blocks until every open connection has drained its in-flight frames;
    /// the return value is [`ModbusError::Cancelled`].
    pub async fn serve(
        &self,
        cancel: &CancellationToken,
        handler: Arc<dyn Handler>,
    ) -> ModbusResult<()> {
        self.config.verify()?;
        let listener = self.config.listen().await?;
        self.serve_listener(cancel, listener, handler).await
    }

    /// Serve on an already-bound listener. Useful when the caller needs the
    /// local address before starting, e.g. after binding port 0.
    pub async fn serve_listener(
        &self,
        cancel: &CancellationToken,
        listener: TcpListener,
        handler: Arc<dyn Handler>,
    ) -> ModbusResult<()> {
        let framer = self.config.framer()?;
        if let Ok(addr) = listener.local_addr() {
            info!("modbus server listening on {addr}");
        }

        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        let cancel = cancel.clone();
                        let framer = Arc::clone(&framer);
                        let handler = Arc::clone(&handler);
                        workers.spawn(async move {
                            handle_connection(cancel, stream, framer, handler).await;
                        });
                    }
                    Err(err) => warn!("accept failed: {err}"),
                },
            }
        }

        // Stop accepting, then drain open connections before returning.
        drop(listener);
        while workers.join_next().await.is_some() {}
        Err(ModbusError::Cancelled)
    }
}

/// Per-connection worker: registers the copying receiver, drives the reader
/// loop inline, then waits for every spawned frame task before closing.
async fn handle_connection(
    cancel: CancellationToken,
    stream: TcpStream,
    framer: Arc<dyn Framer>,
    handler: Arc<dyn Handler>,
) {
    let connection = Connection::new(stream);
    let tasks: Arc<StdMutex<Vec<JoinHandle<()>>>> = Arc::new(StdMutex::new(Vec::new()));

    let callback = {
        let connection = connection.clone();
        let framer = Arc::clone(&framer);
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();
        let tasks = Arc::clone(&tasks);
        move |frame: Result<&[u8], &ModbusError>| -> bool {
            // The broadcast buffer is reused for the next read; copy before
            // leaving the callback.
            let adu = match frame {
                Ok(bytes) => bytes.to_vec(),
                Err(_) => return true,
            };
            let task = process_frame(
                cancel.clone(),
                connection.clone(),
                Arc::clone(&framer),
                Arc::clone(&handler),
                adu,
            );
            tasks.lock().unwrap().push(tokio::spawn(task));
            false
        }
    };

    let wait = match connection.rx(&cancel, callback).await {
        Ok(wait) => wait,
        Err(_) => return,
    };

    tokio::select! {
        _ = connection.run() => {}
        _ = cancel.cancelled() => connection.close(),
    }
    wait.wait().await;

    let pending: Vec<_> = tasks.lock().unwrap().drain(..).collect();
    for task in pending {
        let _ = task.await;
    }
    connection.close();
    debug!("connection from {} drained", connection.peer());
}

/// Handle one copied frame: decode, dispatch, shape the reply, send it.
async fn process_frame(
    cancel: CancellationToken,
    connection: Connection,
    framer: Arc<dyn Framer>,
    handler: Arc<dyn Handler>,
    adu: Vec<u8>,
) {
    if adu.len() < MBAP_HEADER_SIZE + 1 {
        debug!("dropping short frame of {} bytes", adu.len());
        return;
    }
    let uid = adu[6];
    let fc = adu[7];

    let (code, payload) = if fc & 0x80 != 0 {
        // A request cannot carry the exception flag.
        (fc, vec![Exception::IllegalFunction.code()])
    } else {
        let body = match framer.decode(&adu) {
            Ok((_, _, body)) => body,
            Err(err) => {
                debug!("dropping malformed frame: {err}");
                return;
            }
        };
        match handler.handle(&cancel, fc, body).await {
            Err(exception) => (fc | 0x80, vec![exception.code()]),
            Ok(res) if res.len() > MAX_PDU_DATA_SIZE => {
                warn!("handler response of {} bytes exceeds the PDU limit", res.len());
                (fc | 0x80, vec![Exception::SlaveDeviceFailure.code()])
            }
            Ok(res) => (fc, res),
        }
    };

    let response = match framer.reply(uid, code, &payload, &adu) {
        Ok(response) => response,
        Err(err) => {
            warn!("failed to frame response: {err}");
            return;
        }
    };
    // A failed write is logged only; the connection terminates on its own.
    if let Err(err) = connection.tx(&cancel, &response).await {
        debug!("response write to {} failed: {err}", connection.peer());
    }
}
