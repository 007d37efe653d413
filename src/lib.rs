//! # Duplex Modbus - Multiplexed Modbus TCP Client/Server Library
//!
//! A Modbus application protocol implementation over Modbus/TCP providing
//! both master and slave roles on one shared substrate. The distinguishing
//! piece is the connection multiplex: many transactions share a single
//! full-duplex socket, responses are paired to requests by transaction id
//! rather than by arrival order, and every blocking operation is cancellable
//! through a [`CancellationToken`](tokio_util::sync::CancellationToken).
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | yes | yes |
//! | 0x02 | Read Discrete Inputs | yes | yes |
//! | 0x03 | Read Holding Registers | yes | yes |
//! | 0x04 | Read Input Registers | yes | yes |
//! | 0x05 | Write Single Coil | yes | yes |
//! | 0x06 | Write Single Register | yes | yes |
//! | 0x0F | Write Multiple Coils | yes | yes |
//! | 0x10 | Write Multiple Registers | yes | yes |
//! | 0x17 | Read/Write Multiple Registers | yes | yes |
//!
//! Raw function codes outside this table are available through
//! [`Client::request`] on the master side and [`Mux`] fallbacks (or a custom
//! [`Handler`]) on the slave side.
//!
//! ## Client Example
//!
//! ```rust,no_run
//! use duplex_modbus::{Client, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> duplex_modbus::ModbusResult<()> {
//!     let client = Client::new(Config {
//!         endpoint: "127.0.0.1:502".to_string(),
//!         unit_id: 1,
//!         ..Default::default()
//!     });
//!     let cancel = CancellationToken::new();
//!
//!     let values = client.read_holding_registers(&cancel, 100, 10).await?;
//!     println!("registers: {values:?}");
//!
//!     client.write_single_register(&cancel, 100, 0x1234).await?;
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Server Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use duplex_modbus::{Config, Mux, RegisterBank, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> duplex_modbus::ModbusResult<()> {
//!     let bank = Arc::new(RegisterBank::new());
//!     bank.write_registers(100, &[1, 2, 3]).ok();
//!
//!     let server = Server::new(Config {
//!         endpoint: "127.0.0.1:502".to_string(),
//!         ..Default::default()
//!     });
//!     let cancel = CancellationToken::new();
//!     server.serve(&cancel, Arc::new(Mux::with_bank(bank))).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  Client::request x N          Server::serve
//!        │                           │
//!  ┌───────────────┐          ┌───────────────┐
//!  │  transaction  │          │   dispatch    │
//!  │    engine     │          │ engine + Mux  │
//!  └───────────────┘          └───────────────┘
//!        │ rx/tx                    │ rx/tx
//!  ┌───────────────┐          ┌───────────────┐
//!  │  Connection   │◄────────►│  Connection   │
//!  │  (fan-out)    │   MBAP   │  (fan-out)    │
//!  └───────────────┘          └───────────────┘
//! ```
//!
//! The connection broadcasts every inbound frame to all registered
//! receivers; on the client side each pending request owns one receiver and
//! claims exactly the response carrying its transaction id, which is what
//! makes out-of-order response delivery safe.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod register_bank;
pub mod server;

pub use client::Client;
pub use config::Config;
pub use connection::{Completion, Connection, RxCallback};
pub use error::{Exception, ModbusError, ModbusResult};
pub use frame::{Framer, TcpFramer, MAX_ADU_SIZE, MAX_PDU_DATA_SIZE, MBAP_HEADER_SIZE};
pub use handler::{Handler, Mux};
pub use register_bank::RegisterBank;
pub use server::Server;

/// Maximum number of coils in a single read request.
pub const MAX_COILS_PER_READ: u16 = 2000;

/// Maximum number of registers in a single read request.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Maximum number of coils in a single write request.
pub const MAX_COILS_PER_WRITE: u16 = 1968;

/// Maximum number of registers in a single write request.
pub const MAX_REGISTERS_PER_WRITE: u16 = 123;

/// Maximum number of registers written by a read/write request.
pub const MAX_REGISTERS_PER_READ_WRITE: u16 = 121;

/// Modbus TCP default port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
