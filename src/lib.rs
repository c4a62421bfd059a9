//! A multi-socket server core: one readiness-driven reactor
//! multiplexing TCP (IPv4/IPv6) and Unix-domain stream listeners —
//! filesystem and abstract-namespace alike — with per-endpoint protocol
//! handlers layered on top: an HTTP/1.1 keep-alive pipeline with
//! chunked transfer and Upgrade handoff, and a length-prefixed
//! log-record receiver drained by a single background writer.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! multisock = "0.1"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use multisock::http::{AppError, Environ, Response};
//! use multisock::{Address, MultiServer};
//!
//! let server = MultiServer::new().unwrap();
//!
//! // Any closure over the request environ works as an application.
//! let app = Arc::new(|environ: &Environ| -> Result<Response, AppError> {
//!     let who = environ.header("X-Name").unwrap_or("world");
//!     Ok(Response::new("200 OK").bytes(format!("hello, {}!", who)))
//! });
//!
//! // One HTTP endpoint on TCP, one log-record endpoint on a Unix
//! // socket, both served by the same reactor.
//! server
//!     .http_server(Address::inet("127.0.0.1", 8080), app)
//!     .unwrap();
//! server
//!     .log_server(Address::from_path("/tmp/records.sock").unwrap(), None)
//!     .unwrap();
//!
//! server.run(Duration::from_millis(500)).unwrap();
//! ```

#[macro_use]
mod sys;

mod addr;
mod executor;
mod poller;
mod queue;
mod reactor;
mod server;
mod socket;

pub mod http;
pub mod logging;
pub mod websocket;

pub use addr::{address_kind, Address, AddressKind};

pub use executor::{Executor, Inline, ThreadPerConnection};

pub use poller::{wait_readable, Poller};

pub use queue::BoundedQueue;

pub use reactor::{Handler, Reactor, RequestContext, DEFAULT_POLL_INTERVAL};

pub use server::{MultiServer, Server};

pub use socket::{AcceptedStreamSocket, Socket, StreamSocket};
