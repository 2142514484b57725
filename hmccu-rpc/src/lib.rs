//! The dispatch core and both server fronts (HTTP for the XML
//! dialect, TCP for BIN-RPC), plus the client-side callers used to
//! reach a Controller interface process.

pub mod client;
pub mod dispatch;
pub mod http_front;
pub mod tcp_front;

pub use client::{BinClient, Caller, RetryingCaller, XmlClient};
pub use dispatch::{Dispatcher, Handler};
pub use http_front::HttpFront;
pub use tcp_front::TcpFront;
