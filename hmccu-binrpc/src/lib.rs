//! BIN-RPC: the Controller's proprietary binary framing of the same
//! value tree the XML dialect carries. Big-endian throughout, with a
//! non-IEEE floating point encoding that trades dynamic range for a
//! scaled fixed-point mantissa.

mod double;

pub mod codec;

pub use codec::{decode_message, encode_fault, encode_request, encode_response, Message};

/// Default cap on a decoded message's payload size.
pub const DEFAULT_MAX_SIZE: usize = 2 * 1024 * 1024;

/// Length, in bytes, of the fixed header every BIN-RPC message opens
/// with: `"Bin"` + message-type byte + `u32` payload length.
pub const HEADER_LEN: usize = 8;
