// Copyright (c) 2020-2021, Richard M Neswold, Jr.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
//    notice, this list of conditions and the following disclaimer in the
//    documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its
//    contributors may be used to endorse or promote products derived
//    from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::fmt;

/// Errors that can occur anywhere in the RPC stack: while decoding a
/// wire message, while dispatching a method call, or while the device
/// layer services a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The wire payload didn't parse as a well-formed document
    /// (truncated XML, bad binary framing, unbalanced tags, ...).
    Malformed(String),

    /// A value was found where a different type was expected (e.g. a
    /// `<struct>` where an `<int>` was required).
    UnexpectedType,

    /// A message exceeded the configured size limit.
    OverSize,

    /// An I/O error occurred on the underlying socket.
    IO(String),

    /// The remote end (or a local handler) reported an RPC fault.
    MethodError { code: i32, message: String },

    /// A device or channel address was registered twice.
    DuplicateAddress(String),

    /// A lookup (device, channel, parameter, interface) came up empty.
    NotFound(String),

    /// A paramset key wasn't one of `MASTER` or `VALUES`.
    BadParamsetKey(String),

    /// A string contained a byte the legacy wire format can't carry.
    NonAscii,

    /// An operation was attempted on a value type it doesn't support
    /// (e.g. widening an array to a scalar).
    UnsupportedType,

    /// The daemon's configuration file was missing or invalid.
    ConfigError(String),

    /// A daemon-level operation failed outside of a single RPC.
    OperationError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Malformed(s) => write!(f, "malformed message: {}", s),
            Error::UnexpectedType => write!(f, "value has an unexpected type"),
            Error::OverSize => write!(f, "message exceeds size limit"),
            Error::IO(s) => write!(f, "I/O error: {}", s),
            Error::MethodError { code, message } => {
                write!(f, "method error {}: {}", code, message)
            }
            Error::DuplicateAddress(s) => write!(f, "duplicate address: {}", s),
            Error::NotFound(s) => write!(f, "not found: {}", s),
            Error::BadParamsetKey(s) => write!(f, "unknown paramset key: {}", s),
            Error::NonAscii => write!(f, "string contains unsupported byte"),
            Error::UnsupportedType => write!(f, "unsupported value type for this operation"),
            Error::ConfigError(s) => write!(f, "configuration error: {}", s),
            Error::OperationError(s) => write!(f, "operation error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IO(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::OperationError(format!("channel closed: {}", e))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::OperationError(format!("reply channel closed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_error_formats_code_and_message() {
        let e = Error::MethodError {
            code: -1,
            message: "boom".into(),
        };

        assert_eq!(e.to_string(), "method error -1: boom");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e: Error = io.into();

        assert!(matches!(e, Error::IO(_)));
    }
}
