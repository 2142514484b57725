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

use crate::Error;

/// The shape a method call's failure takes on the wire: a numeric
/// code plus a human-readable message, carried in both wire dialects
/// as a `faultCode`/`faultString` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl Fault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Fault {
            code,
            message: message.into(),
        }
    }
}

impl From<&Error> for Fault {
    /// Shapes any crate error into a fault. A handler-raised
    /// [`Error::MethodError`] carries its own code through; every
    /// other error kind is reported with code -1, matching the
    /// Controller's convention for "generic internal error".
    fn from(e: &Error) -> Self {
        match e {
            Error::MethodError { code, message } => Fault::new(*code, message.clone()),
            other => Fault::new(-1, other.to_string()),
        }
    }
}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        Fault::from(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_error_keeps_its_code() {
        let e = Error::MethodError {
            code: 42,
            message: "bad params".into(),
        };
        let f: Fault = e.into();

        assert_eq!(f.code, 42);
        assert_eq!(f.message, "bad params");
    }

    #[test]
    fn other_errors_get_code_minus_one() {
        let f: Fault = Error::NotFound("ABC:1".into()).into();

        assert_eq!(f.code, -1);
    }
}
