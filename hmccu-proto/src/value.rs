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

use crate::Error;

/// The tagged tree every wire message is decoded into and encoded
/// from. Both the XML and binary dialects map onto this same shape;
/// neither dialect's quirks leak past their own codec crate.
///
/// `Struct` keeps members in the order they were built and resolves
/// duplicate names first-wins, matching the Controller's own behavior
/// when it emits a member more than once.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Empty,
    Int(i32),
    Bool(bool),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),

    /// An XML-RPC `<dateTime.iso8601>` or binary `DATE_TIME` value.
    /// Parsed and carried along verbatim; this crate never interprets
    /// it.
    DateTime(String),

    /// An XML-RPC `<base64>` value. Carried as decoded bytes but
    /// otherwise uninterpreted.
    Base64(Vec<u8>),
}

impl Value {
    /// Builds a `Struct` from an iterator of members, preserving
    /// order.
    pub fn struct_from(members: impl IntoIterator<Item = (String, Value)>) -> Value {
        Value::Struct(members.into_iter().collect())
    }

    /// Looks up a member of a `Struct` by name, first-wins on
    /// duplicates. Returns `None` for any other variant.
    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(members) => members.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty) || matches!(self, Value::String(s) if s.is_empty())
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Struct(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => write!(f, ""),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::Array(v) => {
                write!(f, "[")?;
                for (i, e) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
            Value::Struct(v) => {
                write!(f, "{{")?;
                for (i, (k, e)) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, e)?;
                }
                write!(f, "}}")
            }
            Value::DateTime(v) => write!(f, "{}", v),
            Value::Base64(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// A value being *built* for the wire. Conversion into [`Value`] from
/// `Dynamic` is total: every variant has an unambiguous `Value`
/// representation, so callers constructing a method call or response
/// never have to handle a conversion failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Dynamic {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Dynamic>),
    Map(Vec<(String, Dynamic)>),
}

impl From<Dynamic> for Value {
    fn from(d: Dynamic) -> Self {
        match d {
            Dynamic::Bool(v) => Value::Bool(v),
            Dynamic::Int(v) => Value::Int(v as i32),
            Dynamic::Double(v) => Value::Double(v),
            Dynamic::String(v) => Value::String(v),
            Dynamic::Array(v) => Value::Array(v.into_iter().map(Value::from).collect()),
            Dynamic::Map(v) => {
                Value::Struct(v.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Dynamic {
    fn from(v: bool) -> Self {
        Dynamic::Bool(v)
    }
}

impl From<i32> for Dynamic {
    fn from(v: i32) -> Self {
        Dynamic::Int(v as i64)
    }
}

impl From<i64> for Dynamic {
    fn from(v: i64) -> Self {
        Dynamic::Int(v)
    }
}

impl From<f64> for Dynamic {
    fn from(v: f64) -> Self {
        Dynamic::Double(v)
    }
}

impl From<&str> for Dynamic {
    fn from(v: &str) -> Self {
        Dynamic::String(v.to_string())
    }
}

impl From<String> for Dynamic {
    fn from(v: String) -> Self {
        Dynamic::String(v)
    }
}

/// The widest-native-scalar view of a value, produced by
/// [`crate::Query::any`]. Conversion is lossy by design (an `Int` and
/// a `Double` both collapse to the caller's chosen numeric type) but
/// it is not total: arrays and structs have no scalar representation
/// and are reported as [`Error::UnsupportedType`] instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Any {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl TryFrom<&Value> for Any {
    type Error = Error;

    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        match v {
            Value::Bool(v) => Ok(Any::Bool(*v)),
            Value::Int(v) => Ok(Any::Int(*v as i64)),
            Value::Double(v) => Ok(Any::Double(*v)),
            Value::String(v) => Ok(Any::String(v.clone())),
            Value::DateTime(v) => Ok(Any::String(v.clone())),
            Value::Empty => Ok(Any::String(String::new())),
            Value::Array(_) | Value::Struct(_) | Value::Base64(_) => Err(Error::UnsupportedType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_member_lookup_is_first_wins() {
        let v = Value::Struct(vec![
            ("NAME".into(), Value::String("first".into())),
            ("NAME".into(), Value::String("second".into())),
        ]);

        assert_eq!(v.member("NAME"), Some(&Value::String("first".into())));
        assert_eq!(v.member("MISSING"), None);
    }

    #[test]
    fn empty_value_and_empty_string_are_both_empty() {
        assert!(Value::Empty.is_empty());
        assert!(Value::String(String::new()).is_empty());
        assert!(!Value::String("x".into()).is_empty());
    }

    #[test]
    fn dynamic_conversion_is_total() {
        let d = Dynamic::Map(vec![
            ("a".into(), Dynamic::Int(1)),
            ("b".into(), Dynamic::Array(vec![Dynamic::Bool(true)])),
        ]);
        let v: Value = d.into();

        assert_eq!(v.member("a"), Some(&Value::Int(1)));
        assert_eq!(
            v.member("b"),
            Some(&Value::Array(vec![Value::Bool(true)]))
        );
    }

    #[test]
    fn any_rejects_arrays_and_structs() {
        assert!(Any::try_from(&Value::Array(vec![])).is_err());
        assert!(Any::try_from(&Value::Struct(vec![])).is_err());
        assert_eq!(Any::try_from(&Value::Int(5)).unwrap(), Any::Int(5));
    }
}
