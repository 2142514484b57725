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

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::Any;
use crate::{Error, Value};

static EMPTY: Value = Value::Empty;

/// A read-only traversal over a [`Value`] tree that accumulates at
/// most one error across an entire chain of `.key()`/`.index()`
/// calls.
///
/// Handlers that pull a dozen fields out of a request struct would
/// otherwise have to check a `Result` after every field access. With
/// `Query`, every accessor instead takes the first error it hits and
/// remembers it; later accessors on a `Query` that's already failed
/// become no-ops that return a harmless default, so the call site can
/// read every field it needs and check `.error()` exactly once at the
/// end.
#[derive(Clone)]
pub struct Query<'a> {
    value: &'a Value,
    err: Rc<RefCell<Option<Error>>>,
}

impl<'a> Query<'a> {
    pub fn new(value: &'a Value) -> Self {
        Query {
            value,
            err: Rc::new(RefCell::new(None)),
        }
    }

    fn child(&self, value: &'a Value) -> Self {
        Query {
            value,
            err: self.err.clone(),
        }
    }

    /// Records `e` as the query's error, but only if no error has
    /// been recorded yet (first error wins).
    fn fail(&self, e: Error) {
        let mut slot = self.err.borrow_mut();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    /// True once some accessor on this query (or an ancestor it was
    /// derived from) has failed.
    pub fn has_failed(&self) -> bool {
        self.err.borrow().is_some()
    }

    /// The first error recorded on this query, if any.
    pub fn error(&self) -> Option<Error> {
        self.err.borrow().clone()
    }

    /// Consumes the query, returning `value` if nothing failed or the
    /// recorded error otherwise.
    pub fn into_result<T>(self, value: T) -> Result<T, Error> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(value),
        }
    }

    pub fn value(&self) -> &'a Value {
        self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn is_not_empty(&self) -> bool {
        !self.is_empty()
    }

    /// Looks up a struct member by name. Missing members and type
    /// mismatches both set [`Error::NotFound`] / [`Error::UnexpectedType`]
    /// and return a query over [`Value::Empty`] rather than panicking,
    /// so chained calls remain valid (if useless) after a failure.
    pub fn key(&self, name: &str) -> Self {
        if self.has_failed() {
            return self.child(&EMPTY);
        }
        match self.value.member(name) {
            Some(v) => self.child(v),
            None => {
                self.fail(Error::NotFound(name.to_string()));
                self.child(&EMPTY)
            }
        }
    }

    /// Non-erroring lookup: returns `None` instead of failing the
    /// query when the member is absent, useful for genuinely optional
    /// fields.
    pub fn try_key(&self, name: &str) -> Option<Self> {
        self.value.member(name).map(|v| self.child(v))
    }

    /// Indexes into an array. Out-of-range or non-array values behave
    /// like [`Query::key`]'s failure path.
    pub fn index(&self, i: usize) -> Self {
        if self.has_failed() {
            return self.child(&EMPTY);
        }
        match self.value {
            Value::Array(items) => match items.get(i) {
                Some(v) => self.child(v),
                None => {
                    self.fail(Error::NotFound(format!("index {}", i)));
                    self.child(&EMPTY)
                }
            },
            _ => {
                self.fail(Error::UnexpectedType);
                self.child(&EMPTY)
            }
        }
    }

    /// The query's members as `(name, Query)` pairs, first-wins on
    /// duplicate names. Fails (and returns an empty vector) if the
    /// underlying value isn't a struct.
    pub fn map(&self) -> Vec<(String, Self)> {
        if self.has_failed() {
            return Vec::new();
        }
        match self.value {
            Value::Struct(members) => {
                let mut seen = std::collections::HashSet::new();
                members
                    .iter()
                    .filter(|(k, _)| seen.insert(k.clone()))
                    .map(|(k, v)| (k.clone(), self.child(v)))
                    .collect()
            }
            _ => {
                self.fail(Error::UnexpectedType);
                Vec::new()
            }
        }
    }

    /// The query's elements as child queries. Fails (and returns an
    /// empty vector) if the underlying value isn't an array.
    pub fn array(&self) -> Vec<Self> {
        if self.has_failed() {
            return Vec::new();
        }
        match self.value {
            Value::Array(items) => items.iter().map(|v| self.child(v)).collect(),
            _ => {
                self.fail(Error::UnexpectedType);
                Vec::new()
            }
        }
    }

    pub fn int(&self) -> i32 {
        if self.has_failed() {
            return 0;
        }
        match self.value.as_int() {
            Some(v) => v,
            None => {
                self.fail(Error::UnexpectedType);
                0
            }
        }
    }

    pub fn bool(&self) -> bool {
        if self.has_failed() {
            return false;
        }
        match self.value.as_bool() {
            Some(v) => v,
            None => {
                self.fail(Error::UnexpectedType);
                false
            }
        }
    }

    pub fn double(&self) -> f64 {
        if self.has_failed() {
            return 0.0;
        }
        match self.value.as_double() {
            Some(v) => v,
            None => {
                self.fail(Error::UnexpectedType);
                0.0
            }
        }
    }

    pub fn string(&self) -> String {
        if self.has_failed() {
            return String::new();
        }
        match self.value.as_str() {
            Some(v) => v.to_string(),
            None => {
                self.fail(Error::UnexpectedType);
                String::new()
            }
        }
    }

    /// A lossy decode to the widest native scalar type. Fails with
    /// [`Error::UnsupportedType`] for arrays and structs.
    pub fn any(&self) -> Any {
        if self.has_failed() {
            return Any::String(String::new());
        }
        match Any::try_from(self.value) {
            Ok(v) => v,
            Err(e) => {
                self.fail(e);
                Any::String(String::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::struct_from(vec![
            ("NAME".to_string(), Value::String("SW1".to_string())),
            ("VALUE".to_string(), Value::Int(42)),
            (
                "NESTED".to_string(),
                Value::struct_from(vec![("FLAG".to_string(), Value::Bool(true))]),
            ),
            (
                "LIST".to_string(),
                Value::Array(vec![Value::Int(1), Value::Int(2)]),
            ),
        ])
    }

    #[test]
    fn happy_path_chains_without_error() {
        let v = sample();
        let q = Query::new(&v);

        assert_eq!(q.key("NAME").string(), "SW1");
        assert_eq!(q.key("VALUE").int(), 42);
        assert!(q.key("NESTED").key("FLAG").bool());
        assert!(q.error().is_none());
    }

    #[test]
    fn first_error_sticks_through_later_calls() {
        let v = sample();
        let q = Query::new(&v);

        let missing = q.key("DOES_NOT_EXIST");
        assert_eq!(missing.string(), "");

        // A second failing accessor on a query derived from the same
        // root must not overwrite the first error.
        let first_err = missing.error();
        let _ = missing.key("ALSO_MISSING");
        assert_eq!(missing.error(), first_err);
    }

    #[test]
    fn type_mismatch_records_unexpected_type() {
        let v = sample();
        let q = Query::new(&v);

        let _ = q.key("NAME").int();
        assert_eq!(q.key("NAME").error(), Some(Error::UnexpectedType));
    }

    #[test]
    fn try_key_does_not_fail_the_query() {
        let v = sample();
        let q = Query::new(&v);

        assert!(q.try_key("NOPE").is_none());
        assert!(q.error().is_none());
    }

    #[test]
    fn array_indexing_and_out_of_range() {
        let v = sample();
        let q = Query::new(&v);
        let list = q.key("LIST");

        assert_eq!(list.index(0).int(), 1);
        assert_eq!(list.index(9).int(), 0);
        assert!(list.index(9).error().is_some());
    }

    #[test]
    fn any_rejects_aggregate_values() {
        let v = sample();
        let q = Query::new(&v);

        let _ = q.key("LIST").any();
        assert_eq!(q.key("LIST").error(), Some(Error::UnsupportedType));
    }
}
