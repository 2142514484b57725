use std::sync::Arc;

use tokio::sync::broadcast;

use hmccu_proto::{Error, Result, Value};

use crate::event::Event;
use crate::flags::{OperationFlags, PresentationFlags};
use crate::kind::Kind;

/// A predicate consulted by `SetValue` before a checked write is
/// accepted. Returning `false` fails the write with `UnexpectedType`.
pub type Guard = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// The self-describing half of a [`Parameter`]: everything
/// `getParamsetDescription` reports about it.
#[derive(Clone)]
pub struct ParamDescription {
    pub id: String,
    pub kind: Kind,
    pub operations: OperationFlags,
    pub presentation: PresentationFlags,
    pub default: Value,
    pub min: Value,
    pub max: Value,
    pub unit: Option<String>,
    pub control: Option<String>,
    pub special: Option<Vec<(String, Value)>>,
    pub value_list: Option<Vec<String>>,
    pub tab_order: i32,
}

impl ParamDescription {
    pub fn new(id: impl Into<String>, kind: Kind, operations: OperationFlags) -> Self {
        ParamDescription {
            id: id.into(),
            kind,
            operations,
            presentation: PresentationFlags::VISIBLE,
            default: Value::Empty,
            min: Value::Empty,
            max: Value::Empty,
            unit: None,
            control: None,
            special: None,
            value_list: None,
            tab_order: 0,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut fields = vec![
            ("TYPE".to_string(), Value::String(self.kind.as_str().into())),
            ("OPERATIONS".to_string(), Value::Int(self.operations.bits())),
            ("FLAGS".to_string(), Value::Int(self.presentation.bits())),
            ("DEFAULT".to_string(), self.default.clone()),
            ("MIN".to_string(), self.min.clone()),
            ("MAX".to_string(), self.max.clone()),
            ("TAB_ORDER".to_string(), Value::Int(self.tab_order)),
            ("ID".to_string(), Value::String(self.id.clone())),
        ];

        if let Some(unit) = &self.unit {
            fields.push(("UNIT".to_string(), Value::String(unit.clone())));
        }
        if let Some(control) = &self.control {
            fields.push(("CONTROL".to_string(), Value::String(control.clone())));
        }
        if let Some(special) = &self.special {
            fields.push((
                "SPECIAL".to_string(),
                Value::Array(
                    special
                        .iter()
                        .map(|(id, v)| {
                            Value::struct_from(vec![
                                ("ID".to_string(), Value::String(id.clone())),
                                ("VALUE".to_string(), v.clone()),
                            ])
                        })
                        .collect(),
                ),
            ));
        }
        if let Some(value_list) = &self.value_list {
            fields.push((
                "VALUE_LIST".to_string(),
                Value::Array(value_list.iter().cloned().map(Value::String).collect()),
            ));
        }

        Value::struct_from(fields)
    }
}

/// One parameter within a paramset: its description plus the current
/// value, an optional write guard, and the publisher it forwards
/// events to (bound in when the owning paramset is attached to a
/// device or channel).
#[derive(Clone)]
pub struct Parameter {
    pub desc: ParamDescription,
    value: Value,
    guard: Option<Guard>,
    publisher: Option<broadcast::Sender<Event>>,
    owner_address: String,
}

impl Parameter {
    pub fn new(desc: ParamDescription, initial: Value) -> Self {
        Parameter {
            desc,
            value: initial,
            guard: None,
            publisher: None,
            owner_address: String::new(),
        }
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub(crate) fn bind(&mut self, owner_address: String, publisher: Option<broadcast::Sender<Event>>) {
        self.owner_address = owner_address;
        self.publisher = publisher;
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Checked write: rejects if the Write bit is clear, if `v`
    /// doesn't match the declared kind, or if the guard predicate
    /// rejects it. On success stores and publishes (iff a publisher
    /// is bound and the Event bit is set).
    pub fn set_value(&mut self, v: Value) -> Result<()> {
        if !self.desc.operations.write {
            return Err(Error::UnsupportedType);
        }
        if !self.desc.kind.matches(&v) {
            return Err(Error::UnexpectedType);
        }
        if let Some(guard) = &self.guard {
            if !guard(&v) {
                return Err(Error::UnexpectedType);
            }
        }
        self.store_and_publish(v);
        Ok(())
    }

    /// Unchecked write used by device-internal logic: stores and
    /// publishes without consulting the guard predicate (still
    /// respects the Event bit for publication).
    pub fn internal_set_value(&mut self, v: Value) {
        self.store_and_publish(v);
    }

    fn store_and_publish(&mut self, v: Value) {
        self.value = v.clone();
        if self.desc.operations.event {
            if let Some(tx) = &self.publisher {
                let _ = tx.send(Event::new(self.owner_address.clone(), self.desc.id.clone(), v));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(kind: Kind, ops: OperationFlags) -> Parameter {
        Parameter::new(ParamDescription::new("LEVEL", kind, ops), Value::Double(0.0))
    }

    #[test]
    fn write_without_write_bit_fails() {
        let mut p = param(Kind::Float, OperationFlags::READ_EVENT);
        assert_eq!(p.set_value(Value::Double(1.0)), Err(Error::UnsupportedType));
    }

    #[test]
    fn write_with_wrong_kind_fails() {
        let mut p = param(Kind::Float, OperationFlags::READ_WRITE_EVENT);
        assert_eq!(p.set_value(Value::Bool(true)), Err(Error::UnexpectedType));
    }

    #[test]
    fn guard_rejects_out_of_range_write() {
        let mut p = param(Kind::Float, OperationFlags::READ_WRITE_EVENT)
            .with_guard(Arc::new(|v: &Value| matches!(v, Value::Double(d) if *d <= 100.0)));
        assert!(p.set_value(Value::Double(50.0)).is_ok());
        assert_eq!(p.set_value(Value::Double(200.0)), Err(Error::UnexpectedType));
    }

    #[test]
    fn set_value_publishes_when_event_bit_set_and_publisher_bound() {
        let mut p = param(Kind::Float, OperationFlags::READ_WRITE_EVENT);
        let (tx, mut rx) = broadcast::channel(4);
        p.bind("dev:1".into(), Some(tx));

        p.set_value(Value::Double(42.0)).unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.address, "dev:1");
        assert_eq!(ev.key, "LEVEL");
        assert_eq!(ev.value, Value::Double(42.0));
    }

    #[test]
    fn internal_set_value_bypasses_guard() {
        let mut p = param(Kind::Float, OperationFlags::READ_WRITE_EVENT)
            .with_guard(Arc::new(|_: &Value| false));
        p.internal_set_value(Value::Double(9.0));
        assert_eq!(*p.value(), Value::Double(9.0));
    }

    #[test]
    fn string_write_accepts_arbitrary_utf8() {
        let mut p = Parameter::new(
            ParamDescription::new("NAME", Kind::String, OperationFlags::READ_WRITE_EVENT),
            Value::String(String::new()),
        );
        let non_ascii = Value::String(String::from_utf8(vec![0xC3, 0xA9]).unwrap());
        p.set_value(non_ascii.clone()).unwrap();
        assert_eq!(*p.value(), non_ascii);
    }
}
