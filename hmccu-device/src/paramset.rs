use tokio::sync::broadcast;

use hmccu_proto::{Error, Query, Result, Value};

use crate::event::Event;
use crate::param::Parameter;

/// The standard paramset keys. A device exposes only `Master`; a
/// channel exposes both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamsetKey {
    Master,
    Values,
}

impl ParamsetKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamsetKey::Master => "MASTER",
            ParamsetKey::Values => "VALUES",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "MASTER" => Ok(ParamsetKey::Master),
            "VALUES" => Ok(ParamsetKey::Values),
            other => Err(Error::BadParamsetKey(other.to_string())),
        }
    }
}

/// Ordered name -> [`Parameter`] map plus an optional callback fired
/// once after a bulk write via [`Paramset::put`].
pub struct Paramset {
    key: ParamsetKey,
    params: Vec<(String, Parameter)>,
    put_notifier: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Paramset {
    pub fn new(key: ParamsetKey) -> Self {
        Paramset {
            key,
            params: Vec::new(),
            put_notifier: None,
        }
    }

    pub fn key(&self) -> ParamsetKey {
        self.key
    }

    pub fn set_put_notifier(&mut self, f: Box<dyn Fn() + Send + Sync>) {
        self.put_notifier = Some(f);
    }

    /// Attaches `param`, assigning its `tab_order` as its ordinal
    /// within the set.
    pub fn add(&mut self, mut param: Parameter) {
        param.desc.tab_order = self.params.len() as i32;
        self.params.push((param.desc.id.clone(), param));
    }

    pub(crate) fn bind_all(&mut self, owner_address: &str, publisher: Option<broadcast::Sender<Event>>) {
        for (_, p) in &mut self.params {
            p.bind(owner_address.to_string(), publisher.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn description_value(&self) -> Value {
        Value::struct_from(self.params.iter().map(|(n, p)| (n.clone(), p.desc.to_value())).collect())
    }

    pub fn value_value(&self) -> Value {
        Value::struct_from(self.params.iter().map(|(n, p)| (n.clone(), p.value().clone())).collect())
    }

    /// Bulk write: applies every member of `values` as a checked
    /// write, then fires the put-notifier once, after the whole
    /// write succeeds.
    pub fn put(&mut self, values: &Value) -> Result<()> {
        let q = Query::new(values);
        let members = q.map();
        if let Some(e) = q.error() {
            return Err(e);
        }

        for (name, member) in &members {
            let param = self.get_mut(name).ok_or_else(|| Error::NotFound(name.clone()))?;
            param.set_value(member.value().clone())?;
        }

        if let Some(notifier) = &self.put_notifier {
            notifier();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::OperationFlags;
    use crate::kind::Kind;
    use crate::param::ParamDescription;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn make(name: &str) -> Parameter {
        Parameter::new(
            ParamDescription::new(name, Kind::Float, OperationFlags::READ_WRITE_EVENT),
            Value::Double(0.0),
        )
    }

    #[test]
    fn add_assigns_ordinal_tab_order() {
        let mut ps = Paramset::new(ParamsetKey::Values);
        ps.add(make("A"));
        ps.add(make("B"));
        assert_eq!(ps.get("A").unwrap().desc.tab_order, 0);
        assert_eq!(ps.get("B").unwrap().desc.tab_order, 1);
    }

    #[test]
    fn put_applies_all_then_fires_notifier_once() {
        let mut ps = Paramset::new(ParamsetKey::Values);
        ps.add(make("A"));
        ps.add(make("B"));

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        ps.set_put_notifier(Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        let values = Value::struct_from(vec![
            ("A".to_string(), Value::Double(1.0)),
            ("B".to_string(), Value::Double(2.0)),
        ]);
        ps.put(&values).unwrap();

        assert_eq!(*ps.get("A").unwrap().value(), Value::Double(1.0));
        assert_eq!(*ps.get("B").unwrap().value(), Value::Double(2.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn put_with_unknown_member_fails_without_partial_commit_through_notifier() {
        let mut ps = Paramset::new(ParamsetKey::Values);
        ps.add(make("A"));

        let values = Value::struct_from(vec![("NOPE".to_string(), Value::Double(1.0))]);
        assert!(ps.put(&values).is_err());
    }

    #[test]
    fn paramset_key_parses_and_rejects_unknown() {
        assert_eq!(ParamsetKey::parse("MASTER").unwrap(), ParamsetKey::Master);
        assert!(ParamsetKey::parse("LINK").is_err());
    }
}
