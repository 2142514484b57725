use hmccu_proto::Value;

/// One `(address, key, value)` change, the unit the publisher
/// broadcasts and the servant (C11) forwards as an `event(...)` RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub address: String,
    pub key: String,
    pub value: Value,
}

impl Event {
    pub fn new(address: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Event {
            address: address.into(),
            key: key.into(),
            value,
        }
    }
}
