use tokio::sync::broadcast;

use hmccu_proto::Value;

use crate::event::Event;
use crate::param::Parameter;
use crate::paramset::{Paramset, ParamsetKey};

/// A channel's logical parent/index bookkeeping is filled in by the
/// owning device when the channel is appended (`AddChannel`), not by
/// the caller.
pub struct Channel {
    pub parent: String,
    pub parent_type: String,
    pub index: i32,
    pub address: String,
    pub type_: String,
    pub flags: i32,
    pub master: Paramset,
    pub values: Paramset,
}

impl Channel {
    pub fn new(type_: impl Into<String>) -> Self {
        Channel {
            parent: String::new(),
            parent_type: String::new(),
            index: 0,
            address: String::new(),
            type_: type_.into(),
            flags: 1,
            master: Paramset::new(ParamsetKey::Master),
            values: Paramset::new(ParamsetKey::Values),
        }
    }

    /// Attaches to VALUES and binds the publisher; writes emit events
    /// iff the publisher is bound (`AddChannel` on the owning device
    /// will re-bind it) and the parameter's Event bit is set.
    pub fn add_value_param(&mut self, param: Parameter) {
        self.values.add(param);
    }

    pub fn add_master_param(&mut self, param: Parameter) {
        self.master.add(param);
    }

    pub(crate) fn bind(&mut self, publisher: Option<broadcast::Sender<Event>>) {
        self.master.bind_all(&self.address, publisher.clone());
        self.values.bind_all(&self.address, publisher);
    }

    pub fn paramset(&self, key: ParamsetKey) -> &Paramset {
        match key {
            ParamsetKey::Master => &self.master,
            ParamsetKey::Values => &self.values,
        }
    }

    pub fn paramset_mut(&mut self, key: ParamsetKey) -> &mut Paramset {
        match key {
            ParamsetKey::Master => &mut self.master,
            ParamsetKey::Values => &mut self.values,
        }
    }

    pub fn description(&self) -> Value {
        Value::struct_from(vec![
            ("TYPE".to_string(), Value::String(self.type_.clone())),
            ("ADDRESS".to_string(), Value::String(self.address.clone())),
            ("PARENT".to_string(), Value::String(self.parent.clone())),
            ("PARENT_TYPE".to_string(), Value::String(self.parent_type.clone())),
            ("INDEX".to_string(), Value::Int(self.index)),
            (
                "PARAMSETS".to_string(),
                Value::Array(vec![
                    Value::String("MASTER".into()),
                    Value::String("VALUES".into()),
                ]),
            ),
            ("FLAGS".to_string(), Value::Int(self.flags)),
            ("VERSION".to_string(), Value::Int(1)),
            ("CHILDREN".to_string(), Value::Array(vec![])),
        ])
    }
}

/// A device owns an ordered list of channels and a MASTER paramset.
/// `flags`/`version` start at Visible/1 per `NewDevice`.
pub struct Device {
    pub address: String,
    pub type_: String,
    pub flags: i32,
    pub version: i32,
    pub rx_mode: i32,
    pub firmware: Option<String>,
    pub channels: Vec<Channel>,
    pub master: Paramset,
    publisher: Option<broadcast::Sender<Event>>,
}

impl Device {
    /// A device starts with paramsets = {MASTER}, flags = Visible,
    /// version = 1.
    pub fn new(
        address: impl Into<String>,
        type_: impl Into<String>,
        publisher: Option<broadcast::Sender<Event>>,
    ) -> Self {
        let address = address.into();
        let mut master = Paramset::new(ParamsetKey::Master);
        master.bind_all(&address, publisher.clone());

        Device {
            address,
            type_: type_.into(),
            flags: 1,
            version: 1,
            rx_mode: 0,
            firmware: None,
            channels: Vec::new(),
            master,
            publisher,
        }
    }

    /// Appends `channel`; completes its Parent/ParentType/Address/
    /// Index and binds it to the device's publisher.
    pub fn add_channel(&mut self, mut channel: Channel) {
        let index = self.channels.len() as i32;
        channel.parent = self.address.clone();
        channel.parent_type = self.type_.clone();
        channel.index = index;
        channel.address = format!("{}:{}", self.address, index);
        channel.bind(self.publisher.clone());
        self.channels.push(channel);
    }

    pub fn add_master_param(&mut self, param: Parameter) {
        self.master.add(param);
        self.master.bind_all(&self.address, self.publisher.clone());
    }

    pub fn channel(&self, addr: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.address == addr)
    }

    pub fn channel_mut(&mut self, addr: &str) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.address == addr)
    }

    pub fn description(&self) -> Value {
        Value::struct_from(vec![
            ("TYPE".to_string(), Value::String(self.type_.clone())),
            ("ADDRESS".to_string(), Value::String(self.address.clone())),
            ("PARENT".to_string(), Value::String(String::new())),
            ("PARENT_TYPE".to_string(), Value::String(String::new())),
            ("INDEX".to_string(), Value::Int(-1)),
            (
                "PARAMSETS".to_string(),
                Value::Array(vec![Value::String("MASTER".into())]),
            ),
            ("FLAGS".to_string(), Value::Int(self.flags)),
            ("RX_MODE".to_string(), Value::Int(self.rx_mode)),
            ("VERSION".to_string(), Value::Int(self.version)),
            (
                "CHILDREN".to_string(),
                Value::Array(self.channels.iter().map(|c| Value::String(c.address.clone())).collect()),
            ),
            (
                "FIRMWARE".to_string(),
                Value::String(self.firmware.clone().unwrap_or_default()),
            ),
        ])
    }

    /// Flattens the device and its channels into one list of
    /// descriptions, device first.
    pub fn flattened_descriptions(&self) -> Vec<Value> {
        let mut out = vec![self.description()];
        out.extend(self.channels.iter().map(Channel::description));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_channel_fills_in_parent_and_address() {
        let mut dev = Device::new("BidCoS-RF.ABC1234567", "HM-LC-SW1-SM", None);
        dev.add_channel(Channel::new("MAINTENANCE"));
        dev.add_channel(Channel::new("SWITCH"));

        assert_eq!(dev.channels[0].address, "BidCoS-RF.ABC1234567:0");
        assert_eq!(dev.channels[1].address, "BidCoS-RF.ABC1234567:1");
        assert_eq!(dev.channels[1].index, 1);
        assert_eq!(dev.channels[1].parent, dev.address);
        assert_eq!(dev.channels[1].parent_type, dev.type_);
    }

    #[test]
    fn flattened_descriptions_lists_device_then_channels() {
        let mut dev = Device::new("ABC1234567", "HM-LC-SW1-SM", None);
        dev.add_channel(Channel::new("SWITCH"));

        let descs = dev.flattened_descriptions();
        assert_eq!(descs.len(), 2);
        assert_eq!(
            descs[0].member("ADDRESS").unwrap(),
            &Value::String("ABC1234567".into())
        );
        assert_eq!(
            descs[1].member("ADDRESS").unwrap(),
            &Value::String("ABC1234567:0".into())
        );
    }
}
