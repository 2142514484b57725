use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use hmccu_proto::{Error, Query, Result, Value};
use hmccu_rpc::Handler;

use crate::container::Container;
use crate::event::Event;
use crate::paramset::ParamsetKey;

/// Notified when a logic layer registers or deregisters through
/// `init`. The servant/registered-client machinery (not part of this
/// crate) implements this to look up or spin down its worker.
pub trait RegistrationSink: Send + Sync {
    fn register(&self, receiver_address: &str, interface_id: &str);
    fn deregister(&self, receiver_address: &str);
}

/// A `RegistrationSink` that drops registrations on the floor; useful
/// for tests and for a device-only deployment with no logic layer.
pub struct NullRegistrationSink;

impl RegistrationSink for NullRegistrationSink {
    fn register(&self, _receiver_address: &str, _interface_id: &str) {}
    fn deregister(&self, _receiver_address: &str) {}
}

/// Implements the server-side contract the Controller's logic layer
/// queries over a [`Container`].
pub struct DeviceHandler {
    container: Arc<Container>,
    sink: Arc<dyn RegistrationSink>,
    remote_mode: bool,
    controller_host: String,
}

impl DeviceHandler {
    pub fn new(container: Arc<Container>, sink: Arc<dyn RegistrationSink>) -> Self {
        DeviceHandler {
            container,
            sink,
            remote_mode: false,
            controller_host: String::new(),
        }
    }

    /// "Remote mode" means this process is not running on the
    /// Controller itself, so the well-known loopback aliases the
    /// Controller hands out must be rewritten to reach it over the
    /// network.
    pub fn with_remote_mode(mut self, controller_host: impl Into<String>) -> Self {
        self.remote_mode = true;
        self.controller_host = controller_host.into();
        self
    }

    fn substitute_address(&self, url: &str) -> String {
        if self.remote_mode {
            if let Some(rest) = url.strip_prefix("xmlrpc_bin://127.0.0.1:31999") {
                return format!("{}:1999{}", self.controller_host, rest);
            }
            if let Some(rest) = url.strip_prefix("http://127.0.0.1:39292") {
                return format!("{}:9292{}", self.controller_host, rest);
            }
        }
        strip_scheme(url)
    }

    async fn init(&self, params: &Value) -> Result<Value> {
        let args = params.as_array().unwrap_or(&[]);
        let url = args.first().and_then(Value::as_str).ok_or(Error::UnexpectedType)?;

        match args.get(1).and_then(Value::as_str) {
            Some(id) => {
                let advertised = self.substitute_address(url);
                self.sink.register(&advertised, id);
            }
            None => self.sink.deregister(url),
        }
        Ok(Value::Empty)
    }

    async fn list_devices(&self) -> Result<Value> {
        let mut out = Vec::new();
        for address in self.container.addresses().await {
            self.container
                .with_device(&address, |d| {
                    out.extend(d.flattened_descriptions());
                    Ok(())
                })
                .await?;
        }
        Ok(Value::Array(out))
    }

    async fn delete_device(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let addr = q.index(0).string();
        if let Some(e) = q.error() {
            return Err(e);
        }
        if addr.contains(':') {
            debug!(%addr, "ignoring deleteDevice on a channel address");
            return Ok(Value::Empty);
        }
        self.container.remove_device(&addr).await?;
        Ok(Value::Empty)
    }

    async fn get_device_description(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let addr = q.index(0).string();
        if let Some(e) = q.error() {
            return Err(e);
        }

        let (device_addr, channel_addr) = split_address(&addr);
        self.container
            .with_device(&device_addr, |d| match &channel_addr {
                None => Ok(d.description()),
                Some(_) => d
                    .channel(&addr)
                    .map(|c| c.description())
                    .ok_or_else(|| Error::NotFound(addr.clone())),
            })
            .await
    }

    async fn get_paramset_description(&self, params: &Value) -> Result<Value> {
        let (addr, key) = addr_and_key(params)?;
        let (device_addr, _) = split_address(&addr);
        self.container
            .with_device(&device_addr, |d| paramset_for(d, &addr, key).map(|ps| ps.description_value()))
            .await
    }

    async fn get_paramset(&self, params: &Value) -> Result<Value> {
        let (addr, key) = addr_and_key(params)?;
        let (device_addr, _) = split_address(&addr);
        self.container
            .with_device(&device_addr, |d| paramset_for(d, &addr, key).map(|ps| ps.value_value()))
            .await
    }

    async fn put_paramset(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let addr = q.index(0).string();
        let key_str = q.index(1).string();
        let values = q.index(2).value().clone();
        if let Some(e) = q.error() {
            return Err(e);
        }
        let values = sanitize_value(values)?;
        let key = ParamsetKey::parse(&key_str)?;

        let (device_addr, _) = split_address(&addr);
        self.container
            .with_device_mut(&device_addr, |d| {
                paramset_for_mut(d, &addr, key)?.put(&values)?;
                Ok(Value::Empty)
            })
            .await
    }

    async fn get_value(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let addr = q.index(0).string();
        let name = q.index(1).string();
        if let Some(e) = q.error() {
            return Err(e);
        }

        let (device_addr, channel_addr) = split_address(&addr);
        self.container
            .with_device(&device_addr, |d| {
                let paramset = match &channel_addr {
                    Some(_) => d.channel(&addr).map(|c| &c.values).ok_or_else(|| Error::NotFound(addr.clone()))?,
                    None => &d.master,
                };
                paramset
                    .get(&name)
                    .map(|p| p.value().clone())
                    .ok_or_else(|| Error::NotFound(name.clone()))
            })
            .await
    }

    async fn set_value(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let addr = q.index(0).string();
        let name = q.index(1).string();
        let value = q.index(2).value().clone();
        if let Some(e) = q.error() {
            return Err(e);
        }
        let value = sanitize_value(value)?;

        let (device_addr, channel_addr) = split_address(&addr);
        self.container
            .with_device_mut(&device_addr, |d| {
                let paramset = match &channel_addr {
                    Some(_) => d
                        .channel_mut(&addr)
                        .map(|c| &mut c.values)
                        .ok_or_else(|| Error::NotFound(addr.clone()))?,
                    None => &mut d.master,
                };
                let param = paramset.get_mut(&name).ok_or_else(|| Error::NotFound(name.clone()))?;
                param.set_value(value)?;
                Ok(Value::Empty)
            })
            .await
    }

    async fn ping(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let caller_id = q.index(0).string();
        if let Some(e) = q.error() {
            return Err(e);
        }

        let _ = self
            .container
            .publisher()
            .send(Event::new("CENTRAL", "PONG", Value::String(caller_id)));
        Ok(Value::Bool(true))
    }
}

/// Wires every device-layer method onto `dispatcher` under its own
/// name, since `Dispatcher` routes by exact method name rather than
/// handing every call to one object.
pub async fn register_with(dispatcher: &hmccu_rpc::Dispatcher, handler: Arc<DeviceHandler>) {
    dispatcher.handle("init", Arc::new(Op::Init(handler.clone()))).await;
    dispatcher.handle("listDevices", Arc::new(Op::ListDevices(handler.clone()))).await;
    dispatcher.handle("deleteDevice", Arc::new(Op::DeleteDevice(handler.clone()))).await;
    dispatcher
        .handle("getDeviceDescription", Arc::new(Op::GetDeviceDescription(handler.clone())))
        .await;
    dispatcher
        .handle("getParamsetDescription", Arc::new(Op::GetParamsetDescription(handler.clone())))
        .await;
    dispatcher.handle("getParamset", Arc::new(Op::GetParamset(handler.clone()))).await;
    dispatcher.handle("putParamset", Arc::new(Op::PutParamset(handler.clone()))).await;
    dispatcher.handle("getValue", Arc::new(Op::GetValue(handler.clone()))).await;
    dispatcher.handle("setValue", Arc::new(Op::SetValue(handler.clone()))).await;
    dispatcher.handle("ping", Arc::new(Op::Ping(handler))).await;
}

enum Op {
    Init(Arc<DeviceHandler>),
    ListDevices(Arc<DeviceHandler>),
    DeleteDevice(Arc<DeviceHandler>),
    GetDeviceDescription(Arc<DeviceHandler>),
    GetParamsetDescription(Arc<DeviceHandler>),
    GetParamset(Arc<DeviceHandler>),
    PutParamset(Arc<DeviceHandler>),
    GetValue(Arc<DeviceHandler>),
    SetValue(Arc<DeviceHandler>),
    Ping(Arc<DeviceHandler>),
}

#[async_trait]
impl Handler for Op {
    async fn call(&self, params: &Value) -> Result<Value> {
        match self {
            Op::Init(h) => h.init(params).await,
            Op::ListDevices(h) => h.list_devices().await,
            Op::DeleteDevice(h) => h.delete_device(params).await,
            Op::GetDeviceDescription(h) => h.get_device_description(params).await,
            Op::GetParamsetDescription(h) => h.get_paramset_description(params).await,
            Op::GetParamset(h) => h.get_paramset(params).await,
            Op::PutParamset(h) => h.put_paramset(params).await,
            Op::GetValue(h) => h.get_value(params).await,
            Op::SetValue(h) => h.set_value(params).await,
            Op::Ping(h) => h.ping(params).await,
        }
    }
}

/// Applies [`sanitize_string`] to every string reachable from a
/// `setValue`/`putParamset` payload (a bare scalar or a flat struct of
/// members), leaving non-string values untouched.
fn sanitize_value(v: Value) -> Result<Value> {
    match v {
        Value::String(s) => Ok(Value::String(sanitize_string(&s)?)),
        Value::Struct(members) => {
            let mut out = Vec::with_capacity(members.len());
            for (k, mv) in members {
                out.push((k, sanitize_value(mv)?));
            }
            Ok(Value::Struct(out))
        }
        other => Ok(other),
    }
}

/// Workaround for a controller bug: rejects any byte >= 0x80 outright,
/// then replaces `&#N;` numeric entities with the ASCII character they
/// name. Applied only to values arriving from the Controller over
/// `setValue`/`putParamset`, not to internal/programmatic writes.
fn sanitize_string(s: &str) -> Result<String> {
    if s.bytes().any(|b| b >= 0x80) {
        return Err(Error::NonAscii);
    }

    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'&' && bytes[i + 1..].starts_with(b"#") {
            if let Some(end) = s[i..].find(';') {
                let digits = &s[i + 2..i + end];
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(code) = digits.parse::<u32>() {
                        if let Some(c) = char::from_u32(code) {
                            out.push(c);
                            i += end + 1;
                            continue;
                        }
                    }
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    Ok(out)
}

fn strip_scheme(url: &str) -> String {
    match url.find("://") {
        Some(i) => url[i + 3..].to_string(),
        None => url.to_string(),
    }
}

/// Splits `<deviceAddr>[:<channelAddr>]`.
fn split_address(addr: &str) -> (String, Option<String>) {
    match addr.split_once(':') {
        Some((device, channel)) => (device.to_string(), Some(channel.to_string())),
        None => (addr.to_string(), None),
    }
}

fn addr_and_key(params: &Value) -> Result<(String, ParamsetKey)> {
    let q = Query::new(params);
    let addr = q.index(0).string();
    let key_str = q.index(1).string();
    if let Some(e) = q.error() {
        return Err(e);
    }
    Ok((addr, ParamsetKey::parse(&key_str)?))
}

/// If the channel portion is missing, the paramset key MUST be
/// MASTER; unexpected keys yield `BadParamsetKey`.
fn paramset_for<'d>(
    device: &'d crate::device::Device,
    addr: &str,
    key: ParamsetKey,
) -> Result<&'d crate::paramset::Paramset> {
    let (_, channel_addr) = split_address(addr);
    match channel_addr {
        None => {
            if key != ParamsetKey::Master {
                return Err(Error::BadParamsetKey(key.as_str().to_string()));
            }
            Ok(&device.master)
        }
        Some(_) => {
            let channel = device.channel(addr).ok_or_else(|| Error::NotFound(addr.to_string()))?;
            Ok(channel.paramset(key))
        }
    }
}

fn paramset_for_mut<'d>(
    device: &'d mut crate::device::Device,
    addr: &str,
    key: ParamsetKey,
) -> Result<&'d mut crate::paramset::Paramset> {
    let (_, channel_addr) = split_address(addr);
    match channel_addr {
        None => {
            if key != ParamsetKey::Master {
                return Err(Error::BadParamsetKey(key.as_str().to_string()));
            }
            Ok(&mut device.master)
        }
        Some(_) => {
            let channel = device.channel_mut(addr).ok_or_else(|| Error::NotFound(addr.to_string()))?;
            Ok(channel.paramset_mut(key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, NullSynchronizer};
    use crate::device::{Channel, Device};
    use crate::flags::OperationFlags;
    use crate::kind::Kind;
    use crate::param::{ParamDescription, Parameter};
    use hmccu_rpc::Dispatcher;

    async fn sample_container() -> Arc<Container> {
        let c = Arc::new(Container::new(Arc::new(NullSynchronizer)));
        let mut dev = Device::new("ABC1234567", "HM-LC-SW1-SM", Some(c.publisher()));
        let mut chan = Channel::new("SWITCH");
        chan.add_value_param(Parameter::new(
            ParamDescription::new("STATE", Kind::Bool, OperationFlags::READ_WRITE_EVENT),
            Value::Bool(false),
        ));
        dev.add_channel(chan);
        dev.add_master_param(Parameter::new(
            ParamDescription::new("NAME", Kind::String, OperationFlags::READ_WRITE_EVENT),
            Value::String(String::new()),
        ));
        c.add_device(dev).await.unwrap();
        c
    }

    #[tokio::test]
    async fn list_devices_flattens_device_and_channel() {
        let container = sample_container().await;
        let handler = Arc::new(DeviceHandler::new(container, Arc::new(NullRegistrationSink)));

        let result = handler.list_devices().await.unwrap();
        let items = result.as_array().unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn delete_device_on_channel_address_is_silently_ignored() {
        let container = sample_container().await;
        let handler = Arc::new(DeviceHandler::new(container.clone(), Arc::new(NullRegistrationSink)));

        handler
            .delete_device(&Value::Array(vec![Value::String("ABC1234567:0".into()), Value::Int(0)]))
            .await
            .unwrap();
        assert_eq!(container.len().await, 1);
    }

    #[tokio::test]
    async fn delete_device_on_device_address_removes_it() {
        let container = sample_container().await;
        let handler = Arc::new(DeviceHandler::new(container.clone(), Arc::new(NullRegistrationSink)));

        handler
            .delete_device(&Value::Array(vec![Value::String("ABC1234567".into()), Value::Int(0)]))
            .await
            .unwrap();
        assert_eq!(container.len().await, 0);
    }

    #[tokio::test]
    async fn master_paramset_requires_no_channel_portion() {
        let container = sample_container().await;
        let handler = Arc::new(DeviceHandler::new(container, Arc::new(NullRegistrationSink)));

        let params = Value::Array(vec![
            Value::String("ABC1234567".into()),
            Value::String("VALUES".into()),
        ]);
        let err = handler.get_paramset(&params).await.unwrap_err();
        assert_eq!(err, Error::BadParamsetKey("VALUES".to_string()));
    }

    #[tokio::test]
    async fn set_value_then_get_value_round_trips() {
        let container = sample_container().await;
        let handler = Arc::new(DeviceHandler::new(container, Arc::new(NullRegistrationSink)));

        handler
            .set_value(&Value::Array(vec![
                Value::String("ABC1234567:0".into()),
                Value::String("STATE".into()),
                Value::Bool(true),
            ]))
            .await
            .unwrap();

        let v = handler
            .get_value(&Value::Array(vec![
                Value::String("ABC1234567:0".into()),
                Value::String("STATE".into()),
            ]))
            .await
            .unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[tokio::test]
    async fn ping_publishes_central_pong_event() {
        let container = sample_container().await;
        let mut events = container.subscribe();
        let handler = Arc::new(DeviceHandler::new(container, Arc::new(NullRegistrationSink)));

        let result = handler.ping(&Value::Array(vec![Value::String("logic-1".into())])).await.unwrap();
        assert_eq!(result, Value::Bool(true));

        let ev = events.try_recv().unwrap();
        assert_eq!(ev.address, "CENTRAL");
        assert_eq!(ev.key, "PONG");
        assert_eq!(ev.value, Value::String("logic-1".into()));
    }

    #[test]
    fn remote_mode_substitutes_well_known_loopback_aliases() {
        let container_placeholder: Arc<Container> = Arc::new(Container::new(Arc::new(NullSynchronizer)));
        let handler = DeviceHandler::new(container_placeholder, Arc::new(NullRegistrationSink))
            .with_remote_mode("ccu3");

        assert_eq!(
            handler.substitute_address("xmlrpc_bin://127.0.0.1:31999"),
            "ccu3:1999"
        );
        assert_eq!(
            handler.substitute_address("http://127.0.0.1:39292/bidcos"),
            "ccu3:9292/bidcos"
        );
        assert_eq!(handler.substitute_address("xmlrpc_bin://10.0.0.9:2000"), "10.0.0.9:2000");
    }

    #[tokio::test]
    async fn init_with_id_registers_and_without_id_deregisters() {
        struct Sink(std::sync::Mutex<Vec<String>>);
        impl RegistrationSink for Sink {
            fn register(&self, receiver_address: &str, interface_id: &str) {
                self.0.lock().unwrap().push(format!("+{}:{}", receiver_address, interface_id));
            }
            fn deregister(&self, receiver_address: &str) {
                self.0.lock().unwrap().push(format!("-{}", receiver_address));
            }
        }
        let sink = Arc::new(Sink(std::sync::Mutex::new(Vec::new())));
        let container = Arc::new(Container::new(Arc::new(NullSynchronizer)));
        let handler = DeviceHandler::new(container, sink.clone());

        handler
            .init(&Value::Array(vec![
                Value::String("xmlrpc_bin://192.168.1.5:2000".into()),
                Value::String("logic-1".into()),
            ]))
            .await
            .unwrap();
        handler
            .init(&Value::Array(vec![Value::String("xmlrpc_bin://192.168.1.5:2000".into())]))
            .await
            .unwrap();

        let log = sink.0.lock().unwrap();
        assert_eq!(log[0], "+192.168.1.5:2000:logic-1");
        assert_eq!(log[1], "-xmlrpc_bin://192.168.1.5:2000");
    }

    #[tokio::test]
    async fn set_value_rejects_high_bytes_in_incoming_string() {
        let container = sample_container().await;
        let handler = Arc::new(DeviceHandler::new(container, Arc::new(NullRegistrationSink)));

        let non_ascii = Value::String(String::from_utf8(vec![0xC3, 0xA9]).unwrap());
        let err = handler
            .set_value(&Value::Array(vec![
                Value::String("ABC1234567".into()),
                Value::String("NAME".into()),
                non_ascii,
            ]))
            .await
            .unwrap_err();
        assert_eq!(err, Error::NonAscii);
    }

    #[tokio::test]
    async fn set_value_replaces_numeric_entities_in_incoming_string() {
        let container = sample_container().await;
        let handler = Arc::new(DeviceHandler::new(container, Arc::new(NullRegistrationSink)));

        handler
            .set_value(&Value::Array(vec![
                Value::String("ABC1234567".into()),
                Value::String("NAME".into()),
                Value::String("caf&#233; bar".into()),
            ]))
            .await
            .unwrap();

        let v = handler
            .get_value(&Value::Array(vec![
                Value::String("ABC1234567".into()),
                Value::String("NAME".into()),
            ]))
            .await
            .unwrap();
        assert_eq!(v, Value::String("café bar".into()));
    }

    #[tokio::test]
    async fn put_paramset_sanitizes_string_members_before_writing() {
        let container = sample_container().await;
        let handler = Arc::new(DeviceHandler::new(container, Arc::new(NullRegistrationSink)));

        let values = Value::struct_from(vec![("NAME".to_string(), Value::String("caf&#233;".into()))]);
        handler
            .put_paramset(&Value::Array(vec![
                Value::String("ABC1234567".into()),
                Value::String("MASTER".into()),
                values,
            ]))
            .await
            .unwrap();

        let v = handler
            .get_value(&Value::Array(vec![
                Value::String("ABC1234567".into()),
                Value::String("NAME".into()),
            ]))
            .await
            .unwrap();
        assert_eq!(v, Value::String("café".into()));
    }
}
