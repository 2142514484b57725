use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use hmccu_proto::{Query, Result, Value};
use hmccu_rpc::{Dispatcher, Handler};

use crate::registered_client::Handle as RegisteredClientHandle;

/// The inbound half of a registered logic layer: the RPC surface an
/// interface process calls on us once we've registered with it
/// through `init`. Every `event` call pulses the matching
/// [`RegisteredClient`](crate::registered_client::RegisteredClient)'s
/// callback channel, proving the registration is still alive.
pub struct LogicLayerDispatcher {
    clients: RwLock<HashMap<String, RegisteredClientHandle>>,
}

impl Default for LogicLayerDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicLayerDispatcher {
    pub fn new() -> Self {
        LogicLayerDispatcher {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Associates a logic-layer id with the [`RegisteredClient`] its
    /// `event` callbacks should pulse.
    pub async fn track(&self, logic_id: impl Into<String>, handle: RegisteredClientHandle) {
        self.clients.write().await.insert(logic_id.into(), handle);
    }

    pub async fn untrack(&self, logic_id: &str) {
        self.clients.write().await.remove(logic_id);
    }

    async fn pulse(&self, logic_id: &str) {
        if let Some(handle) = self.clients.read().await.get(logic_id) {
            handle.pulse();
        }
    }

    async fn event(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let id = q.index(0).string();
        let addr = q.index(1).string();
        let key = q.index(2).string();
        let value = q.index(3).value().clone();
        if let Some(e) = q.error() {
            return Err(e);
        }

        debug!(id = %id, addr = %addr, key = %key, ?value, "event callback");
        self.pulse(&id).await;
        Ok(Value::Empty)
    }

    /// A quirk of the source behavior, preserved rather than "fixed":
    /// this always reports no devices, regardless of what we've been
    /// told about via `newDevices`/`deleteDevices`.
    async fn list_devices(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let id = q.index(0).string();
        if let Some(e) = q.error() {
            return Err(e);
        }
        self.pulse(&id).await;
        Ok(Value::Array(vec![]))
    }

    async fn new_devices(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let id = q.index(0).string();
        let list = q.index(1).array();
        if let Some(e) = q.error() {
            return Err(e);
        }
        debug!(id = %id, count = list.len(), "newDevices");
        self.pulse(&id).await;
        Ok(Value::Empty)
    }

    async fn delete_devices(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let id = q.index(0).string();
        let addresses = q.index(1).array();
        if let Some(e) = q.error() {
            return Err(e);
        }
        debug!(id = %id, count = addresses.len(), "deleteDevices");
        self.pulse(&id).await;
        Ok(Value::Empty)
    }

    async fn update_device(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let id = q.index(0).string();
        let addr = q.index(1).string();
        let hint = q.index(2).value().clone();
        if let Some(e) = q.error() {
            return Err(e);
        }
        debug!(id = %id, %addr, ?hint, "updateDevice");
        self.pulse(&id).await;
        Ok(Value::Empty)
    }

    async fn replace_device(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let id = q.index(0).string();
        let old = q.index(1).string();
        let new = q.index(2).string();
        if let Some(e) = q.error() {
            return Err(e);
        }
        debug!(id = %id, %old, %new, "replaceDevice");
        self.pulse(&id).await;
        Ok(Value::Empty)
    }

    async fn readded_device(&self, params: &Value) -> Result<Value> {
        let q = Query::new(params);
        let id = q.index(0).string();
        let deleted = q.index(1).array();
        if let Some(e) = q.error() {
            return Err(e);
        }
        debug!(id = %id, count = deleted.len(), "readdedDevice");
        self.pulse(&id).await;
        Ok(Value::Empty)
    }

    async fn set_ready_config(&self, _params: &Value) -> Result<Value> {
        Ok(Value::Empty)
    }
}

/// Wires every logic-layer method onto `dispatcher` under its own
/// name, matching the one-method-per-name convention `Dispatcher`
/// routes by.
pub async fn register_with(dispatcher: &Dispatcher, handler: Arc<LogicLayerDispatcher>) {
    dispatcher.handle("event", Arc::new(Op::Event(handler.clone()))).await;
    dispatcher.handle("listDevices", Arc::new(Op::ListDevices(handler.clone()))).await;
    dispatcher.handle("newDevices", Arc::new(Op::NewDevices(handler.clone()))).await;
    dispatcher.handle("deleteDevices", Arc::new(Op::DeleteDevices(handler.clone()))).await;
    dispatcher.handle("updateDevice", Arc::new(Op::UpdateDevice(handler.clone()))).await;
    dispatcher.handle("replaceDevice", Arc::new(Op::ReplaceDevice(handler.clone()))).await;
    dispatcher.handle("readdedDevice", Arc::new(Op::ReaddedDevice(handler.clone()))).await;
    dispatcher
        .handle("setReadyConfig", Arc::new(Op::SetReadyConfig(handler)))
        .await;
}

enum Op {
    Event(Arc<LogicLayerDispatcher>),
    ListDevices(Arc<LogicLayerDispatcher>),
    NewDevices(Arc<LogicLayerDispatcher>),
    DeleteDevices(Arc<LogicLayerDispatcher>),
    UpdateDevice(Arc<LogicLayerDispatcher>),
    ReplaceDevice(Arc<LogicLayerDispatcher>),
    ReaddedDevice(Arc<LogicLayerDispatcher>),
    SetReadyConfig(Arc<LogicLayerDispatcher>),
}

#[async_trait]
impl Handler for Op {
    async fn call(&self, params: &Value) -> Result<Value> {
        match self {
            Op::Event(h) => h.event(params).await,
            Op::ListDevices(h) => h.list_devices(params).await,
            Op::NewDevices(h) => h.new_devices(params).await,
            Op::DeleteDevices(h) => h.delete_devices(params).await,
            Op::UpdateDevice(h) => h.update_device(params).await,
            Op::ReplaceDevice(h) => h.replace_device(params).await,
            Op::ReaddedDevice(h) => h.readded_device(params).await,
            Op::SetReadyConfig(h) => h.set_ready_config(params).await,
        }
    }
}
