use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tokio::sync::watch;
use tracing::{info, warn};

use hmccu_device::{Container, RegistrationSink, Synchronizer};
use hmccu_rpc::{BinClient, Caller, XmlClient};

use crate::servant::{spawn as spawn_servant, Handle as ServantHandle};

/// Picks a [`Caller`] implementation by URL scheme: `xmlrpc_bin://`
/// dials BIN-RPC over TCP, everything else is treated as an
/// XML-RPC-over-HTTP endpoint.
pub fn caller_for(url: &str, max_http_response: usize, max_bin_response: usize) -> Box<dyn Caller> {
    match url.strip_prefix("xmlrpc_bin://") {
        Some(addr) => Box::new(BinClient::new(addr, max_bin_response)),
        None => Box::new(XmlClient::new(url, max_http_response)),
    }
}

struct Entry {
    handle: ServantHandle,
    stop: watch::Sender<bool>,
}

/// Bridges a [`Container`]'s device lifecycle to the [`Servant`]s
/// serving each logic layer registered with us through `init`: one is
/// spun up on registration, torn down on deregistration, and all of
/// them are pulsed with a SYNC on every device add/remove.
///
/// `Container` is constructed with this registry as its synchronizer,
/// so the container itself isn't available yet at that point; `set_container`
/// fills it in right after.
pub struct ServantRegistry {
    container: OnceLock<Arc<Container>>,
    max_http_response: usize,
    max_bin_response: usize,
    servants: RwLock<HashMap<String, Entry>>,
}

impl ServantRegistry {
    pub fn new(max_http_response: usize, max_bin_response: usize) -> Self {
        ServantRegistry {
            container: OnceLock::new(),
            max_http_response,
            max_bin_response,
            servants: RwLock::new(HashMap::new()),
        }
    }

    /// Must be called exactly once, with the `Container` this registry
    /// was handed to as a synchronizer.
    pub fn set_container(&self, container: Arc<Container>) {
        let _ = self.container.set(container);
    }

    /// Stops every active servant; part of the daemon's shutdown
    /// sequence.
    pub fn shutdown(&self) {
        for (_, entry) in self.servants.write().unwrap().drain() {
            let _ = entry.stop.send(true);
        }
    }
}

impl RegistrationSink for ServantRegistry {
    fn register(&self, receiver_address: &str, interface_id: &str) {
        let Some(container) = self.container.get() else {
            warn!("registration before container was attached, dropping");
            return;
        };
        let caller = caller_for(receiver_address, self.max_http_response, self.max_bin_response);
        let (handle, stop) = spawn_servant(caller, interface_id, container.clone());
        handle.sync();
        info!(address = %receiver_address, id = %interface_id, "logic layer registered, servant started");

        let mut servants = self.servants.write().unwrap();
        if let Some(old) = servants.insert(receiver_address.to_string(), Entry { handle, stop }) {
            let _ = old.stop.send(true);
        }
    }

    fn deregister(&self, receiver_address: &str) {
        if let Some(entry) = self.servants.write().unwrap().remove(receiver_address) {
            let _ = entry.stop.send(true);
            info!(address = %receiver_address, "logic layer deregistered, servant stopped");
        } else {
            warn!(address = %receiver_address, "deregister for an address with no active servant");
        }
    }
}

impl Synchronizer for ServantRegistry {
    fn device_added(&self, _address: &str) {
        for entry in self.servants.read().unwrap().values() {
            entry.handle.sync();
        }
    }

    fn device_removed(&self, _address: &str) {
        for entry in self.servants.read().unwrap().values() {
            entry.handle.sync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hmccu_device::NullSynchronizer;
    use hmccu_proto::{Result, Value};

    struct NoopCaller;

    #[async_trait]
    impl Caller for NoopCaller {
        async fn call(&self, _method: &str, _params: &Value) -> Result<Value> {
            Ok(Value::Empty)
        }
    }

    #[test]
    fn caller_for_picks_bin_client_by_scheme() {
        let c = caller_for("xmlrpc_bin://192.168.1.5:2000", 1024, 1024);
        let _: Box<dyn Caller> = c;
    }

    #[tokio::test]
    async fn register_without_container_does_not_panic() {
        let registry = ServantRegistry::new(1024, 1024);
        registry.register("http://127.0.0.1:9000/cb", "logic-1");
    }

    #[tokio::test]
    async fn register_then_deregister_tracks_and_clears_entry() {
        let registry = Arc::new(ServantRegistry::new(1024, 1024));
        let container = Arc::new(Container::new(Arc::new(NullSynchronizer)));
        registry.set_container(container);

        registry.register("http://127.0.0.1:9000/cb", "logic-1");
        assert_eq!(registry.servants.read().unwrap().len(), 1);

        registry.deregister("http://127.0.0.1:9000/cb");
        assert_eq!(registry.servants.read().unwrap().len(), 0);
    }
}
