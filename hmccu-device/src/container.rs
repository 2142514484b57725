use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use hmccu_proto::{Error, Result};

use crate::device::Device;
use crate::event::Event;

/// Notified exactly once per `AddDevice`/`RemoveDevice` mutation.
pub trait Synchronizer: Send + Sync {
    fn device_added(&self, address: &str);
    fn device_removed(&self, address: &str);
}

/// A `Synchronizer` that does nothing; the default for a container
/// with no registered logic layers yet.
pub struct NullSynchronizer;

impl Synchronizer for NullSynchronizer {
    fn device_added(&self, _address: &str) {}
    fn device_removed(&self, _address: &str) {}
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Process-wide `address -> Device` map. Each device has its own
/// readers-writers lock, acquired only for the duration of a single
/// device-layer call; the map's own lock is held just long enough to
/// look an address up or to insert/remove an entry. This gives every
/// device an implicit monitor of its own, so a subscriber reacting to
/// a published event by calling back into a *different* device doesn't
/// deadlock against a call still in flight on the device that raised
/// it. Also owns the shared event-publisher handle every device
/// created through it is bound to.
pub struct Container {
    devices: RwLock<HashMap<String, Arc<RwLock<Device>>>>,
    synchronizer: Arc<dyn Synchronizer>,
    events: broadcast::Sender<Event>,
}

impl Container {
    pub fn new(synchronizer: Arc<dyn Synchronizer>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Container {
            devices: RwLock::new(HashMap::new()),
            synchronizer,
            events,
        }
    }

    /// Handed to `Device::new` so new devices publish onto the
    /// container's shared event stream.
    pub fn publisher(&self) -> broadcast::Sender<Event> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn add_device(&self, device: Device) -> Result<()> {
        let address = device.address.clone();
        let mut map = self.devices.write().await;
        if map.contains_key(&address) {
            return Err(Error::DuplicateAddress(address));
        }
        map.insert(address.clone(), Arc::new(RwLock::new(device)));
        drop(map);
        self.synchronizer.device_added(&address);
        Ok(())
    }

    pub async fn remove_device(&self, address: &str) -> Result<()> {
        let mut map = self.devices.write().await;
        if map.remove(address).is_none() {
            return Err(Error::NotFound(address.to_string()));
        }
        drop(map);
        self.synchronizer.device_removed(address);
        Ok(())
    }

    /// Looks `address` up under the map's lock, then releases it
    /// before taking the device's own lock -- the map is never held
    /// for the duration of `f`.
    pub async fn with_device<R>(&self, address: &str, f: impl FnOnce(&Device) -> Result<R>) -> Result<R> {
        let map = self.devices.read().await;
        let entry = map.get(address).cloned().ok_or_else(|| Error::NotFound(address.to_string()))?;
        drop(map);
        let device = entry.read().await;
        f(&device)
    }

    pub async fn with_device_mut<R>(
        &self,
        address: &str,
        f: impl FnOnce(&mut Device) -> Result<R>,
    ) -> Result<R> {
        let map = self.devices.read().await;
        let entry = map.get(address).cloned().ok_or_else(|| Error::NotFound(address.to_string()))?;
        drop(map);
        let mut device = entry.write().await;
        f(&mut device)
    }

    /// Snapshot of every device's address, for iteration without
    /// holding the lock.
    pub async fn addresses(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Every device and channel address currently held, for
    /// reconciliation against a logic layer's own device list.
    pub async fn all_addresses(&self) -> Vec<String> {
        let map = self.devices.read().await;
        let entries: Vec<_> = map.values().cloned().collect();
        drop(map);
        let mut out = Vec::new();
        for entry in entries {
            let dev = entry.read().await;
            out.push(dev.address.clone());
            out.extend(dev.channels.iter().map(|c| c.address.clone()));
        }
        out
    }

    /// Flattened device+channel descriptions for every device, in the
    /// shape `newDevices` expects.
    pub async fn all_descriptions(&self) -> Vec<hmccu_proto::Value> {
        let map = self.devices.read().await;
        let entries: Vec<_> = map.values().cloned().collect();
        drop(map);
        let mut out = Vec::new();
        for entry in entries {
            out.extend(entry.read().await.flattened_descriptions());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[tokio::test]
    async fn add_device_rejects_duplicate_address() {
        let c = Container::new(Arc::new(NullSynchronizer));
        c.add_device(Device::new("A", "TYPE", None)).await.unwrap();
        let err = c.add_device(Device::new("A", "TYPE", None)).await.unwrap_err();
        assert_eq!(err, Error::DuplicateAddress("A".to_string()));
    }

    #[tokio::test]
    async fn remove_device_fails_when_absent() {
        let c = Container::new(Arc::new(NullSynchronizer));
        let err = c.remove_device("A").await.unwrap_err();
        assert_eq!(err, Error::NotFound("A".to_string()));
    }

    #[tokio::test]
    async fn synchronizer_fires_once_per_mutation() {
        struct Counter(std::sync::atomic::AtomicUsize);
        impl Synchronizer for Counter {
            fn device_added(&self, _address: &str) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            fn device_removed(&self, _address: &str) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let sync = Arc::new(Counter(std::sync::atomic::AtomicUsize::new(0)));
        let c = Container::new(sync.clone());

        c.add_device(Device::new("A", "TYPE", None)).await.unwrap();
        c.remove_device("A").await.unwrap();

        assert_eq!(sync.0.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
