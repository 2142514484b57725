use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use hmccu_device::Container;
use hmccu_proto::Value;
use hmccu_rpc::{Caller, RetryingCaller};

const QUEUE_CAPACITY: usize = 200;
const RETRY_DELAY: Duration = Duration::from_secs(20);
const RETRY_COUNT: usize = 6;

/// One unit of work for a [`Servant`]: reconcile the logic layer's
/// device list with ours, or forward a single value-change event.
enum Command {
    Sync,
    Event {
        address: String,
        key: String,
        value: Value,
    },
}

/// Producer-side handle: enqueues commands without blocking. If the
/// queue is full the newest command is dropped; a subsequent SYNC
/// reconciles whatever was lost.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::Sender<Command>,
}

impl Handle {
    pub fn sync(&self) {
        if self.tx.try_send(Command::Sync).is_err() {
            warn!("servant queue full, dropping SYNC command");
        }
    }

    pub fn event(&self, address: impl Into<String>, key: impl Into<String>, value: Value) {
        let cmd = Command::Event {
            address: address.into(),
            key: key.into(),
            value,
        };
        if self.tx.try_send(cmd).is_err() {
            warn!("servant queue full, dropping EVENT command");
        }
    }
}

/// Background worker bound to one (receiver address, interface id)
/// pair: pops commands from a bounded queue and dials the logic
/// layer's own RPC surface to keep it in sync with our container and
/// forward value changes.
pub struct Servant<C> {
    caller: RetryingCaller<C>,
    logic_id: String,
    container: Arc<Container>,
    queue: mpsc::Receiver<Command>,
    stop_rx: watch::Receiver<bool>,
}

impl<C: Caller> Servant<C> {
    pub fn new(
        caller: C,
        logic_id: impl Into<String>,
        container: Arc<Container>,
    ) -> (Self, Handle, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let servant = Servant {
            caller: RetryingCaller::new(caller, RETRY_COUNT, RETRY_DELAY),
            logic_id: logic_id.into(),
            container,
            queue: rx,
            stop_rx,
        };
        (servant, Handle { tx }, stop_tx)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.queue.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = self.stop_rx.changed() => {
                    if *self.stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, cmd: Command) {
        match cmd {
            Command::Sync => self.sync().await,
            Command::Event { address, key, value } => self.forward_event(address, key, value).await,
        }
    }

    /// Fetches the logic layer's device list, computes the symmetric
    /// difference against the local container, deletes stale entries
    /// children first (reverse lexicographic sort puts channels ahead
    /// of their owning devices), then creates missing entries.
    async fn sync(&self) {
        let remote = match self
            .caller
            .call(
                "listDevices",
                &Value::Array(vec![Value::String(self.logic_id.clone())]),
                self.stop_rx.clone(),
            )
            .await
        {
            Ok(v) => addresses_of(&v),
            Err(e) => {
                warn!(error = %e, id = %self.logic_id, "SYNC: listDevices failed");
                return;
            }
        };

        let local: HashSet<String> = self.container.all_addresses().await.into_iter().collect();
        let remote_set: HashSet<String> = remote.into_iter().collect();

        let mut stale: Vec<String> = remote_set.difference(&local).cloned().collect();
        stale.sort_by(|a, b| b.cmp(a));
        if !stale.is_empty() {
            let params = Value::Array(vec![
                Value::String(self.logic_id.clone()),
                Value::Array(stale.iter().cloned().map(Value::String).collect()),
            ]);
            if let Err(e) = self.caller.call("deleteDevices", &params, self.stop_rx.clone()).await {
                warn!(error = %e, id = %self.logic_id, "SYNC: deleteDevices failed");
            }
        }

        let missing: HashSet<String> = local.difference(&remote_set).cloned().collect();
        if !missing.is_empty() {
            let descriptions: Vec<Value> = self
                .container
                .all_descriptions()
                .await
                .into_iter()
                .filter(|d| {
                    d.member("ADDRESS")
                        .and_then(Value::as_str)
                        .map(|a| missing.contains(a))
                        .unwrap_or(false)
                })
                .collect();
            let params = Value::Array(vec![
                Value::String(self.logic_id.clone()),
                Value::Array(descriptions),
            ]);
            if let Err(e) = self.caller.call("newDevices", &params, self.stop_rx.clone()).await {
                warn!(error = %e, id = %self.logic_id, "SYNC: newDevices failed");
            }
        }
    }

    async fn forward_event(&self, address: String, key: String, value: Value) {
        let params = Value::Array(vec![
            Value::String(self.logic_id.clone()),
            Value::String(address),
            Value::String(key),
            value,
        ]);
        if let Err(e) = self.caller.call("event", &params, self.stop_rx.clone()).await {
            debug!(error = %e, id = %self.logic_id, "EVENT forward failed");
        }
    }
}

fn addresses_of(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Spawns a [`Servant`] as a background task, returning the queueing
/// [`Handle`] and a stop sender for the owning daemon context to use
/// on shutdown.
pub fn spawn<C: Caller + Send + Sync + 'static>(
    caller: C,
    logic_id: impl Into<String>,
    container: Arc<Container>,
) -> (Handle, watch::Sender<bool>) {
    let (servant, handle, stop_tx) = Servant::new(caller, logic_id, container);
    tokio::spawn(servant.run());
    (handle, stop_tx)
}
