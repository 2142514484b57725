use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, info_span, warn};
use tracing_futures::Instrument;

use hmccu_proto::{Result, Value};
use hmccu_rpc::Caller;

const STARTUP_DELAY: Duration = Duration::from_secs(1);
const ACTIVE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// States and transitions for one registered logic layer <-> interface
/// process pair. `Idle` is only ever observed before the task backing
/// a [`RegisteredClient`] is polled; spawning it is treated as the
/// `start` trigger straight into `DelayedStart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    DelayedStart,
    Registering,
    Active,
    Pinging,
    Stopped,
}

/// A handle used by the rest of the process to prod a running
/// [`RegisteredClient`]: deliver a callback pulse (coalesced, buffer
/// of one) or request a stop.
#[derive(Clone)]
pub struct Handle {
    pulse: mpsc::Sender<()>,
    stop: watch::Sender<bool>,
}

impl Handle {
    /// Delivers a callback pulse. Rapid repeated pulses coalesce: if
    /// one is already queued, this one is simply dropped.
    pub fn pulse(&self) {
        let _ = self.pulse.try_send(());
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Calls `init(receiver_url, logic_id)` on the external interface,
/// registering us as its logic layer.
async fn call_init<C: Caller>(caller: &C, receiver_url: &str, logic_id: &str) -> Result<()> {
    let params = Value::Array(vec![
        Value::String(receiver_url.to_string()),
        Value::String(logic_id.to_string()),
    ]);
    caller.call("init", &params).await?;
    Ok(())
}

/// Calls the one-argument form of `init(receiver_url)`, which
/// deregisters us.
async fn call_deinit<C: Caller>(caller: &C, receiver_url: &str) {
    let params = Value::Array(vec![Value::String(receiver_url.to_string())]);
    let _ = caller.call("init", &params).await;
}

/// Calls `ping(logic_id)` to prove the registration is still alive.
async fn call_ping<C: Caller>(caller: &C, logic_id: &str) -> Result<()> {
    caller
        .call("ping", &Value::Array(vec![Value::String(logic_id.to_string())]))
        .await?;
    Ok(())
}

/// Drives the registration lifecycle with one interface process:
/// register (`init`), hold the registration alive with periodic pings
/// once no callback activity is observed, and re-register on ping
/// failure. Runs until stopped, at which point it makes a best-effort
/// `deinit` call.
pub struct RegisteredClient<C> {
    caller: C,
    receiver_url: String,
    logic_id: String,
    pulse_rx: mpsc::Receiver<()>,
    stop_rx: watch::Receiver<bool>,
    state: State,
}

impl<C: Caller> RegisteredClient<C> {
    pub fn new(caller: C, receiver_url: impl Into<String>, logic_id: impl Into<String>) -> (Self, Handle) {
        let (pulse_tx, pulse_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let client = RegisteredClient {
            caller,
            receiver_url: receiver_url.into(),
            logic_id: logic_id.into(),
            pulse_rx,
            stop_rx,
            state: State::Idle,
        };
        let handle = Handle {
            pulse: pulse_tx,
            stop: stop_tx,
        };
        (client, handle)
    }

    pub fn state(&self) -> State {
        self.state
    }

    async fn stopped(&mut self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Runs the state machine until stopped. The terminal action is a
    /// best-effort `deinit` call, performed regardless of which state
    /// the stop arrived in.
    pub async fn run(mut self) {
        self.state = State::DelayedStart;
        loop {
            if self.stopped().await {
                break;
            }

            self.state = match self.state {
                State::Idle | State::DelayedStart => {
                    tokio::select! {
                        _ = tokio::time::sleep(STARTUP_DELAY) => State::Registering,
                        _ = self.stop_rx.changed() => State::Stopped,
                    }
                }
                State::Registering => match call_init(&self.caller, &self.receiver_url, &self.logic_id).await {
                    Ok(()) => {
                        info!(id = %self.logic_id, "registered");
                        State::Active
                    }
                    Err(e) => {
                        warn!(error = %e, "registration failed, retrying after delay");
                        tokio::select! {
                            _ = tokio::time::sleep(STARTUP_DELAY) => State::Registering,
                            _ = self.stop_rx.changed() => State::Stopped,
                        }
                    }
                },
                State::Active => {
                    tokio::select! {
                        _ = self.pulse_rx.recv() => State::Active,
                        _ = tokio::time::sleep(ACTIVE_TIMEOUT) => State::Pinging,
                        _ = self.stop_rx.changed() => State::Stopped,
                    }
                }
                State::Pinging => {
                    tokio::select! {
                        result = call_ping(&self.caller, &self.logic_id) => match result {
                            Ok(()) => State::Active,
                            Err(e) => {
                                warn!(error = %e, "ping failed, re-registering");
                                State::Registering
                            }
                        },
                        _ = tokio::time::sleep(PING_TIMEOUT) => {
                            warn!("ping timed out, re-registering");
                            State::Registering
                        }
                        _ = self.stop_rx.changed() => State::Stopped,
                    }
                }
                State::Stopped => break,
            };
        }

        call_deinit(&self.caller, &self.receiver_url)
            .instrument(info_span!("deinit", id = %self.logic_id))
            .await;
    }
}

/// Spawns a [`RegisteredClient`] as a background task and returns the
/// [`Handle`] used to pulse/stop it.
pub fn spawn<C: Caller + Send + 'static>(
    caller: C,
    receiver_url: impl Into<String>,
    logic_id: impl Into<String>,
) -> Handle {
    let (client, handle) = RegisteredClient::new(caller, receiver_url, logic_id);
    let span = info_span!("registered_client");
    tokio::spawn(client.run().instrument(span));
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCaller {
        inits: Arc<AtomicUsize>,
        pings: Arc<AtomicUsize>,
        ping_fails: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Caller for CountingCaller {
        async fn call(&self, method: &str, params: &Value) -> Result<Value> {
            match method {
                "init" => {
                    let args = params.as_array().unwrap_or(&[]);
                    if args.len() == 2 {
                        self.inits.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(Value::Empty)
                }
                "ping" => {
                    self.pings.fetch_add(1, Ordering::SeqCst);
                    if self.ping_fails.load(Ordering::SeqCst) {
                        Err(hmccu_proto::Error::IO("refused".into()))
                    } else {
                        Ok(Value::Bool(true))
                    }
                }
                _ => Ok(Value::Empty),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registers_then_stays_active_while_pulsed() {
        let caller = CountingCaller {
            inits: Arc::new(AtomicUsize::new(0)),
            pings: Arc::new(AtomicUsize::new(0)),
            ping_fails: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        let inits = caller.inits.clone();

        let (client, handle) = RegisteredClient::new(caller, "http://127.0.0.1:9000/cb", "logic-1");
        let task = tokio::spawn(client.run());

        tokio::time::advance(STARTUP_DELAY + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(inits.load(Ordering::SeqCst), 1);

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn active_timeout_leads_to_ping_then_back_to_active() {
        let caller = CountingCaller {
            inits: Arc::new(AtomicUsize::new(0)),
            pings: Arc::new(AtomicUsize::new(0)),
            ping_fails: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        let pings = caller.pings.clone();

        let (client, handle) = RegisteredClient::new(caller, "http://127.0.0.1:9000/cb", "logic-1");
        let task = tokio::spawn(client.run());

        tokio::time::advance(STARTUP_DELAY + ACTIVE_TIMEOUT + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert!(pings.load(Ordering::SeqCst) >= 1);

        handle.stop();
        task.await.unwrap();
    }
}
