#![deny(unsafe_code)]

use std::convert::Infallible;
use std::sync::Arc;

use futures::future;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use hmccu_device::{handler as device_handler, Container, DeviceHandler};
use hmccu_link::{caller_for, registered_client::RegisteredClient, servant_registry::ServantRegistry, LogicLayerDispatcher};
use hmccu_proto::{Error, Result};
use hmccu_rpc::{Dispatcher, HttpFront, TcpFront};

mod config;

/// Loads the configuration and sets up the logger. Returns `None` if
/// the program should exit immediately (e.g. `--print-config` was
/// given).
async fn init_app() -> Option<config::Config> {
    let cfg = config::get().await?;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(cfg.get_log_level())
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("unable to set global default subscriber");
    Some(cfg)
}

/// Turns a `JoinHandle` for a task that should run forever into a
/// `Result`, reporting panics and cancellations as operation errors.
async fn wrap_task(handle: JoinHandle<Result<Infallible>>) -> Result<Infallible> {
    match handle.await {
        Err(e) if e.is_panic() => {
            error!("terminated due to panic");
            Err(Error::OperationError("task panicked".to_owned()))
        }
        Err(_) => {
            error!("terminated due to cancellation");
            Err(Error::OperationError("task was canceled".to_owned()))
        }
        Ok(Err(e)) => {
            error!("task returned error -- {}", &e);
            Err(e)
        }
        Ok(Ok(_)) => unreachable!(),
    }
}

/// One interface we're registered with as a logic layer: the running
/// task plus the handle needed to stop it cleanly.
struct OutboundRegistration {
    name: String,
    handle: hmccu_link::RegisteredClientHandle,
    task: JoinHandle<()>,
}

async fn run() -> Result<()> {
    let Some(cfg) = init_app().await else {
        return Ok(());
    };

    let registry = Arc::new(ServantRegistry::new(cfg.max_http_response, cfg.max_bin_response));
    let container = Arc::new(Container::new(registry.clone()));
    registry.set_container(container.clone());

    let mut device = DeviceHandler::new(container.clone(), registry.clone());
    if cfg.remote_mode {
        device = device.with_remote_mode(cfg.controller_host.clone());
    }
    let device = Arc::new(device);

    let logic_layer = Arc::new(LogicLayerDispatcher::new());

    let dispatcher = Arc::new(Dispatcher::new());
    device_handler::register_with(&dispatcher, device).await;
    hmccu_link::logic_layer::register_with(&dispatcher, logic_layer.clone()).await;

    info!("starting servers");

    let http_addr = cfg.get_http_addr()?;
    let tcp_addr = cfg.get_tcp_addr()?;

    let http_front = HttpFront::new(dispatcher.clone(), cfg.max_http_response as u64);
    let http_task: JoinHandle<Result<Infallible>> = tokio::spawn(async move {
        http_front.serve(http_addr).instrument(info_span!("httpd")).await;
        Err(Error::OperationError("HTTP front exited".to_owned()))
    });
    // `HttpFront::serve` has no shutdown hook of its own, so the only
    // way to stop it on graceful shutdown is to abort the task.
    let http_abort = http_task.abort_handle();

    let tcp_front = TcpFront::new(dispatcher.clone(), cfg.max_bin_response);
    let (tcp_stop_tx, tcp_stop_rx) = watch::channel(false);
    let (tcp_done_tx, tcp_done_rx) = oneshot::channel();
    let (tcp_fatal_tx, mut tcp_fatal_rx) = mpsc::channel(1);
    let tcp_task: JoinHandle<Result<Infallible>> = tokio::spawn(async move {
        match tcp_front.serve(tcp_addr, tcp_stop_rx, tcp_done_tx, tcp_fatal_tx).await {
            Ok(()) => Err(Error::OperationError("TCP front exited".to_owned())),
            Err(e) => Err(e),
        }
    });

    info!("registering with configured interfaces");

    let mut outbound = Vec::new();
    for iface in &cfg.interface {
        let caller = caller_for(&iface.url, cfg.max_http_response, cfg.max_bin_response);
        let (client, handle) = RegisteredClient::new(caller, iface.receiver.clone(), iface.name.clone());
        logic_layer.track(iface.name.clone(), handle.clone()).await;

        let span = info_span!("registered_client", id = %iface.name);
        let task = tokio::spawn(client.run().instrument(span));
        outbound.push(OutboundRegistration {
            name: iface.name.clone(),
            handle,
            task,
        });
    }

    let forever = vec![wrap_task(http_task), wrap_task(tcp_task)];

    tokio::select! {
        _ = future::join_all(forever) => {
            warn!("a server front exited unexpectedly");
        }
        Some(e) = tcp_fatal_rx.recv() => {
            error!(error = %e, "TCP front reported a fatal error");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for ctrl-c, shutting down anyway");
            } else {
                info!("received shutdown signal");
            }
        }
    }

    info!("shutting down");

    // (i) stop the fronts' accept loops.
    http_abort.abort();
    let _ = tcp_stop_tx.send(true);
    let _ = tcp_done_rx.await;

    // (ii) stop the outbound registrations; each makes a best-effort
    // `deinit` call as it unwinds.
    for reg in &outbound {
        reg.handle.stop();
    }
    for reg in outbound {
        if reg.task.await.is_err() {
            warn!(id = %reg.name, "registered-client task ended abnormally");
        }
    }

    // (iii) stop every servant serving a logic layer registered with us.
    registry.shutdown();

    // (iv) the container is dropped here, at the end of `run`.

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e:?}")
    }
}
