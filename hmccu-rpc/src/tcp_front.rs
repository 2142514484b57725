use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{info_span, warn, Instrument};

use hmccu_binrpc::Message;
use hmccu_proto::Error;

use crate::dispatch::Dispatcher;

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const WRITE_DEADLINE: Duration = Duration::from_secs(30);

/// The TCP front: an accept loop with exponential backoff on
/// temporary errors, one task per connection.
pub struct TcpFront {
    dispatcher: Arc<Dispatcher>,
    max_size: usize,
}

impl TcpFront {
    pub fn new(dispatcher: Arc<Dispatcher>, max_size: usize) -> Self {
        TcpFront { dispatcher, max_size }
    }

    /// Runs the accept loop until `stop` is set to `true`, then
    /// signals `done`. A non-temporary accept error is reported on
    /// `fatal` and also ends the loop.
    pub async fn serve(
        &self,
        addr: SocketAddr,
        mut stop: watch::Receiver<bool>,
        done: tokio::sync::oneshot::Sender<()>,
        fatal: mpsc::Sender<Error>,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        let mut backoff = MIN_BACKOFF;

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            backoff = MIN_BACKOFF;
                            let dispatcher = self.dispatcher.clone();
                            let max_size = self.max_size;
                            tokio::spawn(
                                async move {
                                    if let Err(e) = handle_connection(socket, dispatcher, max_size).await {
                                        warn!(error = %e, "connection error");
                                    }
                                }
                                .instrument(info_span!("binrpc", %peer)),
                            );
                        }
                        Err(e) if is_temporary(&e) => {
                            warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "temporary accept error");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                        Err(e) => {
                            let _ = fatal.send(e.into()).await;
                            break;
                        }
                    }
                }
            }
        }

        let _ = done.send(());
        Ok(())
    }
}

fn is_temporary(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(e.kind(), ConnectionAborted | ConnectionReset | Interrupted | WouldBlock)
}

async fn handle_connection(
    mut socket: TcpStream,
    dispatcher: Arc<Dispatcher>,
    max_size: usize,
) -> Result<(), Error> {
    let mut header = [0u8; hmccu_binrpc::HEADER_LEN];
    socket.read_exact(&mut header).await?;

    let len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
    if len > max_size {
        return Err(Error::OverSize);
    }

    let mut payload = vec![0u8; len];
    socket.read_exact(&mut payload).await?;

    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&payload);

    let response = match hmccu_binrpc::decode_message(&frame, max_size)? {
        Message::Request { method, params } => match dispatcher.dispatch(&method, params).await {
            Ok(v) => hmccu_binrpc::encode_response(&v)?,
            Err(fault) => hmccu_binrpc::encode_fault(&fault)?,
        },
        _ => return Err(Error::Malformed("expected a request message".into())),
    };

    tokio::time::timeout(WRITE_DEADLINE, socket.write_all(&response))
        .await
        .map_err(|_| Error::IO("write deadline exceeded".into()))??;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmccu_proto::Value;

    #[tokio::test]
    async fn serves_one_request_end_to_end() {
        let dispatcher = Arc::new(Dispatcher::new());
        let front = TcpFront::new(dispatcher, hmccu_binrpc::DEFAULT_MAX_SIZE);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);

        let server = tokio::spawn(async move {
            front.serve(addr, stop_rx, done_tx, fatal_tx).await.unwrap();
        });

        // Give the listener a moment to bind.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let req = hmccu_binrpc::encode_request("system.listMethods", &Value::Array(vec![])).unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&req).await.unwrap();

        let mut header = [0u8; hmccu_binrpc::HEADER_LEN];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();

        let mut full = header.to_vec();
        full.extend_from_slice(&payload);
        match hmccu_binrpc::decode_message(&full, hmccu_binrpc::DEFAULT_MAX_SIZE).unwrap() {
            Message::Response(Value::Array(names)) => {
                assert!(names.contains(&Value::String("system.listMethods".into())));
            }
            other => panic!("unexpected response: {:?}", other),
        }

        stop_tx.send(true).unwrap();
        done_rx.await.unwrap();
        server.await.unwrap();
    }
}
