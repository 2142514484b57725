use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use hmccu_binrpc::Message;
use hmccu_proto::{Error, Fault, Value};

const READ_DEADLINE: Duration = Duration::from_secs(15);

/// Something that can make a single RPC call and get a [`Value`] back.
/// A handler-raised fault surfaces as [`Error::MethodError`].
#[async_trait]
pub trait Caller: Send + Sync {
    async fn call(&self, method: &str, params: &Value) -> Result<Value, Error>;
}

fn fault_to_error(f: Fault) -> Error {
    Error::MethodError {
        code: f.code,
        message: f.message,
    }
}

/// Calls a Controller interface process over XML-RPC-over-HTTP.
pub struct XmlClient {
    http: reqwest::Client,
    url: String,
    max_response: usize,
}

impl XmlClient {
    pub fn new(url: impl Into<String>, max_response: usize) -> Self {
        XmlClient {
            http: reqwest::Client::new(),
            url: url.into(),
            max_response,
        }
    }
}

#[async_trait]
impl Caller for XmlClient {
    async fn call(&self, method: &str, params: &Value) -> Result<Value, Error> {
        let body = hmccu_xmlrpc::encode_call(method, params)?;

        let resp = self
            .http
            .post(&self.url)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::IO(e.to_string()))?;

        let bytes = resp.bytes().await.map_err(|e| Error::IO(e.to_string()))?;
        if bytes.len() > self.max_response {
            return Err(Error::OverSize);
        }

        match hmccu_xmlrpc::decode_response(&bytes)? {
            Ok(v) => Ok(v),
            Err(f) => Err(fault_to_error(f)),
        }
    }
}

/// Calls a Controller interface process over BIN-RPC-over-TCP. Each
/// call opens a fresh connection, grounded on the Controller's own
/// short-lived per-call connections.
pub struct BinClient {
    addr: String,
    max_response: usize,
}

impl BinClient {
    pub fn new(addr: impl Into<String>, max_response: usize) -> Self {
        BinClient {
            addr: addr.into(),
            max_response,
        }
    }
}

#[async_trait]
impl Caller for BinClient {
    async fn call(&self, method: &str, params: &Value) -> Result<Value, Error> {
        let request = hmccu_binrpc::encode_request(method, params)?;

        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::IO(e.to_string()))?;
        stream
            .write_all(&request)
            .await
            .map_err(|e| Error::IO(e.to_string()))?;

        let read = tokio::time::timeout(READ_DEADLINE, async {
            let mut header = [0u8; hmccu_binrpc::HEADER_LEN];
            stream.read_exact(&mut header).await?;

            let len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await?;

            let mut frame = header.to_vec();
            frame.extend_from_slice(&payload);
            Ok::<Vec<u8>, std::io::Error>(frame)
        })
        .await
        .map_err(|_| Error::IO("read deadline exceeded".into()))?
        .map_err(|e| Error::IO(e.to_string()))?;

        if read.len() > self.max_response {
            return Err(Error::OverSize);
        }

        match hmccu_binrpc::decode_message(&read, self.max_response)? {
            Message::Response(v) => Ok(v),
            Message::Fault(f) => Err(fault_to_error(f)),
            Message::Request { .. } => Err(Error::Malformed("expected a response or fault".into())),
        }
    }
}

#[async_trait]
impl Caller for Box<dyn Caller> {
    async fn call(&self, method: &str, params: &Value) -> Result<Value, Error> {
        (**self).call(method, params).await
    }
}

/// Wraps a [`Caller`] with a fixed number of retries, each separated by
/// a fixed delay. The delay is cancellable: a retry in progress gives
/// up early if `cancel` flips to `true`, rather than sleeping it out.
pub struct RetryingCaller<C> {
    inner: C,
    retries: usize,
    delay: Duration,
}

impl<C: Caller> RetryingCaller<C> {
    pub fn new(inner: C, retries: usize, delay: Duration) -> Self {
        RetryingCaller { inner, retries, delay }
    }

    pub async fn call(
        &self,
        method: &str,
        params: &Value,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Value, Error> {
        let mut attempt = 0;
        loop {
            match self.inner.call(method, params).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= self.retries => return Err(e),
                Err(_) => {
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        changed = cancel.changed() => {
                            if changed.is_err() || *cancel.borrow() {
                                continue;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl Caller for &AlwaysFails {
        async fn call(&self, _method: &str, _params: &Value) -> Result<Value, Error> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(Error::IO("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn retrying_caller_gives_up_after_configured_retries() {
        let inner = AlwaysFails(std::sync::atomic::AtomicUsize::new(0));
        let caller = RetryingCaller::new(&inner, 2, Duration::from_millis(1));
        let (_tx, rx) = watch::channel(false);

        let result = caller.call("ping", &Value::Array(vec![]), rx).await;
        assert!(result.is_err());
        assert_eq!(inner.0.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    struct SucceedsOnThirdTry(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl Caller for &SucceedsOnThirdTry {
        async fn call(&self, _method: &str, _params: &Value) -> Result<Value, Error> {
            let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < 2 {
                Err(Error::IO("not yet".into()))
            } else {
                Ok(Value::Bool(true))
            }
        }
    }

    #[tokio::test]
    async fn retrying_caller_returns_first_success() {
        let inner = SucceedsOnThirdTry(std::sync::atomic::AtomicUsize::new(0));
        let caller = RetryingCaller::new(&inner, 5, Duration::from_millis(1));
        let (_tx, rx) = watch::channel(false);

        let result = caller.call("ping", &Value::Array(vec![]), rx).await;
        assert_eq!(result.unwrap(), Value::Bool(true));
    }
}
