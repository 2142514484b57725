use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info_span, warn, Instrument};
use warp::http::{Response, StatusCode};
use warp::Filter;

use crate::dispatch::Dispatcher;

/// The HTTP front: one POST handler per mounted path, decoding an
/// XML-RPC call, dispatching it, and encoding the XML-RPC response.
pub struct HttpFront {
    dispatcher: Arc<Dispatcher>,
    max_size: u64,
}

impl HttpFront {
    pub fn new(dispatcher: Arc<Dispatcher>, max_size: u64) -> Self {
        HttpFront { dispatcher, max_size }
    }

    /// Serves forever at `addr`. The caller is expected to race this
    /// future against a shutdown signal.
    pub async fn serve(&self, addr: SocketAddr) {
        let dispatcher = self.dispatcher.clone();
        let max_size = self.max_size;

        let route = warp::post()
            .and(warp::body::content_length_limit(max_size))
            .and(warp::body::bytes())
            .and_then(move |body: bytes::Bytes| {
                let dispatcher = dispatcher.clone();
                async move { Ok::<_, std::convert::Infallible>(handle_request(&dispatcher, &body).await) }
            });

        warp::serve(route).run(addr).instrument(info_span!("httpd", %addr)).await;
    }
}

async fn handle_request(dispatcher: &Dispatcher, body: &[u8]) -> Response<Vec<u8>> {
    let (name, params) = match hmccu_xmlrpc::decode_call(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to decode xml-rpc request");
            return text_response(StatusCode::BAD_REQUEST, Vec::new());
        }
    };

    let encoded = match dispatcher.dispatch(&name, params).await {
        Ok(v) => hmccu_xmlrpc::encode_response(&v),
        Err(fault) => hmccu_xmlrpc::encode_fault(&fault),
    };

    match encoded {
        Ok(bytes) => text_response(StatusCode::OK, bytes),
        Err(e) => {
            error!(error = %e, "failed to encode xml-rpc response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

fn text_response(status: StatusCode, body: Vec<u8>) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/xml")
        .header("Content-Length", body.len().to_string())
        .body(body)
        .expect("well-formed response")
}
