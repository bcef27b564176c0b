//! Async TCP server using Tokio.
//!
//! Accepts TCP connections, frames HTTP/1.1 requests and hands the ones the
//! application may see to a shared [`Dispatcher`]. Persistent connections
//! (keep-alive) are supported; requests on one connection are handled in
//! order.

use std::future::{self, Future};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Default limit on the size of one buffered request (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The webby HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use webby::app::AppError;
/// use webby::context::WebRequest;
/// use webby::dispatcher::Dispatcher;
/// use webby::server::Server;
/// use webby::template::FileTemplates;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let app = |req: &mut WebRequest| -> Result<(), AppError> {
///         req.set_text_content("Hello!");
///         Ok(())
///     };
///     let dispatcher = Dispatcher::new(Box::new(app), Arc::new(FileTemplates::new("templates")));
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(Arc::new(dispatcher)).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_request_bytes: usize,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            max_request_bytes: MAX_REQUEST_SIZE,
        })
    }

    /// Requests larger than `limit` bytes (head plus body) are answered with 413.
    #[must_use]
    pub fn with_max_request_bytes(mut self, limit: usize) -> Self {
        self.max_request_bytes = limit;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, dispatcher: Arc<Dispatcher>) -> Result<(), ServerError> {
        self.run_until(dispatcher, future::pending()).await
    }

    /// Serves until `shutdown` resolves, then destroys the application.
    ///
    /// Connections already accepted keep running on their own tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_until<S>(
        self,
        dispatcher: Arc<Dispatcher>,
        shutdown: S,
    ) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(address = %self.local_addr, "webby listening");

        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let dispatcher = Arc::clone(&dispatcher);
            let limit = self.max_request_bytes;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, dispatcher, limit).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }

        info!(address = %self.local_addr, "shutting down");
        dispatcher.destroy();
        Ok(())
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, framing one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    max_request_bytes: usize,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if buf.len() > max_request_bytes {
                    return reject_too_large(&mut stream, peer_addr).await;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    return Ok(());
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::text(StatusCode::BAD_REQUEST, format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                return Ok(());
            }
        };

        let total = match body_offset.checked_add(request.content_length().unwrap_or(0)) {
            Some(total) if total <= max_request_bytes => total,
            _ => return reject_too_large(&mut stream, peer_addr).await,
        };
        while buf.len() < total {
            if stream.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "connection closed mid-body");
                return Ok(());
            }
        }

        let mut frame = buf.split_to(total);
        let body = frame.split_off(body_offset).freeze();
        let request = request.with_body(body);
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = respond(&dispatcher, request, peer_addr)
            .await
            .keep_alive(keep_alive);
        response.write_to(&mut stream).await?;
        stream.flush().await?;

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            return Ok(());
        }
    }
}

/// Applies the transport gate, then dispatches.
///
/// Only GET and POST under the mount prefix reach the application.
async fn respond(dispatcher: &Dispatcher, request: Request, peer_addr: SocketAddr) -> Response {
    if !request.method().is_dispatchable() {
        return Response::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
            .header("Allow", "GET, POST");
    }
    if !dispatcher.is_mounted(request.path()) {
        return Response::text(StatusCode::NOT_FOUND, "Not Found");
    }

    match dispatcher.dispatch(request).await {
        Ok(response) => response,
        Err(e) => {
            error!(peer = %peer_addr, error = %e, "cannot render response");
            Response::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

async fn reject_too_large(stream: &mut TcpStream, peer_addr: SocketAddr) -> Result<(), std::io::Error> {
    warn!(peer = %peer_addr, "request too large, sending 413");
    let response = Response::text(StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large")
        .keep_alive(false);
    stream.write_all(&response.into_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppError;
    use crate::context::WebRequest;
    use crate::template::FileTemplates;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn dispatcher() -> Dispatcher {
        let app = |req: &mut WebRequest| -> Result<(), AppError> {
            match req.path() {
                "broken" => req.set_template("does-not-exist.html"),
                path => {
                    let text = format!("{} {path}", req.method());
                    req.set_text_content(text);
                }
            }
            Ok(())
        };
        Dispatcher::new(Box::new(app), Arc::new(FileTemplates::new("/nonexistent-webby-templates")))
            .with_mount("/app")
    }

    fn request(raw: &str) -> Request {
        Request::from_bytes(raw.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn dispatches_get_and_post_under_mount() {
        let d = dispatcher();

        let response = respond(&d, request("GET /app/x HTTP/1.1\r\n\r\n"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&response.body_bytes()[..], b"GET x");

        let response = respond(&d, request("POST /app/y HTTP/1.1\r\nContent-Length: 0\r\n\r\n"), peer()).await;
        assert_eq!(&response.body_bytes()[..], b"POST y");
    }

    #[tokio::test]
    async fn other_methods_are_405() {
        let d = dispatcher();
        for method in ["PUT", "DELETE", "PATCH", "OPTIONS"] {
            let raw = format!("{method} /app/x HTTP/1.1\r\n\r\n");
            let response = respond(&d, request(&raw), peer()).await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{method}");
            assert_eq!(response.header_value("allow"), Some("GET, POST"));
        }
    }

    #[tokio::test]
    async fn outside_mount_is_404() {
        let d = dispatcher();
        let response = respond(&d, request("GET /elsewhere HTTP/1.1\r\n\r\n"), peer()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(&response.body_bytes()[..], b"Not Found");
    }

    #[tokio::test]
    async fn render_failure_is_500_without_detail() {
        let d = dispatcher();
        let response = respond(&d, request("GET /app/broken HTTP/1.1\r\n\r\n"), peer()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&response.body_bytes()[..], b"Internal Server Error");
    }
}
