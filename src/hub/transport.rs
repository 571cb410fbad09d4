//! Transport seam between the hub and concrete socket frameworks.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors a transport can report. The hub treats every failure as a
/// disconnect; it never propagates them further.
#[derive(Debug, Error, Diagnostic)]
pub enum TransportError {
    #[error("transport closed")]
    #[diagnostic(code(echelon::hub::transport_closed))]
    Closed,

    #[error("send failed: {message}")]
    #[diagnostic(code(echelon::hub::send_failed))]
    SendFailed { message: String },
}

/// One client's outbound channel.
///
/// Embedders implement this over their socket of choice (axum/tungstenite
/// WebSocket, SSE, ...). Within one transport, sends preserve order.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn send_text(&self, payload: String) -> Result<(), TransportError>;

    /// Close the connection with a status code and reason.
    async fn close(&self, code: u16, reason: &str);
}

/// In-memory transport over a flume channel.
///
/// The receiving half yields every wire payload in send order, which
/// makes assertions on broadcast traffic straightforward:
///
/// ```rust,no_run
/// use echelon::hub::{ChannelTransport, ClientTransport};
///
/// # async fn example() {
/// let (transport, rx) = ChannelTransport::pair();
/// transport.send_text("ping".into()).await.unwrap();
/// assert_eq!(rx.recv_async().await.unwrap(), "ping");
/// # }
/// ```
pub struct ChannelTransport {
    tx: flume::Sender<String>,
    closed: AtomicBool,
    close_frame: Mutex<Option<(u16, String)>>,
}

impl ChannelTransport {
    /// Create a transport plus the receiver observing its traffic.
    pub fn pair() -> (Arc<Self>, flume::Receiver<String>) {
        let (tx, rx) = flume::unbounded();
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
                close_frame: Mutex::new(None),
            }),
            rx,
        )
    }

    /// The close code and reason, when the hub closed this transport.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.close_frame.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn send_text(&self, payload: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send_async(payload)
            .await
            .map_err(|e| TransportError::SendFailed {
                message: e.to_string(),
            })
    }

    async fn close(&self, code: u16, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        *self.close_frame.lock() = Some((code, reason.to_string()));
    }
}

/// Transport that fails every send; used to exercise the hub's
/// failure-is-disconnect policy in tests.
#[derive(Default)]
pub struct DeadTransport;

#[async_trait]
impl ClientTransport for DeadTransport {
    async fn send_text(&self, _payload: String) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }

    async fn close(&self, _code: u16, _reason: &str) {}
}
