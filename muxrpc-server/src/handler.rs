//! Service handlers and the one-shot completion callback.

use bytes::Bytes;
use muxrpc_protocol::Response;
use tokio::sync::{mpsc, OwnedSemaphorePermit};

/// Error message sent when a handler drops its callback without completing it.
pub const DROPPED_CALLBACK_MESSAGE: &str = "handler dropped the call without completing it";

/// A service handler.
///
/// `handle` runs on its own task for every inbound call. It must hand the
/// outcome to `callback`, either before returning or later from another
/// task. Handlers doing blocking work should move it to
/// `tokio::task::spawn_blocking` and complete the callback from there.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, method: String, param: Bytes, callback: Callback);
}

impl<F> Handler for F
where
    F: Fn(String, Bytes, Callback) + Send + Sync + 'static,
{
    fn handle(&self, method: String, param: Bytes, callback: Callback) {
        self(method, param, callback)
    }
}

/// A response on its way to the connection writer.
pub(crate) struct Outgoing {
    pub(crate) response: Response,
    /// In-flight slot held until the response has been written.
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

/// One-shot handle through which a handler reports the outcome of a call.
///
/// Completing consumes the callback. Dropping it uncompleted (including
/// when the handler panics) answers the caller with an error.
pub struct Callback {
    id: i64,
    tx: Option<mpsc::UnboundedSender<Outgoing>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Callback {
    pub(crate) fn new(
        id: i64,
        tx: mpsc::UnboundedSender<Outgoing>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            id,
            tx: Some(tx),
            permit,
        }
    }

    /// Request id of the call this callback answers.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Completes the call with a result or an error message.
    pub fn complete(mut self, outcome: Result<Bytes, String>) {
        self.send(outcome);
    }

    /// Completes the call successfully.
    pub fn success(self, result: impl Into<Bytes>) {
        self.complete(Ok(result.into()))
    }

    /// Completes the call with an error message.
    pub fn failure(self, message: impl Into<String>) {
        self.complete(Err(message.into()))
    }

    fn send(&mut self, outcome: Result<Bytes, String>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let outgoing = Outgoing {
            response: Response::new(self.id, outcome),
            permit: self.permit.take(),
        };
        if tx.send(outgoing).is_err() {
            tracing::debug!("Connection gone, dropping response id={}", self.id);
        }
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::warn!("Call id={} dropped without completion", self.id);
            self.send(Err(DROPPED_CALLBACK_MESSAGE.to_string()));
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("id", &self.id)
            .field("completed", &self.tx.is_none())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_callback(id: i64) -> (Callback, mpsc::UnboundedReceiver<Outgoing>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Callback::new(id, tx, None), rx)
}
