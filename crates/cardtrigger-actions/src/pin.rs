//! PIN handoff between the dispatcher and an interactive surface.
//!
//! The dispatcher runs on a plain thread and blocks until the surface answers.
//! The surface is usually async: it receives [`PinRequest`]s from
//! [`PinRequests::recv`] and answers each one exactly once with
//! [`PinRequest::supply_pin`]. Dropping a request without answering it
//! cancels it.
//!
//! ```text
//!  dispatcher thread                       surface task
//!  ─────────────────                       ────────────
//!  request_pin() ──── PinRequest (1 slot) ──► recv()
//!       │                                      │ prompt
//!       ▼                                      ▼
//!  blocks ◄───────── oneshot reply ─────── supply_pin("1234")
//! ```

use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

use crate::error::PinError;

/// Requesting side of the handoff. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PinHandoff {
    requests: mpsc::Sender<PinRequest>,
}

impl PinHandoff {
    /// Create a handoff and the receiver the surface listens on.
    ///
    /// The channel holds a single outstanding request.
    pub fn new() -> (Self, PinRequests) {
        let (tx, rx) = mpsc::channel(1);
        (Self { requests: tx }, PinRequests { rx })
    }

    /// Ask the surface for the PIN of the card in `reader` and block until it
    /// answers.
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PinError::SurfaceClosed`] if the surface is gone and
    /// [`PinError::Cancelled`] if it dropped the request.
    pub fn request_pin(&self, reader: &str, batch: Uuid) -> Result<SecretString, PinError> {
        let (reply, answer) = oneshot::channel();
        let request = PinRequest {
            reader: reader.to_string(),
            batch,
            reply,
        };

        info!(reader = %reader, batch = %batch, "Requesting PIN");
        self.requests
            .blocking_send(request)
            .map_err(|_| PinError::SurfaceClosed)?;
        answer.blocking_recv().map_err(|_| PinError::Cancelled)
    }
}

/// Receiving side of the handoff, held by the surface.
#[derive(Debug)]
pub struct PinRequests {
    rx: mpsc::Receiver<PinRequest>,
}

impl PinRequests {
    /// Wait for the next request. Returns `None` once every [`PinHandoff`]
    /// is gone.
    pub async fn recv(&mut self) -> Option<PinRequest> {
        self.rx.recv().await
    }

    /// Blocking variant of [`recv`](Self::recv) for surfaces running on a
    /// plain thread.
    pub fn blocking_recv(&mut self) -> Option<PinRequest> {
        self.rx.blocking_recv()
    }

    /// Take a pending request without waiting.
    pub fn try_recv(&mut self) -> Option<PinRequest> {
        self.rx.try_recv().ok()
    }
}

/// One outstanding PIN request.
#[derive(Debug)]
pub struct PinRequest {
    reader: String,
    batch: Uuid,
    reply: oneshot::Sender<SecretString>,
}

impl PinRequest {
    /// Reader holding the card the PIN is for.
    pub fn reader(&self) -> &str {
        &self.reader
    }

    pub fn batch(&self) -> Uuid {
        self.batch
    }

    /// Answer the request. Returns `false` if the requester stopped waiting.
    pub fn supply_pin(self, pin: SecretString) -> bool {
        self.reply.send(pin).is_ok()
    }

    /// Decline the request.
    pub fn cancel(self) {}
}
