//! Answers of the panel daemon to client commands.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// What the client prints once its command ran: the output, or why the command failed.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum DaemonResponse {
    Success(String),
    Failure(String),
}

impl DaemonResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, DaemonResponse::Success(_))
    }
}

impl<T: std::fmt::Display> From<anyhow::Result<T>> for DaemonResponse {
    fn from(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(output) => DaemonResponse::Success(output.to_string()),
            // the whole context chain, on one line
            Err(e) => DaemonResponse::Failure(format!("{:#}", e)),
        }
    }
}

/// Carries the answer to a single command back to the IPC connection it came from.
#[derive(Debug)]
pub struct Responder(oneshot::Sender<DaemonResponse>);

pub type ResponseReceiver = oneshot::Receiver<DaemonResponse>;

pub fn channel() -> (Responder, ResponseReceiver) {
    let (sender, recv) = oneshot::channel();
    (Responder(sender), recv)
}

impl Responder {
    /// Answer the command. Clients that stopped waiting are skipped.
    pub fn respond(self, response: impl Into<DaemonResponse>) {
        if let Err(response) = self.0.send(response.into()) {
            log::debug!("Client left before it got its answer: {}", response);
        }
    }
}
