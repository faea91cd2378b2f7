//! Shutdown of the panel daemon.
//!
//! Shutdown is a state rather than an event, so tasks that only start waiting after it was
//! requested still stop.

use once_cell::sync::Lazy;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ShutdownReason {
    #[display("killed by a client")]
    KillCommand,
    #[display("interrupted")]
    Interrupt,
    #[display("terminated")]
    Terminate,
}

impl ShutdownReason {
    pub fn from_signals(signals: &[simple_signal::Signal]) -> Self {
        if signals.contains(&simple_signal::Signal::Term) {
            ShutdownReason::Terminate
        } else {
            ShutdownReason::Interrupt
        }
    }
}

pub struct Shutdown(watch::Sender<Option<ShutdownReason>>);

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown(watch::channel(None).0)
    }
}

impl Shutdown {
    /// Ask every task to stop. Only the first reason counts, returns whether this was it.
    pub fn request(&self, reason: ShutdownReason) -> bool {
        self.0.send_if_modified(|current| match current {
            Some(_) => false,
            None => {
                *current = Some(reason);
                true
            }
        })
    }

    pub fn requested(&self) -> Option<ShutdownReason> {
        *self.0.borrow()
    }

    /// Resolves once shutdown was requested, right away if it already was.
    pub async fn wait(&self) -> ShutdownReason {
        let mut recv = self.0.subscribe();
        loop {
            if let Some(reason) = *recv.borrow_and_update() {
                return reason;
            }
            // the sender lives as long as `self`
            let _ = recv.changed().await;
        }
    }
}

static DAEMON: Lazy<Shutdown> = Lazy::new(Shutdown::default);

/// Stop the daemon.
pub fn request(reason: ShutdownReason) {
    if DAEMON.request(reason) {
        log::info!("Shutting down cafe-panel daemon: {}", reason);
    }
}

pub async fn wait() -> ShutdownReason {
    DAEMON.wait().await
}

/// Select in a loop, breaking once the daemon is shutting down.
#[macro_export]
macro_rules! loop_select_until_shutdown {
    ($($content:tt)*) => {
        loop {
            tokio::select! {
                _ = $crate::shutdown::wait() => {
                    break;
                }
                $($content)*
            }
        }
    };
}
