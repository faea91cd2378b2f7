use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio_util::sync::CancellationToken;

use super::ContainerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("op#{_0}")]
pub struct OperationId(u64);

pub type OperationCallback<T> = Box<dyn FnOnce(Result<T, ContainerError>) + Send>;

/// Table of in-flight container operations, each cancellable through its token.
///
/// An operation's entry is removed before its callback runs. Cancelling an operation runs its
/// callback once with [`ContainerError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct PendingOperations {
    ops: Arc<Mutex<HashMap<OperationId, CancellationToken>>>,
    next_id: Arc<AtomicU64>,
}

impl PendingOperations {
    pub fn spawn<T, F>(&self, fut: F, callback: Option<OperationCallback<T>>) -> OperationId
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ContainerError>> + Send + 'static,
    {
        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        self.ops.lock().unwrap().insert(id, token.clone()); // unwrap: mutex poisoning is okay

        let ops = self.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(ContainerError::Cancelled),
                result = fut => result,
            };
            ops.remove(id);
            match callback {
                Some(callback) => callback(result),
                None => {
                    if let Err(e) = result {
                        log::debug!("{} failed without anyone listening: {}", id, e);
                    }
                }
            }
        });
        id
    }

    /// Track an operation that fails without doing anything.
    pub fn fail<T: Send + 'static>(&self, error: ContainerError, callback: Option<OperationCallback<T>>) -> OperationId {
        self.spawn(async move { Err(error) }, callback)
    }

    pub fn cancel(&self, id: OperationId) -> bool {
        match self.remove(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let ops: Vec<_> = self.ops.lock().unwrap().drain().collect(); // unwrap: mutex poisoning is okay
        if !ops.is_empty() {
            log::debug!("Cancelling {} pending operations", ops.len());
        }
        for (_, token) in ops {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.ops.lock().unwrap().len() // unwrap: mutex poisoning is okay
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: OperationId) -> Option<CancellationToken> {
        self.ops.lock().unwrap().remove(&id) // unwrap: mutex poisoning is okay
    }
}
