//! Pending-call bookkeeping keyed by request id.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::debug;

use crate::ipc::error::RpcError;
use crate::models::{Response, Status};

/// Completion handle of one pending call.
pub type Completion = oneshot::Sender<Result<Response, RpcError>>;

/// Outstanding request id → completion handle.
///
/// Every registered completion is settled exactly once: by `resolve`,
/// `reject` or `drop_all`.
#[derive(Debug, Default)]
pub struct Registry {
    pending: HashMap<String, Completion>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call.
    ///
    /// A duplicate id is refused: the new completion is settled with
    /// `DuplicateRequestId` and the existing entry stays untouched.
    pub fn register(&mut self, id: impl Into<String>, completion: Completion) -> Result<(), RpcError> {
        let id = id.into();
        if self.pending.contains_key(&id) {
            let _ = completion.send(Err(RpcError::DuplicateRequestId(id.clone())));
            return Err(RpcError::DuplicateRequestId(id));
        }
        self.pending.insert(id, completion);
        Ok(())
    }

    /// Settle the call matching `response.id`.
    ///
    /// Hands the response back when no call is waiting for it.
    pub fn resolve(&mut self, response: Response) -> Result<(), Response> {
        let Some(completion) = response.id.as_ref().and_then(|id| self.pending.remove(id)) else {
            return Err(response);
        };

        let outcome = match response.status {
            Status::Success => Ok(response),
            Status::Fail => Err(RpcError::engine(response.error_message())),
        };
        if completion.send(outcome).is_err() {
            debug!("Caller dropped before its response arrived");
        }
        Ok(())
    }

    /// Reject one pending call. Returns `false` if it was not pending.
    pub fn reject(&mut self, id: &str, error: RpcError) -> bool {
        match self.pending.remove(id) {
            Some(completion) => {
                let _ = completion.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every pending call with a copy of `error`. Returns how many.
    pub fn drop_all(&mut self, error: RpcError) -> usize {
        let count = self.pending.len();
        for (_, completion) in self.pending.drain() {
            let _ = completion.send(Err(error.duplicate()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}
