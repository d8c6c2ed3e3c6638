use crate::useragent::SessionId;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Allows a single in-flight answer operation.
///
/// Acquisition fails closed and never queues: a second trigger while an
/// answer is running is dropped, whether it targets the same session or
/// another one.
#[derive(Debug, Default)]
pub struct AnswerGuard {
    owner: Mutex<Option<SessionId>>,
}

impl AnswerGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin_answer(&self, session_id: &SessionId) -> bool {
        let mut owner = match self.owner.lock() {
            Ok(owner) => owner,
            Err(poisoned) => poisoned.into_inner(),
        };
        match owner.as_ref() {
            Some(current) => {
                debug!(%session_id, owner = %current, "answer already in progress");
                false
            }
            None => {
                *owner = Some(session_id.clone());
                true
            }
        }
    }

    /// Release the guard if `session_id` holds it. Repeated calls are no-ops.
    pub fn end_answer(&self, session_id: &SessionId) {
        let mut owner = match self.owner.lock() {
            Ok(owner) => owner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if owner.as_ref() == Some(session_id) {
            *owner = None;
        }
    }

    pub fn owner(&self) -> Option<SessionId> {
        match self.owner.lock() {
            Ok(owner) => owner.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Scoped acquisition, released when the permit is dropped.
    pub fn permit(self: &Arc<Self>, session_id: &SessionId) -> Option<AnswerPermit> {
        if self.try_begin_answer(session_id) {
            Some(AnswerPermit {
                guard: self.clone(),
                session_id: session_id.clone(),
            })
        } else {
            None
        }
    }
}

pub struct AnswerPermit {
    guard: Arc<AnswerGuard>,
    session_id: SessionId,
}

impl AnswerPermit {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Drop for AnswerPermit {
    fn drop(&mut self) {
        self.guard.end_answer(&self.session_id);
    }
}
