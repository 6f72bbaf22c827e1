//! Index sessions.
//!
//! A session is the single-owner context for one logical flow: one store
//! session per registered group (type-erased; each group downcasts its
//! own), one liveness session on the primary store, and a poisoned flag.
//! Sessions are not thread-safe — concurrency comes from running many
//! sessions in parallel, synchronized by the stores' hash-table CAS and
//! version machinery.

use std::any::Any;

use crate::error::{ChaindexError, Result};
use crate::primary::LivenessSession;

/// Per-flow state across every group of an index.
pub struct IndexSession {
    pub(crate) states: Vec<Box<dyn Any + Send>>,
    pub(crate) liveness: LivenessSession,
    pub(crate) poisoned: bool,
}

impl IndexSession {
    pub(crate) fn new(states: Vec<Box<dyn Any + Send>>) -> Self {
        IndexSession {
            states,
            liveness: LivenessSession::new(),
            poisoned: false,
        }
    }

    /// This flow's liveness session on the primary store. Queries issued on
    /// this session drive their liveness checks through it.
    pub fn liveness(&self) -> &LivenessSession {
        &self.liveness
    }

    /// Whether an earlier internal failure (e.g. a predicate panic) has
    /// poisoned this session. Poisoned sessions refuse every operation.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub(crate) fn ensure_usable(&self, group_count: usize) -> Result<()> {
        if self.poisoned {
            return Err(ChaindexError::InvalidOperation(
                "session poisoned by an earlier failure".into(),
            ));
        }
        if self.states.len() != group_count {
            return Err(ChaindexError::InvalidOperation(format!(
                "session holds {} group states but the index has {group_count} groups; \
                 create sessions after registration",
                self.states.len()
            )));
        }
        Ok(())
    }
}
