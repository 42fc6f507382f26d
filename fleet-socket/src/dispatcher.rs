//! Routes inbound frames to handlers registered per frame kind.
//!
//! Handlers run synchronously on the connection task, in registration order.
//! One handler failing (by error or panic) never stops the others.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, warn};

use crate::frames::{FrameKind, InboundFrame};

pub type Handler = Arc<dyn Fn(&InboundFrame) -> anyhow::Result<()> + Send + Sync>;

/// Returned by [`MessageDispatcher::on`]; pass it to [`MessageDispatcher::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<FrameKind, Vec<(HandlerId, Handler)>>,
}

#[derive(Clone, Default)]
pub struct MessageDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for frames of `kind`.
    pub fn on<F>(&self, kind: FrameKind, handler: F) -> HandlerId
    where
        F: Fn(&InboundFrame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = HandlerId(registry.next_id);
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn off(&self, kind: &FrameKind, id: HandlerId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = registry.handlers.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            registry.handlers.remove(kind);
        }
        removed
    }

    pub fn handler_count(&self, kind: &FrameKind) -> usize {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.handlers.get(kind).map_or(0, Vec::len)
    }

    fn is_registered(&self, kind: &FrameKind, id: HandlerId) -> bool {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry
            .handlers
            .get(kind)
            .is_some_and(|list| list.iter().any(|(existing, _)| *existing == id))
    }

    /// Deliver `frame` to every handler of its kind. Returns how many handlers
    /// completed without error.
    ///
    /// The handler list is snapshotted so handlers may register or remove
    /// handlers while running. A handler removed mid-dispatch is skipped.
    pub fn dispatch(&self, frame: &InboundFrame) -> usize {
        if !frame.kind.is_known() {
            warn!("dropping frame of unknown type '{}'", frame.kind);
            return 0;
        }

        let snapshot: Vec<(HandlerId, Handler)> = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.handlers.get(&frame.kind).cloned().unwrap_or_default()
        };
        if snapshot.is_empty() {
            debug!("no handlers for '{}'", frame.kind);
            return 0;
        }

        let mut delivered = 0;
        for (id, handler) in snapshot {
            if !self.is_registered(&frame.kind, id) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("handler for '{}' failed: {e:#}", frame.kind),
                Err(_) => error!("handler for '{}' panicked", frame.kind),
            }
        }
        delivered
    }
}
