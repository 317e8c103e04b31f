use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::descriptor::FunctionKind;
use crate::core::error::CatalogError;

/// Identifies one call of a wrapper.
#[derive(Debug, Clone)]
pub struct InvocationEvent {
    pub invocation_id: Uuid,
    pub definition: String,
    pub kind: FunctionKind,
}

/// Success or failure of a finished call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure(String),
}

/// Lifecycle hooks an observability layer can attach to a catalog.
///
/// Hooks are shared by every wrapper the catalog hands out and may be called from many
/// tasks at once. None of them runs for a cancelled call.
pub trait InvocationHooks: Send + Sync {
    fn before(&self, _event: &InvocationEvent) {}

    fn after(&self, _event: &InvocationEvent, _outcome: &Outcome, _elapsed: Duration) {}

    fn on_error(&self, _event: &InvocationEvent, _error: &CatalogError) {}

    /// A callable could not be classified and was registered as an opaque pass-through.
    fn on_opaque_fallback(&self, _name: &str, _reason: &CatalogError) {}
}

/// A single entry in the invocation trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub invocation_id: Uuid,
    pub definition: String,
    pub kind: FunctionKind,
    pub outcome: Outcome,
    pub duration_micros: u64,
}

/// Simple in-memory collector for invocations.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    records: Mutex<Vec<InvocationRecord>>,
    opaque: Mutex<Vec<String>>,
    started: AtomicU64,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<InvocationRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names registered as opaque pass-throughs, in registration order.
    pub fn opaque_fallbacks(&self) -> Vec<String> {
        self.opaque
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls that reached `before`, finished or not.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

impl InvocationHooks for MemoryTelemetry {
    fn before(&self, _event: &InvocationEvent) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn after(&self, event: &InvocationEvent, outcome: &Outcome, elapsed: Duration) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(InvocationRecord {
                timestamp,
                invocation_id: event.invocation_id,
                definition: event.definition.clone(),
                kind: event.kind,
                outcome: outcome.clone(),
                duration_micros: elapsed.as_micros() as u64,
            });
    }

    fn on_opaque_fallback(&self, name: &str, _reason: &CatalogError) {
        self.opaque
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
    }
}
