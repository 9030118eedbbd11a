//! Typed publish/subscribe channel between the transfer server and its observers.
//!
//! The bus is an explicit value owned by the lifecycle manager and handed to the
//! server, never a process-wide singleton. Emission is synchronous: handlers run
//! on the emitting task, in registration order, so they must stay cheap.

use crate::transfer_service::ServiceDescriptor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;

// ========================
// Payloads
// ========================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferStartInfo {
    pub file_name: String,
    pub file_size: u64,
    /// 1-based position of the file inside its batch
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgressInfo {
    pub file_name: String,
    /// Fraction in 0.0..=1.0
    pub progress: f64,
    pub received_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferCompleteInfo {
    pub file_name: String,
    pub file_path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferErrorInfo {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Start(TransferStartInfo),
    Progress(TransferProgressInfo),
    Complete(TransferCompleteInfo),
    Error(TransferErrorInfo),
    ServiceStarted(ServiceDescriptor),
    ServiceStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Progress,
    Complete,
    Error,
    ServiceStarted,
    ServiceStopped,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Start,
        EventKind::Progress,
        EventKind::Complete,
        EventKind::Error,
        EventKind::ServiceStarted,
        EventKind::ServiceStopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Progress => "progress",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
            EventKind::ServiceStarted => "service-started",
            EventKind::ServiceStopped => "service-stopped",
        }
    }

    /// Channel name the UI listens on, e.g. `transfer:progress`
    pub fn channel(self) -> String {
        format!("transfer:{}", self.as_str())
    }
}

impl TransferEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransferEvent::Start(_) => EventKind::Start,
            TransferEvent::Progress(_) => EventKind::Progress,
            TransferEvent::Complete(_) => EventKind::Complete,
            TransferEvent::Error(_) => EventKind::Error,
            TransferEvent::ServiceStarted(_) => EventKind::ServiceStarted,
            TransferEvent::ServiceStopped => EventKind::ServiceStopped,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TransferEvent::Error(TransferErrorInfo {
            error: message.into(),
        })
    }

    /// JSON payload as delivered to the UI; `ServiceStopped` carries none.
    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            TransferEvent::Start(info) => serde_json::to_value(info),
            TransferEvent::Progress(info) => serde_json::to_value(info),
            TransferEvent::Complete(info) => serde_json::to_value(info),
            TransferEvent::Error(info) => serde_json::to_value(info),
            TransferEvent::ServiceStarted(descriptor) => serde_json::to_value(descriptor),
            TransferEvent::ServiceStopped => Ok(serde_json::Value::Null),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

// ========================
// Bus
// ========================

type Handler = Arc<dyn Fn(&TransferEvent) + Send + Sync>;

struct Listener {
    id: u64,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Listener>>,
}

impl BusInner {
    fn remove(&self, id: u64) {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| l.id != id);
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Register a handler that sees every event.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Forward every event into an unbounded channel.
    pub fn channel(&self) -> (Subscription, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.on_any(move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Listener { id, kind, handler });

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            disposed: AtomicBool::new(false),
        }
    }

    /// Deliver an event to every matching handler. Events with no listener are dropped.
    pub fn emit(&self, event: TransferEvent) {
        let kind = event.kind();
        // Snapshot so handlers may subscribe or dispose while being called
        let handlers: Vec<Handler> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| l.kind.map_or(true, |k| k == kind))
            .map(|l| l.handler.clone())
            .collect();

        for handler in handlers {
            handler(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle returned by [`EventBus::on`]; `dispose` removes exactly this registration.
///
/// Dropping the handle does not unsubscribe.
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    disposed: AtomicBool,
}

impl Subscription {
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
