use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;
use uuid::Uuid;

use crate::domain::TelemetryReport;

pub type ReportCallback = Arc<dyn Fn(&TelemetryReport) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Callback(ReportCallback),
    Channel(mpsc::Sender<TelemetryReport>),
}

/// Ordered list of report subscribers keyed by a generated token.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    entries: Arc<Mutex<Vec<(Uuid, Sink)>>>,
    /// Reports a channel subscriber missed because its buffer was full.
    dropped: Arc<AtomicU64>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(Uuid, Sink)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TelemetryReport) + Send + Sync + 'static,
    {
        self.register(Sink::Callback(Arc::new(callback)))
    }

    /// Channel flavoured subscription: the caller owns the receiving end.
    pub fn subscribe_channel(&self, capacity: usize) -> ReportStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscription = self.register(Sink::Channel(tx));
        ReportStream { rx, subscription }
    }

    fn register(&self, sink: Sink) -> Subscription {
        let id = Uuid::new_v4();
        self.entries().push((id, sink));
        Subscription {
            id,
            registry: self.clone(),
        }
    }

    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(entry_id, _)| entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn dropped_reports(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Hands `report` to every subscriber registered at call time, in
    /// registration order. Returns how many subscribers accepted it.
    pub fn notify(&self, report: &TelemetryReport) -> usize {
        // never run callbacks under the lock: they may unsubscribe
        let targets = self.entries().clone();

        let mut delivered = 0;
        let mut stale = Vec::new();
        for (id, sink) in targets {
            match sink {
                Sink::Callback(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| (*callback)(report))) {
                        Ok(()) => delivered += 1,
                        Err(_) => warn!(%id, "subscriber panicked while handling report"),
                    }
                }
                Sink::Channel(tx) => match tx.try_send(report.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(%id, total, "subscriber channel full; report dropped for it")
                    }
                    Err(TrySendError::Closed(_)) => stale.push(id),
                },
            }
        }

        if !stale.is_empty() {
            self.entries().retain(|(id, _)| !stale.contains(id));
        }

        delivered
    }
}

/// Registration handle. Dropping it (or calling [`Subscription::unsubscribe`])
/// removes exactly the subscriber it was issued for.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: Uuid,
    registry: SubscriberRegistry,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.id);
    }
}

/// Receiving end of a channel subscription.
pub struct ReportStream {
    rx: mpsc::Receiver<TelemetryReport>,
    subscription: Subscription,
}

impl ReportStream {
    pub async fn recv(&mut self) -> Option<TelemetryReport> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TelemetryReport> {
        self.rx.try_recv().ok()
    }

    pub fn id(&self) -> Uuid {
        self.subscription.id()
    }
}
