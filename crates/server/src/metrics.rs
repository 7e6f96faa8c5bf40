use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    events_ingress: AtomicU64,
    events_egress: AtomicU64,
    messages_relayed: AtomicU64,
    calls_started: AtomicU64,
    calls_ended: AtomicU64,
    errors_emitted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_active: u64,
    pub events_ingress: u64,
    pub events_egress: u64,
    pub messages_relayed: u64,
    pub calls_started: u64,
    pub calls_ended: u64,
    pub errors_emitted: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.events_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.events_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_message_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_ended(&self) {
        self.calls_ended.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_error(&self) {
        self.errors_emitted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_active: self.connections_active.load(Ordering::SeqCst),
            events_ingress: self.events_ingress.load(Ordering::SeqCst),
            events_egress: self.events_egress.load(Ordering::SeqCst),
            messages_relayed: self.messages_relayed.load(Ordering::SeqCst),
            calls_started: self.calls_started.load(Ordering::SeqCst),
            calls_ended: self.calls_ended.load(Ordering::SeqCst),
            errors_emitted: self.errors_emitted.load(Ordering::SeqCst),
        }
    }
}
