/// Analytics event name fired once per migration run.
pub const EVENT_STORAGE_MIGRATION: &str = "storage_migration";

/// Fire-and-forget analytics.
pub trait EventSink: Send + Sync {
    fn fire(&self, name: &str, value: &str);
}

/// Emits analytics events into the tracing stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn fire(&self, name: &str, value: &str) {
        tracing::info!(
            target: "storage_migration",
            event = "analytics",
            name,
            value,
        );
    }
}

/// Holder of cached reference-resolution state (resolved media and layer
/// references) that must be dropped once the active root changes.
pub trait ReferenceCache: Send + Sync {
    fn reset(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReferenceCache;

impl ReferenceCache for NoopReferenceCache {
    fn reset(&self) {}
}
