// src/emergency.rs - Latched emergency stop
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
struct EmergencyInner {
    active: AtomicBool,
    cause: ArcSwapOption<String>,
    triggers: AtomicU64,
}

/// Latched safety override shared by every context that can detect a fault.
///
/// `trigger` never blocks and may be called from the feedback callback, the
/// control task, the publisher or a user handle. While active the control
/// loop only emits hold frames. The latch clears on an explicit `reset` only.
#[derive(Debug, Clone, Default)]
pub struct EmergencyStop {
    inner: Arc<EmergencyInner>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the stop. The first cause is kept until reset; later triggers
    /// only bump the counter.
    pub fn trigger(&self, cause: impl Into<String>) {
        let cause = cause.into();
        self.inner.triggers.fetch_add(1, Ordering::Relaxed);
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner.cause.store(Some(Arc::new(cause.clone())));
            tracing::error!("Emergency stop triggered: {}", cause);
        } else {
            tracing::debug!("Emergency stop already active, ignoring cause: {}", cause);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn cause(&self) -> Option<String> {
        self.inner.cause.load_full().map(|cause| cause.as_ref().clone())
    }

    /// Number of trigger calls since creation, including ignored repeats.
    pub fn trigger_count(&self) -> u64 {
        self.inner.triggers.load(Ordering::Relaxed)
    }

    /// Clear the latch. Returns `false` if it was not active.
    pub fn reset(&self) -> bool {
        self.inner.cause.store(None);
        let was_active = self.inner.active.swap(false, Ordering::AcqRel);
        if was_active {
            tracing::warn!("Emergency stop reset");
        }
        was_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_latches_first_cause() {
        let stop = EmergencyStop::new();
        assert!(!stop.is_active());
        stop.trigger("operator");
        stop.trigger("publish failure");
        assert!(stop.is_active());
        assert_eq!(stop.cause().as_deref(), Some("operator"));
        assert_eq!(stop.trigger_count(), 2);
    }

    #[test]
    fn test_reset_clears_state() {
        let stop = EmergencyStop::new();
        assert!(!stop.reset());
        stop.trigger("test");
        assert!(stop.reset());
        assert!(!stop.is_active());
        assert_eq!(stop.cause(), None);
        stop.trigger("again");
        assert_eq!(stop.cause().as_deref(), Some("again"));
    }

    #[test]
    fn test_clones_share_state() {
        let stop = EmergencyStop::new();
        let other = stop.clone();
        let handle = std::thread::spawn(move || other.trigger("from thread"));
        handle.join().unwrap();
        assert!(stop.is_active());
    }
}
