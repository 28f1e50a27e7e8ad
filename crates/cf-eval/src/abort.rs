// abort.rs - Run-wide abort signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flag read by the evaluator after every actuator call.
///
/// Policy logic raises it (for instance by defining one of the configured
/// abort classes); the evaluator only reads it. Clones share the same flag,
/// so a nested bundle evaluation sees an abort raised anywhere in the run.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    raised: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Clear the flag; used between independent runs.
    pub fn reset(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }
}
