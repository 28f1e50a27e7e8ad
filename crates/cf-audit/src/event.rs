// event.rs - One promise outcome, one line in the outcome log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cf_eval::PromiseResult;

/// The outcome of actuating one promise during one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub event_id: Uuid,

    /// Agent run this outcome belongs to.
    pub run_id: Uuid,

    pub timestamp: DateTime<Utc>,

    /// Qualified bundle name (`namespace:name`).
    pub bundle: String,

    pub promise_type: String,

    pub promiser: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,

    pub result: PromiseResult,

    pub pass: usize,

    /// Free-form detail from the actuator (what changed, why it failed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Hash of the previous line; `None` for the first event in the file.
    pub previous_hash: Option<String>,
}

impl OutcomeEvent {
    pub fn new(
        run_id: Uuid,
        bundle: impl Into<String>,
        promise_type: impl Into<String>,
        promiser: impl Into<String>,
        result: PromiseResult,
        pass: usize,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            run_id,
            timestamp: Utc::now(),
            bundle: bundle.into(),
            promise_type: promise_type.into(),
            promiser: promiser.into(),
            handle: None,
            result,
            pass,
            message: None,
            previous_hash: None,
        }
    }

    pub fn with_handle(mut self, handle: Option<String>) -> Self {
        self.handle = handle;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
