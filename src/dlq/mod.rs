//! Dead-letter routing.
//!
//! Envelopes that exhaust their retries or fail permanently are republished
//! verbatim to `<endpoint><suffix>` with diagnostic headers appended, then
//! the original delivery is acked to stop the retry loop. DLQ consumers see
//! exactly the failed message plus the `x-saga-*` headers.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::envelope::Envelope;
use crate::error::Classification;
use crate::interfaces::transport::{PublishOptions, Result, Transport};

/// Terminal error class of the final failure.
pub const FAILURE_REASON_HEADER: &str = "x-saga-failure-reason";
/// Short human-readable failure text.
pub const FAILURE_MESSAGE_HEADER: &str = "x-saga-failure-message";
/// Number of dispatch attempts made.
pub const ATTEMPTS_HEADER: &str = "x-saga-attempts";
/// First and last failure times, ISO-8601.
pub const FIRST_FAILURE_AT_HEADER: &str = "x-saga-first-failure-at";
pub const LAST_FAILURE_AT_HEADER: &str = "x-saga-last-failure-at";

/// Derive the dead-letter endpoint for an origin endpoint.
pub fn dlq_endpoint(endpoint: &str, suffix: &str) -> String {
    format!("{endpoint}{suffix}")
}

/// Diagnostic record attached to a dead-lettered envelope.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub reason: Classification,
    pub message: String,
    pub attempts: u32,
    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
}

impl FailureInfo {
    /// Start tracking with the first observed failure.
    pub fn first(reason: Classification, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            reason,
            message: message.into(),
            attempts: 1,
            first_failure_at: now,
            last_failure_at: now,
        }
    }

    /// Fold in a subsequent failure.
    pub fn record(&mut self, reason: Classification, message: impl Into<String>) {
        self.reason = reason;
        self.message = message.into();
        self.attempts += 1;
        self.last_failure_at = Utc::now();
    }

    /// Append the diagnostic headers to an envelope.
    pub fn apply_to(&self, envelope: &mut Envelope) {
        envelope
            .headers
            .insert(FAILURE_REASON_HEADER.to_string(), self.reason.as_str().to_string());
        envelope
            .headers
            .insert(FAILURE_MESSAGE_HEADER.to_string(), self.message.clone());
        envelope
            .headers
            .insert(ATTEMPTS_HEADER.to_string(), self.attempts.to_string());
        envelope.headers.insert(
            FIRST_FAILURE_AT_HEADER.to_string(),
            self.first_failure_at.to_rfc3339(),
        );
        envelope.headers.insert(
            LAST_FAILURE_AT_HEADER.to_string(),
            self.last_failure_at.to_rfc3339(),
        );
    }
}

/// Republish a failed envelope to the dead-letter endpoint.
///
/// The payload is untouched; only headers are added. The caller acks the
/// origin delivery once this returns Ok.
pub async fn publish_dead_letter(
    transport: &dyn Transport,
    envelope: &Envelope,
    origin_endpoint: &str,
    suffix: &str,
    failure: &FailureInfo,
) -> Result<()> {
    let endpoint = dlq_endpoint(origin_endpoint, suffix);
    let mut dead = envelope.clone();
    failure.apply_to(&mut dead);

    transport
        .publish(dead, PublishOptions::to_endpoint(&endpoint))
        .await?;

    info!(
        endpoint = %endpoint,
        reason = %failure.reason,
        attempts = failure.attempts,
        "Envelope dead-lettered"
    );
    Ok(())
}
