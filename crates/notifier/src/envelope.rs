//! Typed view of the retry metadata carried in message headers.

use crate::message::{Headers, RETRY_COUNT_HEADER};

/// How many times a message has already been redelivered after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryEnvelope {
    pub attempt_count: u32,
}

impl RetryEnvelope {
    /// Read `x-retry-count`. Absent, negative, fractional, oversized or
    /// non-numeric values all read as 0.
    pub fn from_headers(headers: &Headers) -> Self {
        let attempt_count = headers
            .get(RETRY_COUNT_HEADER)
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        Self { attempt_count }
    }

    /// Deliveries made so far, counting the current one.
    pub fn attempts_made(self) -> u32 {
        self.attempt_count.saturating_add(1)
    }

    pub fn write_to(self, headers: &mut Headers) {
        headers.insert(RETRY_COUNT_HEADER.to_string(), self.attempt_count.into());
    }
}
