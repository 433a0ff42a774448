use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Retry bookkeeping for one recipient of a queued message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientState {
    #[serde(rename = "Attempts")]
    pub attempts: u32,
    #[serde(rename = "NextAttempt")]
    pub next_attempt: DateTime<Utc>,
    #[serde(rename = "LastErr", default, skip_serializing_if = "Option::is_none")]
    pub last_err: Option<String>,
}

/// The `.meta` document of one queue entry. A live entry always has at
/// least one recipient; the entry is deleted when the last one
/// resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(rename = "DeliveryID")]
    pub delivery_id: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Recipients")]
    pub recipients: BTreeMap<String, RecipientState>,
    #[serde(rename = "Tries")]
    pub tries: u32,
    #[serde(rename = "FirstAttempt")]
    pub first_attempt: DateTime<Utc>,
    #[serde(rename = "LastAttempt")]
    pub last_attempt: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new<F: Into<String>, I: IntoIterator<Item = String>>(
        delivery_id: String,
        from: F,
        rcpts: I,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            delivery_id,
            from: from.into(),
            recipients: rcpts
                .into_iter()
                .map(|rcpt| {
                    (
                        rcpt,
                        RecipientState {
                            attempts: 0,
                            next_attempt: now,
                            last_err: None,
                        },
                    )
                })
                .collect(),
            tries: 0,
            first_attempt: now,
            last_attempt: None,
        }
    }

    /// The earliest next_attempt across recipients; the wheel slot the
    /// entry belongs in.
    pub fn next_due(&self) -> DateTime<Utc> {
        self.recipients
            .values()
            .map(|state| state.next_attempt)
            .min()
            .expect("a live queue entry always has recipients")
    }
}
