use crate::cancel::CancelToken;
use async_trait::async_trait;
use message::{Buffer, Header, MsgMetadata};
use smtp_response::SmtpStatus;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Per-recipient outcomes of a single `body` call. Recipients absent
/// from both sets were delivered successfully.
#[derive(Debug, Clone, Default)]
pub struct PartialError {
    /// Rejected permanently; retrying will not help.
    pub failed: Vec<String>,
    /// Rejected with a transient condition; eligible for retry.
    pub temporary_failed: Vec<String>,
    /// Human readable error per recipient, for logs and queue metadata.
    pub errs: HashMap<String, String>,
}

impl PartialError {
    pub fn error_for(&self, rcpt: &str) -> Option<&str> {
        self.errs.get(rcpt).map(|e| e.as_str())
    }
}

impl std::fmt::Display for PartialError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{} recipients failed permanently, {} temporarily",
            self.failed.len(),
            self.temporary_failed.len()
        )
    }
}

/// The error currency of the delivery facade.
///
/// `Partial` is only a valid return from `body`; it never crosses the
/// delivery boundary folded into a flat error, so "did some recipients
/// survive?" is a pattern match rather than a downcast.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("{0}")]
    Smtp(SmtpStatus),
    #[error("partial delivery failure: {0}")]
    Partial(PartialError),
    /// Network trouble talking to a downstream; always transient.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Spool trouble underneath the queue; also transient.
    #[error(transparent)]
    Storage(#[from] spool::StoreError),
    /// Anything else is treated as a permanent internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TargetError {
    /// Flat-error classification: SMTP 4xx and I/O problems are worth
    /// retrying, everything else is final. `Partial` carries its own
    /// per-recipient classification and must be matched before asking.
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Smtp(status) => status.is_transient(),
            Self::Io(_) | Self::Storage(_) => true,
            Self::Partial(_) | Self::Internal(_) => false,
        }
    }

    /// The text persisted as a recipient's last error in the queue.
    pub fn to_status_line(&self) -> String {
        match self {
            Self::Smtp(status) => status.to_single_line(),
            other => other.to_string(),
        }
    }
}

impl From<SmtpStatus> for TargetError {
    fn from(status: SmtpStatus) -> Self {
        Self::Smtp(status)
    }
}

impl From<PartialError> for TargetError {
    fn from(partial: PartialError) -> Self {
        Self::Partial(partial)
    }
}

/// Anything that can accept a message: a local mailbox backend, a
/// remote SMTP client, the retry queue. Targets are shared between
/// sessions and must be internally thread-safe.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// Stable identity, unique within a registry. The dispatcher keys
    /// per-message delivery deduplication on it.
    fn name(&self) -> &str;

    /// Begin a delivery for one message.
    async fn start(
        &self,
        ctx: &CancelToken,
        meta: &Arc<MsgMetadata>,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, TargetError>;
}

/// One in-flight message on one target.
///
/// Call order: `add_rcpt` one or more times, then `body` once, then
/// exactly one of `commit` / `abort`. Violating the order is a
/// programmer error and implementations may panic.
#[async_trait]
pub trait Delivery: Send {
    async fn add_rcpt(&mut self, ctx: &CancelToken, rcpt: &str) -> Result<(), TargetError>;

    async fn body(
        &mut self,
        ctx: &CancelToken,
        header: &Header,
        body: &Arc<dyn Buffer>,
    ) -> Result<(), TargetError>;

    async fn commit(&mut self, ctx: &CancelToken) -> Result<(), TargetError>;

    async fn abort(&mut self) -> Result<(), TargetError>;
}
