//! The persistent retry queue: a delivery target that stores accepted
//! messages on disk and drives them to a downstream target with
//! per-recipient retry.
//!
//! Acceptance writes the header and body files, then the meta file
//! (atomically, last), and `commit` schedules the first attempt on the
//! time wheel. A single worker performs attempts; recipients that fail
//! with a transient condition are rescheduled with exponential backoff
//! until `max_tries` runs out, everything else resolves the recipient.
//! Recovery re-reads the directory on open and reschedules survivors.

pub mod entry;
#[cfg(test)]
mod test;

use crate::cancel::CancelToken;
use crate::target::{Delivery, DeliveryTarget, TargetError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entry::QueueEntry;
use message::{Buffer, FileBuffer, Header, MsgId, MsgMetadata};
use parking_lot::Mutex;
use spool::{DiskStore, Part};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use timewheel::{Scheduled, TimeWheel};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// Retry policy and worker tuning for one queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueParams {
    /// Base retry interval for the exponential backoff.
    pub initial_retry_time: Duration,
    /// Backoff multiplier; the wait before retry `n` is
    /// `initial_retry_time * retry_time_scale^(n-1)`.
    pub retry_time_scale: f64,
    /// Attempts before the remaining recipients fail permanently.
    pub max_tries: u32,
    /// Grace period after open() before the worker starts firing.
    pub post_init_delay: Duration,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            initial_retry_time: Duration::from_secs(20 * 60),
            retry_time_scale: 2.0,
            max_tries: 5,
            post_init_delay: Duration::ZERO,
        }
    }
}

/// A delay of a year caps runaway exponents.
const MAX_RETRY_DELAY_SECS: f64 = 86400.0 * 365.0;

impl QueueParams {
    fn delay_for_try(&self, try_no: u32) -> Duration {
        let exponent = try_no.saturating_sub(1);
        let secs =
            self.initial_retry_time.as_secs_f64() * self.retry_time_scale.powi(exponent as i32);
        Duration::from_secs_f64(secs.clamp(0.0, MAX_RETRY_DELAY_SECS))
    }
}

#[derive(Debug)]
struct QueueSlot {
    due: DateTime<Utc>,
    id: String,
}

impl Scheduled for QueueSlot {
    fn due(&self) -> DateTime<Utc> {
        self.due
    }
}

struct QueueInner {
    name: String,
    params: QueueParams,
    store: DiskStore,
    wheel: TimeWheel<QueueSlot>,
    target: Arc<dyn DeliveryTarget>,
    cancel: CancelToken,
    closed: AtomicBool,
}

/// The queue itself. Exclusive owner of its directory for its
/// lifetime; shared across sessions as a delivery target.
pub struct Queue {
    inner: Arc<QueueInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    /// Open the queue directory, recover surviving entries into the
    /// wheel, and start the worker.
    pub async fn open<S: Into<String>>(
        name: S,
        location: &Path,
        target: Arc<dyn DeliveryTarget>,
        params: QueueParams,
    ) -> anyhow::Result<Self> {
        let store = DiskStore::open(location, true)?;
        let (wheel, dispatch) = TimeWheel::new();
        let inner = Arc::new(QueueInner {
            name: name.into(),
            params,
            store,
            wheel,
            target,
            cancel: CancelToken::new(),
            closed: AtomicBool::new(false),
        });

        let now = Utc::now();
        for recovered in inner.store.enumerate().await? {
            match serde_json::from_slice::<QueueEntry>(&recovered.meta) {
                Ok(entry) => {
                    // an entry that came due while we were down fires
                    // right away
                    let due = entry.next_due().max(now);
                    tracing::debug!(
                        "queue {}: recovered {} with {} recipients, due {due}",
                        inner.name,
                        recovered.id,
                        entry.recipients.len()
                    );
                    inner.wheel.add(QueueSlot {
                        due,
                        id: recovered.id,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        "queue {}: removing {} with unparseable metadata: {err}",
                        inner.name,
                        recovered.id
                    );
                    inner.store.remove_entry(&recovered.id).await.ok();
                }
            }
        }

        let worker = tokio::spawn(run_worker(inner.clone(), dispatch));
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn location(&self) -> &Path {
        self.inner.store.location()
    }

    /// Stop scheduling, cancel the in-flight attempt's context, and
    /// wait for the worker to finish. No attempt starts after this
    /// returns; undelivered entries stay on disk for the next open.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wheel.close().await;
        self.inner.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.await.ok();
        }
    }
}

async fn run_worker(inner: Arc<QueueInner>, mut dispatch: UnboundedReceiver<QueueSlot>) {
    if !inner.params.post_init_delay.is_zero() {
        tokio::time::sleep(inner.params.post_init_delay).await;
    }
    while let Some(slot) = dispatch.recv().await {
        if inner.closed.load(Ordering::SeqCst) {
            // the entry stays on disk; the next open() reschedules it
            continue;
        }
        if let Err(err) = inner.attempt(&slot.id).await {
            tracing::error!("queue {}: attempt for {} failed: {err:#}", inner.name, slot.id);
        }
    }
}

impl QueueInner {
    /// One delivery attempt for one entry: open a downstream delivery,
    /// classify per-recipient outcomes, then either delete the entry or
    /// persist updated state and reschedule.
    async fn attempt(&self, id: &str) -> anyhow::Result<()> {
        let meta_bytes = match self.store.read_part(id, Part::Meta).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_missing() => {
                tracing::debug!("queue {}: entry {id} vanished before its attempt", self.name);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let mut entry: QueueEntry = serde_json::from_slice(&meta_bytes)?;
        let header_bytes = self.store.read_part(id, Part::Header).await?;
        let header = Header::read_from(&header_bytes[..])?;
        let body: Arc<dyn Buffer> = Arc::new(FileBuffer::new(self.store.part_path(id, Part::Body)));

        entry.tries += 1;
        let now = Utc::now();
        entry.last_attempt = Some(now);
        let rcpts: Vec<String> = entry.recipients.keys().cloned().collect();
        tracing::debug!(
            "queue {}: attempt {} for {id}, recipients: {rcpts:?}",
            self.name,
            entry.tries
        );

        let meta = Arc::new(rebuild_metadata(&entry));

        // this attempt's outcome per recipient; anything in neither map
        // was delivered
        let mut temp: BTreeMap<String, String> = BTreeMap::new();
        let mut perm: Vec<(String, String)> = Vec::new();

        match self.target.start(&self.cancel, &meta, &entry.from).await {
            Ok(mut delivery) => {
                let mut attempted: Vec<String> = Vec::new();
                for rcpt in &rcpts {
                    match delivery.add_rcpt(&self.cancel, rcpt).await {
                        Ok(()) => attempted.push(rcpt.clone()),
                        Err(err) if err.is_temporary() => {
                            tracing::debug!(
                                "queue {}: add_rcpt({rcpt}) deferred: {err}",
                                self.name
                            );
                            temp.insert(rcpt.clone(), err.to_status_line());
                        }
                        Err(err) => perm.push((rcpt.clone(), err.to_status_line())),
                    }
                }

                if attempted.is_empty() {
                    delivery.abort().await.ok();
                } else {
                    match delivery.body(&self.cancel, &header, &body).await {
                        Ok(()) => {
                            if let Err(err) = delivery.commit(&self.cancel).await {
                                classify_flat(&err, &attempted, &mut temp, &mut perm);
                            }
                        }
                        Err(TargetError::Partial(partial)) => {
                            let succeeded: Vec<String> = attempted
                                .iter()
                                .filter(|rcpt| {
                                    !partial.failed.contains(*rcpt)
                                        && !partial.temporary_failed.contains(*rcpt)
                                })
                                .cloned()
                                .collect();
                            for rcpt in &partial.failed {
                                let reason = partial
                                    .error_for(rcpt)
                                    .unwrap_or("delivery failed")
                                    .to_string();
                                perm.push((rcpt.clone(), reason));
                            }
                            for rcpt in &partial.temporary_failed {
                                let reason = partial
                                    .error_for(rcpt)
                                    .unwrap_or("temporary delivery failure")
                                    .to_string();
                                temp.insert(rcpt.clone(), reason);
                            }
                            if succeeded.is_empty() {
                                delivery.abort().await.ok();
                            } else if let Err(err) = delivery.commit(&self.cancel).await {
                                classify_flat(&err, &succeeded, &mut temp, &mut perm);
                            }
                        }
                        Err(err) => {
                            classify_flat(&err, &attempted, &mut temp, &mut perm);
                            delivery.abort().await.ok();
                        }
                    }
                }
            }
            // no delivery was opened, nothing to abort
            Err(err) => classify_flat(&err, &rcpts, &mut temp, &mut perm),
        }

        for (rcpt, reason) in &perm {
            tracing::error!(
                "queue {}: delivery of {id} to {rcpt} failed permanently: {reason}",
                self.name
            );
        }

        if temp.is_empty() {
            tracing::debug!(
                "queue {}: entry {id} resolved after {} tries",
                self.name,
                entry.tries
            );
            self.store.remove_entry(id).await?;
            return Ok(());
        }

        if entry.tries >= self.params.max_tries {
            for rcpt in temp.keys() {
                tracing::error!(
                    "queue {}: giving up on {id} to {rcpt} after {} tries",
                    self.name,
                    entry.tries
                );
            }
            self.store.remove_entry(id).await?;
            return Ok(());
        }

        let delay = self.params.delay_for_try(entry.tries);
        let next = now
            + chrono::Duration::from_std(delay)
                .expect("retry delay is capped well below chrono's limits");

        entry.recipients.retain(|rcpt, _| temp.contains_key(rcpt));
        for (rcpt, state) in entry.recipients.iter_mut() {
            state.attempts += 1;
            state.next_attempt = next;
            state.last_err = temp.get(rcpt).cloned();
        }

        self.store
            .write_part(id, Part::Meta, serde_json::to_vec(&entry)?)
            .await?;
        tracing::debug!(
            "queue {}: rescheduled {id} for {next} ({} recipients left)",
            self.name,
            entry.recipients.len()
        );
        self.wheel.add(QueueSlot {
            due: next,
            id: id.to_string(),
        });
        Ok(())
    }
}

/// Apply a flat (non-partial) error to a set of recipients.
fn classify_flat(
    err: &TargetError,
    rcpts: &[String],
    temp: &mut BTreeMap<String, String>,
    perm: &mut Vec<(String, String)>,
) {
    let reason = err.to_status_line();
    if err.is_temporary() {
        for rcpt in rcpts {
            temp.insert(rcpt.clone(), reason.clone());
        }
    } else {
        for rcpt in rcpts {
            perm.push((rcpt.clone(), reason.clone()));
        }
    }
}

/// The meta file holds only the envelope; rebuild the minimal message
/// metadata a downstream target needs for a retry attempt.
fn rebuild_metadata(entry: &QueueEntry) -> MsgMetadata {
    let mut meta = MsgMetadata::new(entry.from.clone());
    meta.id = MsgId::from(entry.delivery_id.clone());
    meta
}

#[async_trait]
impl DeliveryTarget for Queue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn start(
        &self,
        _ctx: &CancelToken,
        meta: &Arc<MsgMetadata>,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, TargetError> {
        Ok(Box::new(QueueDelivery {
            inner: self.inner.clone(),
            id: meta.id.as_str().to_string(),
            from: mail_from.to_string(),
            rcpts: Vec::new(),
            stored: false,
        }))
    }
}

struct QueueDelivery {
    inner: Arc<QueueInner>,
    id: String,
    from: String,
    rcpts: Vec<String>,
    stored: bool,
}

#[async_trait]
impl Delivery for QueueDelivery {
    async fn add_rcpt(&mut self, _ctx: &CancelToken, rcpt: &str) -> Result<(), TargetError> {
        assert!(!self.stored, "add_rcpt is not valid after body");
        self.rcpts.push(rcpt.to_string());
        Ok(())
    }

    /// Make the message durable: header and body first (synced), then
    /// the meta file, atomically, so a crash between the writes leaves
    /// an incomplete triplet that recovery removes.
    async fn body(
        &mut self,
        _ctx: &CancelToken,
        header: &Header,
        body: &Arc<dyn Buffer>,
    ) -> Result<(), TargetError> {
        assert!(!self.stored, "body may only be called once");
        assert!(!self.rcpts.is_empty(), "body requires at least one recipient");

        let body_bytes = message::buffer::read_all(body.as_ref())?;
        self.inner
            .store
            .write_part(&self.id, Part::Header, header.to_bytes())
            .await?;
        self.inner
            .store
            .write_part(&self.id, Part::Body, body_bytes)
            .await?;

        let entry = QueueEntry::new(
            self.id.clone(),
            self.from.clone(),
            self.rcpts.iter().cloned(),
            Utc::now(),
        );
        let meta_bytes =
            serde_json::to_vec(&entry).map_err(|err| TargetError::Internal(err.into()))?;
        self.inner
            .store
            .write_part(&self.id, Part::Meta, meta_bytes)
            .await?;
        self.stored = true;
        tracing::debug!(
            "queue {}: stored {} for {} recipients",
            self.inner.name,
            self.id,
            self.rcpts.len()
        );
        Ok(())
    }

    /// Hand the stored entry to the worker for its first attempt.
    async fn commit(&mut self, _ctx: &CancelToken) -> Result<(), TargetError> {
        assert!(self.stored, "commit requires a successful body");
        self.inner.wheel.add(QueueSlot {
            due: Utc::now(),
            id: self.id.clone(),
        });
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), TargetError> {
        if self.stored {
            self.stored = false;
            self.inner.store.remove_entry(&self.id).await?;
        }
        Ok(())
    }
}
