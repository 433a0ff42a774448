//! A wall-clock scheduler backed by a hashed hierarchical timer wheel.
//!
//! Items implementing [`Scheduled`] are inserted with [`TimeWheel::add`]
//! and emitted on the dispatch channel by a single worker task once
//! their due time arrives, in non-decreasing due order. Items that are
//! already due when added are dispatched immediately. [`TimeWheel::close`]
//! stops the worker and drops the dispatch sender; anything still parked
//! in the wheel is discarded (durable state belongs on disk, not here).

use chrono::{DateTime, Utc};
use hierarchical_hash_wheel_timer::wheels::quad_wheel::{no_prune, QuadWheelWithOverflow};
use hierarchical_hash_wheel_timer::wheels::{Skip, TimerEntryWithDelay};
use hierarchical_hash_wheel_timer::TimerError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub trait Scheduled: Send + std::fmt::Debug + 'static {
    /// The wall-clock instant at which the item should fire.
    fn due(&self) -> DateTime<Utc>;
}

#[derive(Debug)]
struct WheelEntry<T>(T);

impl<T: Scheduled> TimerEntryWithDelay for WheelEntry<T> {
    fn delay(&self) -> Duration {
        (self.0.due() - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

struct WheelState<T: Scheduled> {
    wheel: QuadWheelWithOverflow<WheelEntry<T>>,
    last_advance: Instant,
    len: usize,
}

impl<T: Scheduled> WheelState<T> {
    /// Move the wheel forward to the present, collecting everything
    /// that became due, and report how long until the next tick.
    /// `None` means the wheel is empty.
    fn advance(&mut self) -> (Vec<T>, Option<Duration>) {
        let now = Instant::now();
        let mut elapsed_ms = now.duration_since(self.last_advance).as_millis() as u32;
        self.last_advance = now;

        let mut due = Vec::new();
        while elapsed_ms > 0 {
            match self.wheel.can_skip() {
                Skip::Empty => break,
                Skip::None => {
                    due.extend(self.wheel.tick());
                    elapsed_ms -= 1;
                }
                Skip::Millis(ms) => {
                    let step = ms.min(elapsed_ms);
                    self.wheel.skip(step);
                    elapsed_ms -= step;
                }
            }
        }
        self.len = self.len.saturating_sub(due.len());

        let next = match self.wheel.can_skip() {
            Skip::Empty => None,
            Skip::None => Some(Duration::from_millis(1)),
            Skip::Millis(ms) => Some(Duration::from_millis(ms as u64)),
        };
        (due.into_iter().map(|entry| entry.0).collect(), next)
    }

    fn discard_remaining(&mut self) -> usize {
        let mut discarded = 0;
        loop {
            match self.wheel.can_skip() {
                Skip::Empty => break,
                Skip::None => discarded += self.wheel.tick().len(),
                Skip::Millis(ms) => self.wheel.skip(ms),
            }
        }
        self.len = 0;
        discarded
    }
}

struct Inner<T: Scheduled> {
    state: Mutex<WheelState<T>>,
    tx: Mutex<Option<UnboundedSender<T>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T: Scheduled> Inner<T> {
    fn send(&self, item: T) {
        if let Some(tx) = &*self.tx.lock() {
            // The receiver only disappears once close() ran; losing the
            // item then is fine, disk state is authoritative.
            tx.send(item).ok();
        }
    }
}

pub struct TimeWheel<T: Scheduled> {
    inner: Arc<Inner<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Scheduled> TimeWheel<T> {
    /// Create the wheel and spawn its worker. The returned receiver
    /// yields items as they come due.
    pub fn new() -> (Self, UnboundedReceiver<T>) {
        let (tx, rx) = unbounded_channel();
        let inner = Arc::new(Inner {
            state: Mutex::new(WheelState {
                wheel: QuadWheelWithOverflow::new(no_prune),
                last_advance: Instant::now(),
                len: 0,
            }),
            tx: Mutex::new(Some(tx)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&inner)));
        (
            Self {
                inner,
                worker: Mutex::new(Some(worker)),
            },
            rx,
        )
    }

    /// Schedule an item. Items whose due time is now or in the past are
    /// dispatched immediately rather than rejected.
    pub fn add(&self, item: T) {
        if self.inner.closed.load(Ordering::SeqCst) {
            tracing::debug!("time wheel is closed, dropping {item:?}");
            return;
        }
        let mut state = self.inner.state.lock();
        match state.wheel.insert(WheelEntry(item)) {
            Ok(()) => {
                state.len += 1;
                drop(state);
                self.inner.notify.notify_one();
            }
            Err(TimerError::Expired(WheelEntry(item))) => {
                drop(state);
                self.inner.send(item);
            }
            Err(TimerError::NotFound) => unreachable!("insert never reports NotFound"),
        }
    }

    /// Number of items parked in the wheel (not yet dispatched).
    pub fn len(&self) -> usize {
        self.inner.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the worker and close the dispatch channel. Idempotent.
    /// After this returns no further items are dispatched.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.notify.notify_one();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.await.ok();
        }
        self.inner.tx.lock().take();
        let discarded = self.inner.state.lock().discard_remaining();
        if discarded > 0 {
            tracing::debug!("discarded {discarded} scheduled items at close");
        }
    }
}

async fn run_worker<T: Scheduled>(inner: Arc<Inner<T>>) {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let (due, next) = inner.state.lock().advance();
        for item in due {
            inner.send(item);
        }
        match next {
            Some(sleep) => {
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = inner.notify.notified() => {}
                }
            }
            None => inner.notify.notified().await,
        }
    }
}
