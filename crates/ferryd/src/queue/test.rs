use super::*;
use crate::target::PartialError;
use message::MemoryBuffer;
use smtp_response::SmtpStatus;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, PartialEq)]
struct TestMsg {
    from: String,
    rcpts: Vec<String>,
    body: Vec<u8>,
}

enum BodyFailure {
    Status(SmtpStatus),
    Partial {
        failed: Vec<&'static str>,
        temporary: Vec<&'static str>,
    },
}

impl BodyFailure {
    fn to_error(&self) -> TargetError {
        match self {
            Self::Status(status) => status.clone().into(),
            Self::Partial { failed, temporary } => {
                let mut errs = HashMap::new();
                for rcpt in failed.iter().chain(temporary.iter()) {
                    errs.insert(rcpt.to_string(), "you shall not pass".to_string());
                }
                PartialError {
                    failed: failed.iter().map(|r| r.to_string()).collect(),
                    temporary_failed: temporary.iter().map(|r| r.to_string()).collect(),
                    errs,
                }
                .into()
            }
        }
    }
}

/// Downstream target that records deliveries and fails on cue: the
/// N-th completed delivery consults index N of the failure tables.
struct UnreliableTarget {
    committed_tx: UnboundedSender<TestMsg>,
    aborted_tx: UnboundedSender<TestMsg>,
    /// completed deliveries, both committed and aborted
    passed: AtomicUsize,
    body_failures: Vec<Option<BodyFailure>>,
    rcpt_failures: Vec<HashMap<&'static str, SmtpStatus>>,
}

struct UnreliableDelivery {
    target: Arc<UnreliableTarget>,
    msg: TestMsg,
}

struct SharedUnreliable(Arc<UnreliableTarget>);

#[async_trait]
impl DeliveryTarget for SharedUnreliable {
    fn name(&self) -> &str {
        "unreliable"
    }

    async fn start(
        &self,
        _ctx: &CancelToken,
        _meta: &Arc<MsgMetadata>,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, TargetError> {
        Ok(Box::new(UnreliableDelivery {
            target: self.0.clone(),
            msg: TestMsg {
                from: mail_from.to_string(),
                rcpts: Vec::new(),
                body: Vec::new(),
            },
        }))
    }
}

#[async_trait]
impl Delivery for UnreliableDelivery {
    async fn add_rcpt(&mut self, _ctx: &CancelToken, rcpt: &str) -> Result<(), TargetError> {
        let passed = self.target.passed.load(Ordering::SeqCst);
        if let Some(failures) = self.target.rcpt_failures.get(passed) {
            if let Some(status) = failures.get(rcpt) {
                return Err(status.clone().into());
            }
        }
        self.msg.rcpts.push(rcpt.to_string());
        Ok(())
    }

    async fn body(
        &mut self,
        _ctx: &CancelToken,
        _header: &Header,
        body: &Arc<dyn Buffer>,
    ) -> Result<(), TargetError> {
        self.msg.body = message::buffer::read_all(body.as_ref())?;
        let passed = self.target.passed.load(Ordering::SeqCst);
        if let Some(Some(failure)) = self.target.body_failures.get(passed) {
            return Err(failure.to_error());
        }
        Ok(())
    }

    async fn commit(&mut self, _ctx: &CancelToken) -> Result<(), TargetError> {
        self.target.passed.fetch_add(1, Ordering::SeqCst);
        self.target.committed_tx.send(self.msg.clone()).ok();
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), TargetError> {
        self.target.passed.fetch_add(1, Ordering::SeqCst);
        self.target.aborted_tx.send(self.msg.clone()).ok();
        Ok(())
    }
}

struct Fixture {
    target: Arc<UnreliableTarget>,
    committed: UnboundedReceiver<TestMsg>,
    aborted: UnboundedReceiver<TestMsg>,
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new(
        body_failures: Vec<Option<BodyFailure>>,
        rcpt_failures: Vec<HashMap<&'static str, SmtpStatus>>,
    ) -> Self {
        let (committed_tx, committed) = unbounded_channel();
        let (aborted_tx, aborted) = unbounded_channel();
        Self {
            target: Arc::new(UnreliableTarget {
                committed_tx,
                aborted_tx,
                passed: AtomicUsize::new(0),
                body_failures,
                rcpt_failures,
            }),
            committed,
            aborted,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Retry immediately; the tests do not want to wait, and zero
    /// delays exercise the wheel's past-due handling.
    fn params() -> QueueParams {
        QueueParams {
            initial_retry_time: Duration::ZERO,
            retry_time_scale: 1.0,
            max_tries: 5,
            post_init_delay: Duration::ZERO,
        }
    }

    async fn open_queue(&self) -> Queue {
        Queue::open(
            "queue",
            self.dir.path(),
            Arc::new(SharedUnreliable(self.target.clone())),
            Self::params(),
        )
        .await
        .unwrap()
    }

    /// Like `open_queue` but with a retry delay long enough that a
    /// scheduled retry is still pending when the test closes the queue.
    async fn open_queue_slow_retry(&self) -> Queue {
        Queue::open(
            "queue",
            self.dir.path(),
            Arc::new(SharedUnreliable(self.target.clone())),
            QueueParams {
                initial_retry_time: Duration::from_secs(1),
                ..Self::params()
            },
        )
        .await
        .unwrap()
    }

    async fn recv_committed(&mut self) -> TestMsg {
        recv_msg(&mut self.committed).await
    }

    async fn recv_aborted(&mut self) -> TestMsg {
        recv_msg(&mut self.aborted).await
    }
}

async fn recv_msg(rx: &mut UnboundedReceiver<TestMsg>) -> TestMsg {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("delivery channel closed")
}

/// Drive one message into the queue the way the dispatcher would.
/// Returns the delivery id used as the on-disk name stem.
async fn do_test_delivery(queue: &Queue, from: &str, rcpts: &[&str]) -> String {
    let ctx = CancelToken::new();
    let meta = Arc::new(MsgMetadata::new(from));
    let id = meta.id.as_str().to_string();
    let mut delivery = queue.start(&ctx, &meta, from).await.unwrap();
    for rcpt in rcpts {
        delivery.add_rcpt(&ctx, rcpt).await.unwrap();
    }
    let mut header = Header::new();
    header.push("Subject", "test message");
    let body: Arc<dyn Buffer> = Arc::new(MemoryBuffer::new(b"foobar\r\n".to_vec()));
    delivery.body(&ctx, &header, &body).await.unwrap();
    delivery.commit(&ctx).await.unwrap();
    id
}

fn check_msg(msg: &TestMsg, from: &str, rcpts: &[&str]) {
    k9::assert_equal!(msg.from, from);
    let expected: Vec<String> = rcpts.iter().map(|r| r.to_string()).collect();
    k9::assert_equal!(msg.rcpts, expected);
    k9::assert_equal!(msg.body, b"foobar\r\n".to_vec());
}

/// Assert exactly the given delivery ids are stored in the directory.
fn check_queue_dir(dir: &Path, expected: &[&str]) {
    let mut found: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|dirent| dirent.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name != spool::LOCK_FILE_NAME)
        .map(|name| {
            name.rsplit_once('.')
                .expect("queue files are stem.part")
                .0
                .to_string()
        })
        .collect();
    found.sort();
    found.dedup();
    let mut expected: Vec<String> = expected.iter().map(|id| id.to_string()).collect();
    expected.sort();
    k9::assert_equal!(found, expected);
}

#[tokio::test]
async fn delivery_happy_path() {
    let mut fx = Fixture::new(vec![], vec![]);
    let queue = fx.open_queue().await;

    do_test_delivery(&queue, "tester@example.com", &["t1@example.org", "t2@example.org"]).await;

    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.com", &["t1@example.org", "t2@example.org"]);

    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

#[tokio::test]
async fn permanent_fail_non_partial() {
    let mut fx = Fixture::new(
        vec![Some(BodyFailure::Status(SmtpStatus::new(
            500,
            Some((5, 0, 0)),
            "you shall not pass",
        )))],
        vec![],
    );
    let queue = fx.open_queue().await;

    do_test_delivery(&queue, "tester@example.com", &["t1@example.org", "t2@example.org"]).await;

    // failed for every recipient: aborted, never retried
    fx.recv_aborted().await;
    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

#[tokio::test]
async fn permanent_fail_partial() {
    let mut fx = Fixture::new(
        vec![Some(BodyFailure::Partial {
            failed: vec!["t1@example.org", "t2@example.org"],
            temporary: vec![],
        })],
        vec![],
    );
    let queue = fx.open_queue().await;

    do_test_delivery(&queue, "tester@example.com", &["t1@example.org", "t2@example.org"]).await;

    fx.recv_aborted().await;
    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

#[tokio::test]
async fn temporary_fail_then_success() {
    let mut fx = Fixture::new(
        vec![Some(BodyFailure::Partial {
            failed: vec![],
            temporary: vec!["t1@example.org", "t2@example.org"],
        })],
        vec![],
    );
    let queue = fx.open_queue().await;

    do_test_delivery(&queue, "tester@example.com", &["t1@example.org", "t2@example.org"]).await;

    // first attempt failed for everyone: aborted
    fx.recv_aborted().await;

    // the retry succeeds for both recipients
    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.com", &["t1@example.org", "t2@example.org"]);

    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

#[tokio::test]
async fn temporary_fail_partial() {
    let mut fx = Fixture::new(
        vec![Some(BodyFailure::Partial {
            failed: vec![],
            temporary: vec!["t2@example.org"],
        })],
        vec![],
    );
    let queue = fx.open_queue().await;

    do_test_delivery(&queue, "tester@example.com", &["t1@example.org", "t2@example.org"]).await;

    // committed because t1 succeeded. The recipient list contains both:
    // the target saw add_rcpt for both before the body partially failed.
    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.com", &["t1@example.org", "t2@example.org"]);

    // the retry carries only the deferred recipient
    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.com", &["t2@example.org"]);

    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

#[tokio::test]
async fn multiple_attempts_mixed_outcomes() {
    let mut fx = Fixture::new(
        vec![
            Some(BodyFailure::Partial {
                failed: vec!["t1@example.org"],
                temporary: vec!["t2@example.org"],
            }),
            Some(BodyFailure::Partial {
                failed: vec![],
                temporary: vec!["t2@example.org"],
            }),
        ],
        vec![],
    );
    let queue = fx.open_queue().await;

    do_test_delivery(
        &queue,
        "tester@example.com",
        &["t1@example.org", "t2@example.org", "t3@example.org"],
    )
    .await;

    // committed because t3 succeeded; all three were submitted
    let msg = fx.recv_committed().await;
    check_msg(
        &msg,
        "tester@example.com",
        &["t1@example.org", "t2@example.org", "t3@example.org"],
    );

    // t1 failed permanently, t2 keeps retrying; the second attempt also
    // defers it (and aborts), the third succeeds
    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.com", &["t2@example.org"]);

    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

#[tokio::test]
async fn permanent_rcpt_reject() {
    let mut fx = Fixture::new(
        vec![],
        vec![HashMap::from([(
            "t1@example.org",
            SmtpStatus::new(500, None, "go away"),
        )])],
    );
    let queue = fx.open_queue().await;

    do_test_delivery(&queue, "tester@example.org", &["t1@example.org", "t2@example.org"]).await;

    // t1 was rejected at add_rcpt and dropped for good; t2 delivered
    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.org", &["t2@example.org"]);

    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

#[tokio::test]
async fn temporary_rcpt_reject() {
    let mut fx = Fixture::new(
        vec![],
        vec![HashMap::from([(
            "t1@example.org",
            SmtpStatus::new(400, None, "go away"),
        )])],
    );
    let queue = fx.open_queue().await;

    do_test_delivery(&queue, "tester@example.com", &["t1@example.org", "t2@example.org"]).await;

    // rejected at add_rcpt, so t1 never appears in the first target
    // recipient list
    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.com", &["t2@example.org"]);

    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.com", &["t1@example.org"]);

    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

#[tokio::test]
async fn crash_recovery_round_trip() {
    let mut fx = Fixture::new(
        vec![],
        vec![HashMap::from([(
            "t1@example.org",
            SmtpStatus::new(400, None, "go away"),
        )])],
    );
    // slow retry so the reschedule is still pending when we close
    let queue = fx.open_queue_slow_retry().await;

    let id = do_test_delivery(&queue, "tester@example.com", &["t1@example.org", "t2@example.org"])
        .await;

    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.com", &["t2@example.org"]);

    // stop before the retry fires; the entry must survive on disk
    queue.close().await;
    check_queue_dir(fx.dir.path(), &[id.as_str()]);
    drop(queue);

    // reopen: recovery reschedules the entry and the retry still happens
    let queue = fx.open_queue().await;
    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.com", &["t1@example.org"]);

    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

async fn cleanup_after_removed_file(part: Part) {
    let mut fx = Fixture::new(
        vec![],
        vec![HashMap::from([(
            "t1@example.org",
            SmtpStatus::new(400, None, "go away"),
        )])],
    );
    let queue = fx.open_queue_slow_retry().await;

    let id = do_test_delivery(&queue, "tester@example.com", &["t1@example.org", "t2@example.org"])
        .await;
    let msg = fx.recv_committed().await;
    check_msg(&msg, "tester@example.com", &["t2@example.org"]);

    queue.close().await;
    check_queue_dir(fx.dir.path(), &[id.as_str()]);
    let part_path = fx.dir.path().join(format!("{id}.{}", part.extension()));
    drop(queue);

    std::fs::remove_file(part_path).unwrap();

    // the dangling files are removed during recovery
    let queue = fx.open_queue().await;
    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

#[tokio::test]
async fn cleanup_no_meta() {
    cleanup_after_removed_file(Part::Meta).await;
}

#[tokio::test]
async fn cleanup_no_header() {
    cleanup_after_removed_file(Part::Header).await;
}

#[tokio::test]
async fn cleanup_no_body() {
    cleanup_after_removed_file(Part::Body).await;
}

#[tokio::test]
async fn corrupt_meta_is_removed_on_open() {
    let fx = Fixture::new(vec![], vec![]);
    for part in Part::ALL {
        std::fs::write(
            fx.dir.path().join(format!("garbage.{}", part.extension())),
            b"not json",
        )
        .unwrap();
    }

    let queue = fx.open_queue().await;
    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}

#[tokio::test]
async fn gives_up_after_max_tries() {
    let always_defer = (0..5)
        .map(|_| {
            Some(BodyFailure::Partial {
                failed: vec![],
                temporary: vec!["t1@example.org"],
            })
        })
        .collect();
    let mut fx = Fixture::new(always_defer, vec![]);
    let queue = fx.open_queue().await;

    do_test_delivery(&queue, "tester@example.com", &["t1@example.org"]).await;

    // every attempt defers and aborts; after max_tries the entry is
    // dropped with the remaining recipient failed permanently
    for _ in 0..5 {
        fx.recv_aborted().await;
    }
    queue.close().await;
    check_queue_dir(fx.dir.path(), &[]);
}
