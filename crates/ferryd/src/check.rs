use crate::authres::AuthResult;
use crate::cancel::CancelToken;
use async_trait::async_trait;
use message::{Buffer, Header, MsgMetadata};
use smtp_response::SmtpStatus;
use std::sync::Arc;

/// What one check call decided about the message.
#[derive(Debug, Default)]
pub struct CheckResult {
    /// Reject the message right now with this status.
    pub reject: Option<SmtpStatus>,
    /// OR'd into the message's quarantine flag.
    pub quarantine: bool,
    /// Added to the running score, which the configured thresholds are
    /// compared against after every check.
    pub score_adjust: i32,
    /// Verdicts to emit in the final Authentication-Results field.
    pub auth_results: Vec<AuthResult>,
    /// Fields to prepend to the outgoing header.
    pub header: Header,
}

impl CheckResult {
    pub fn reject(status: SmtpStatus) -> Self {
        Self {
            reject: Some(status),
            ..Default::default()
        }
    }
}

/// A check module: a factory for per-message [`CheckState`] objects.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    async fn new_message(&self, meta: &Arc<MsgMetadata>) -> anyhow::Result<Box<dyn CheckState>>;
}

/// Per-message state of one check. All hooks default to "no opinion";
/// a check implements only the stages it cares about.
#[async_trait]
pub trait CheckState: Send {
    async fn check_connection(&mut self, _ctx: &CancelToken) -> CheckResult {
        CheckResult::default()
    }

    async fn check_sender(&mut self, _ctx: &CancelToken, _mail_from: &str) -> CheckResult {
        CheckResult::default()
    }

    async fn check_rcpt(&mut self, _ctx: &CancelToken, _rcpt: &str) -> CheckResult {
        CheckResult::default()
    }

    async fn check_body(
        &mut self,
        _ctx: &CancelToken,
        _header: &Header,
        _body: &dyn Buffer,
    ) -> CheckResult {
        CheckResult::default()
    }

    async fn close(&mut self) {}
}

/// Score thresholds shared by every tier of one dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckSettings {
    /// Reject with 550 5.7.0 once the running score reaches this.
    pub reject_score: Option<i32>,
    /// Quarantine once the running score reaches this.
    pub quarantine_score: Option<i32>,
}

/// Accumulates check side effects across all tiers of one message:
/// the running score, the quarantine verdict, Authentication-Results
/// records and extra header fields.
pub struct ScoreTracker {
    settings: CheckSettings,
    meta: Arc<MsgMetadata>,
    pub score: i32,
    pub auth_results: Vec<AuthResult>,
    pub header: Header,
}

impl ScoreTracker {
    pub fn new(settings: CheckSettings, meta: Arc<MsgMetadata>) -> Self {
        Self {
            settings,
            meta,
            score: 0,
            auth_results: Vec::new(),
            header: Header::new(),
        }
    }

    /// Merge one check's result; evaluated after every individual
    /// check so a threshold fires on exactly the check that crossed it.
    pub fn apply(&mut self, result: CheckResult) -> Result<(), SmtpStatus> {
        if let Some(reject) = result.reject {
            return Err(reject);
        }
        if result.quarantine {
            tracing::info!("msg {}: quarantined by check result", self.meta.id);
            self.meta.set_quarantine();
        }
        self.score += result.score_adjust;
        if let Some(threshold) = self.settings.reject_score {
            if self.score >= threshold {
                tracing::debug!(
                    "msg {}: score {} >= {threshold}, rejecting",
                    self.meta.id,
                    self.score
                );
                return Err(SmtpStatus::policy_violation(self.score));
            }
        }
        if let Some(threshold) = self.settings.quarantine_score {
            if self.score >= threshold {
                if !self.meta.is_quarantined() {
                    tracing::info!(
                        "msg {}: quarantined, score {} >= {threshold}",
                        self.meta.id,
                        self.score
                    );
                }
                self.meta.set_quarantine();
            }
        }
        self.auth_results.extend(result.auth_results);
        for (name, value) in result.header.iter() {
            self.header.push(name, value);
        }
        Ok(())
    }
}

/// An ordered set of checks sharing a lifecycle tier.
#[derive(Clone, Default)]
pub struct CheckGroup {
    checks: Vec<Arc<dyn Check>>,
}

impl CheckGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, check: Arc<dyn Check>) {
        self.checks.push(check);
    }

    pub fn with(mut self, check: Arc<dyn Check>) -> Self {
        self.push(check);
        self
    }

    /// Open per-message state for every check in the group. If one
    /// factory fails, the states opened so far are closed again in
    /// reverse order.
    pub async fn new_message(&self, meta: &Arc<MsgMetadata>) -> anyhow::Result<GroupState> {
        let mut states = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            match check.new_message(meta).await {
                Ok(state) => states.push(state),
                Err(err) => {
                    let mut opened = GroupState { states };
                    opened.close().await;
                    return Err(err);
                }
            }
        }
        Ok(GroupState { states })
    }
}

/// The open per-message states of one check group. Each `run_*` method
/// invokes the corresponding hook on every check in order, merging each
/// result through the tracker before moving to the next check.
pub struct GroupState {
    states: Vec<Box<dyn CheckState>>,
}

impl GroupState {
    pub async fn run_connection(
        &mut self,
        ctx: &CancelToken,
        tracker: &mut ScoreTracker,
    ) -> Result<(), SmtpStatus> {
        for state in &mut self.states {
            tracker.apply(state.check_connection(ctx).await)?;
        }
        Ok(())
    }

    pub async fn run_sender(
        &mut self,
        ctx: &CancelToken,
        mail_from: &str,
        tracker: &mut ScoreTracker,
    ) -> Result<(), SmtpStatus> {
        for state in &mut self.states {
            tracker.apply(state.check_sender(ctx, mail_from).await)?;
        }
        Ok(())
    }

    pub async fn run_rcpt(
        &mut self,
        ctx: &CancelToken,
        rcpt: &str,
        tracker: &mut ScoreTracker,
    ) -> Result<(), SmtpStatus> {
        for state in &mut self.states {
            tracker.apply(state.check_rcpt(ctx, rcpt).await)?;
        }
        Ok(())
    }

    pub async fn run_body(
        &mut self,
        ctx: &CancelToken,
        header: &Header,
        body: &dyn Buffer,
        tracker: &mut ScoreTracker,
    ) -> Result<(), SmtpStatus> {
        for state in &mut self.states {
            tracker.apply(state.check_body(ctx, header, body).await)?;
        }
        Ok(())
    }

    /// Close all states, most recently opened first.
    pub async fn close(&mut self) {
        while let Some(mut state) = self.states.pop() {
            state.close().await;
        }
    }
}
