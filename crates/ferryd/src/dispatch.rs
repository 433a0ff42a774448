//! The per-message dispatcher: resolves policy blocks for the sender
//! and each recipient, runs their check groups, and fans the message
//! out to the delivery targets the blocks name.

use crate::authres;
use crate::cancel::CancelToken;
use crate::check::{CheckGroup, CheckSettings, GroupState, ScoreTracker};
use crate::target::{Delivery, DeliveryTarget, TargetError};
use message::{split_address, Buffer, Header, MsgMetadata};
use smtp_response::SmtpStatus;
use std::collections::HashMap;
use std::sync::Arc;

/// Policy container selected by recipient address matching.
pub struct RcptBlock {
    pub checks: CheckGroup,
    pub reject: Option<SmtpStatus>,
    pub targets: Vec<Arc<dyn DeliveryTarget>>,
}

/// Policy container selected by sender address matching. Recipient
/// resolution happens inside the chosen source block.
pub struct SourceBlock {
    pub checks: CheckGroup,
    pub reject: Option<SmtpStatus>,
    pub per_rcpt: HashMap<String, Arc<RcptBlock>>,
    pub default_rcpt: Arc<RcptBlock>,
}

/// Selects delivery targets and runs checks for each message.
///
/// Immutable once constructed; sessions call [`Dispatcher::start`] and
/// drive the returned [`DispatcherDelivery`] single-threadedly.
pub struct Dispatcher {
    hostname: String,
    settings: CheckSettings,
    global_checks: CheckGroup,
    per_source: HashMap<String, Arc<SourceBlock>>,
    default_source: Arc<SourceBlock>,
}

impl Dispatcher {
    pub fn new<S: Into<String>>(
        hostname: S,
        settings: CheckSettings,
        global_checks: CheckGroup,
        per_source: HashMap<String, SourceBlock>,
        default_source: SourceBlock,
    ) -> anyhow::Result<Self> {
        let per_source: HashMap<String, Arc<SourceBlock>> = per_source
            .into_iter()
            .map(|(addr, block)| Ok((addr.to_lowercase(), normalize_source(block)?)))
            .collect::<anyhow::Result<_>>()?;
        Ok(Self {
            hostname: hostname.into(),
            settings,
            global_checks,
            per_source,
            default_source: normalize_source(default_source)?,
        })
    }

    /// Exact lowercased address, then lowercased domain, then default.
    fn resolve_source(&self, mail_from: &str) -> Result<Arc<SourceBlock>, SmtpStatus> {
        if let Some(block) = self.per_source.get(&mail_from.to_lowercase()) {
            tracing::debug!("sender {mail_from} matched by address rule");
            return Ok(block.clone());
        }
        let (_, domain) = split_address(mail_from).map_err(|err| {
            SmtpStatus::malformed_address(format!("Invalid sender address: {err}"))
        })?;
        match self.per_source.get(&domain) {
            Some(block) => {
                tracing::debug!("sender {mail_from} matched by domain rule {domain:?}");
                Ok(block.clone())
            }
            None => {
                tracing::debug!("sender {mail_from} matched by default rule");
                Ok(self.default_source.clone())
            }
        }
    }

    /// Open a delivery for one message. Runs the global and source
    /// check tiers (connection then sender); a rejection closes the
    /// already-opened check states in reverse order and fails.
    pub async fn start(
        &self,
        ctx: &CancelToken,
        meta: &Arc<MsgMetadata>,
        mail_from: &str,
    ) -> Result<DispatcherDelivery, TargetError> {
        tracing::debug!("msg {}: incoming message, MAIL FROM = {mail_from}", meta.id);
        let mut tracker = ScoreTracker::new(self.settings, meta.clone());

        let mut global_state = self.global_checks.new_message(meta).await?;
        if let Err(status) =
            run_connection_and_sender(&mut global_state, ctx, mail_from, &mut tracker).await
        {
            global_state.close().await;
            return Err(status.into());
        }

        let source = match self.resolve_source(mail_from) {
            Ok(source) => source,
            Err(status) => {
                global_state.close().await;
                return Err(status.into());
            }
        };
        if let Some(reject) = &source.reject {
            tracing::debug!("msg {}: sender {mail_from} rejected: {reject}", meta.id);
            global_state.close().await;
            return Err(reject.clone().into());
        }

        let mut source_state = match source.checks.new_message(meta).await {
            Ok(state) => state,
            Err(err) => {
                global_state.close().await;
                return Err(err.into());
            }
        };
        if let Err(status) =
            run_connection_and_sender(&mut source_state, ctx, mail_from, &mut tracker).await
        {
            source_state.close().await;
            global_state.close().await;
            return Err(status.into());
        }

        Ok(DispatcherDelivery {
            hostname: self.hostname.clone(),
            ctx: ctx.clone(),
            meta: meta.clone(),
            mail_from: mail_from.to_string(),
            source,
            tracker,
            global_state,
            source_state,
            rcpt_states: Vec::new(),
            deliveries: Vec::new(),
            phase: Phase::Ready,
        })
    }
}

fn normalize_source(mut block: SourceBlock) -> anyhow::Result<Arc<SourceBlock>> {
    block.per_rcpt = block
        .per_rcpt
        .into_iter()
        .map(|(addr, rcpt)| (addr.to_lowercase(), rcpt))
        .collect();
    if block.reject.is_none() {
        for rcpt in block
            .per_rcpt
            .values()
            .chain(std::iter::once(&block.default_rcpt))
        {
            anyhow::ensure!(
                rcpt.reject.is_some() || !rcpt.targets.is_empty(),
                "recipient block without a reject must name at least one delivery target"
            );
        }
    }
    Ok(Arc::new(block))
}

async fn run_connection_and_sender(
    state: &mut GroupState,
    ctx: &CancelToken,
    mail_from: &str,
    tracker: &mut ScoreTracker,
) -> Result<(), SmtpStatus> {
    state.run_connection(ctx, tracker).await?;
    state.run_sender(ctx, mail_from, tracker).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    BodyOk,
    Done,
}

struct TargetDelivery {
    name: String,
    delivery: Box<dyn Delivery>,
}

/// One message moving through the dispatcher. Not shared between
/// tasks; the owning session drives it sequentially.
pub struct DispatcherDelivery {
    hostname: String,
    ctx: CancelToken,
    meta: Arc<MsgMetadata>,
    mail_from: String,
    source: Arc<SourceBlock>,
    tracker: ScoreTracker,
    global_state: GroupState,
    source_state: GroupState,
    /// Lazily opened check state per distinct recipient block.
    rcpt_states: Vec<(Arc<RcptBlock>, GroupState)>,
    /// At most one delivery per distinct target, in open order.
    deliveries: Vec<TargetDelivery>,
    phase: Phase,
}

impl std::fmt::Debug for DispatcherDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherDelivery")
            .field("hostname", &self.hostname)
            .field("mail_from", &self.mail_from)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl DispatcherDelivery {
    fn resolve_rcpt(&self, to: &str) -> Result<Arc<RcptBlock>, SmtpStatus> {
        if let Some(block) = self.source.per_rcpt.get(&to.to_lowercase()) {
            tracing::debug!("recipient {to} matched by address rule");
            return Ok(block.clone());
        }
        let (_, domain) = split_address(to).map_err(|err| {
            SmtpStatus::malformed_address(format!("Invalid recipient address: {err}"))
        })?;
        match self.source.per_rcpt.get(&domain) {
            Some(block) => {
                tracing::debug!("recipient {to} matched by domain rule {domain:?}");
                Ok(block.clone())
            }
            None => {
                tracing::debug!("recipient {to} matched by default rule");
                Ok(self.source.default_rcpt.clone())
            }
        }
    }

    /// Add one recipient. A rejection here affects only this recipient;
    /// the session may keep adding others.
    pub async fn add_rcpt(&mut self, to: &str) -> Result<(), TargetError> {
        assert!(
            self.phase == Phase::Ready,
            "add_rcpt is not valid after body"
        );

        let block = match self.resolve_rcpt(to) {
            Ok(block) => block,
            Err(status) => return Err(status.into()),
        };
        if let Some(reject) = &block.reject {
            tracing::debug!("msg {}: recipient {to} rejected: {reject}", self.meta.id);
            return Err(reject.clone().into());
        }

        // First recipient for this block: open its check state and run
        // the connection/sender stages it missed.
        let state_idx = match self
            .rcpt_states
            .iter()
            .position(|(candidate, _)| Arc::ptr_eq(candidate, &block))
        {
            Some(idx) => idx,
            None => {
                let mut state = block.checks.new_message(&self.meta).await?;
                if let Err(status) = run_connection_and_sender(
                    &mut state,
                    &self.ctx,
                    &self.mail_from,
                    &mut self.tracker,
                )
                .await
                {
                    state.close().await;
                    return Err(status.into());
                }
                self.rcpt_states.push((block.clone(), state));
                self.rcpt_states.len() - 1
            }
        };

        let (_, state) = &mut self.rcpt_states[state_idx];
        if let Err(status) = state.run_rcpt(&self.ctx, to, &mut self.tracker).await {
            return Err(status.into());
        }

        for target in &block.targets {
            if !self
                .deliveries
                .iter()
                .any(|open| open.name == target.name())
            {
                let delivery = match target.start(&self.ctx, &self.meta, &self.mail_from).await {
                    Ok(delivery) => {
                        tracing::debug!(
                            "msg {}: target.start({}) ok, target = {}",
                            self.meta.id,
                            self.mail_from,
                            target.name()
                        );
                        delivery
                    }
                    Err(err) => {
                        tracing::debug!(
                            "msg {}: target.start({}) failed, target = {}: {err}",
                            self.meta.id,
                            self.mail_from,
                            target.name()
                        );
                        return Err(err);
                    }
                };
                self.deliveries.push(TargetDelivery {
                    name: target.name().to_string(),
                    delivery,
                });
            }

            let open = self
                .deliveries
                .iter_mut()
                .find(|open| open.name == target.name())
                .expect("delivery was memoized above");
            if let Err(err) = open.delivery.add_rcpt(&self.ctx, to).await {
                tracing::debug!(
                    "msg {}: delivery.add_rcpt({to}) failed, target = {}: {err}",
                    self.meta.id,
                    open.name
                );
                return Err(err);
            }
            tracing::debug!(
                "msg {}: delivery.add_rcpt({to}) ok, target = {}",
                self.meta.id,
                open.name
            );
        }

        self.meta.add_recipient(to);
        Ok(())
    }

    /// Run the body check stage across all tiers, emit the accumulated
    /// Authentication-Results and check headers, then forward the body
    /// to every opened delivery.
    pub async fn body(
        &mut self,
        header: &mut Header,
        body: Arc<dyn Buffer>,
    ) -> Result<(), TargetError> {
        assert!(
            self.phase == Phase::Ready,
            "body may only be called once, after add_rcpt"
        );

        if let Err(status) = self
            .global_state
            .run_body(&self.ctx, header, body.as_ref(), &mut self.tracker)
            .await
        {
            return Err(status.into());
        }
        if let Err(status) = self
            .source_state
            .run_body(&self.ctx, header, body.as_ref(), &mut self.tracker)
            .await
        {
            return Err(status.into());
        }
        for (_, state) in &mut self.rcpt_states {
            if let Err(status) = state
                .run_body(&self.ctx, header, body.as_ref(), &mut self.tracker)
                .await
            {
                return Err(status.into());
            }
        }

        // Checks are done; their verdicts go into the outgoing header.
        if !self.tracker.auth_results.is_empty() {
            header.prepend(
                "Authentication-Results",
                authres::format_header(&self.hostname, &self.tracker.auth_results),
            );
        }
        for (name, value) in self.tracker.header.iter() {
            header.prepend(name.to_string(), value.to_string());
        }

        for open in &mut self.deliveries {
            if let Err(err) = open.delivery.body(&self.ctx, header, &body).await {
                tracing::debug!(
                    "msg {}: delivery.body failed, target = {}: {err}",
                    self.meta.id,
                    open.name
                );
                return Err(err);
            }
            tracing::debug!("msg {}: delivery.body ok, target = {}", self.meta.id, open.name);
        }
        self.phase = Phase::BodyOk;
        Ok(())
    }

    /// Commit every opened delivery. The first failure stops the
    /// sequence: there is no sound way to take back the copies that
    /// already committed, so the remainder is simply left un-committed.
    pub async fn commit(&mut self) -> Result<(), TargetError> {
        assert!(
            self.phase == Phase::BodyOk,
            "commit requires a successful body"
        );
        self.phase = Phase::Done;
        for n in 0..self.deliveries.len() {
            let name = self.deliveries[n].name.clone();
            if let Err(err) = self.deliveries[n].delivery.commit(&self.ctx).await {
                let abandoned = self.deliveries.len() - n - 1;
                tracing::error!(
                    "msg {}: delivery.commit failed, target = {name}: {err}; \
                     leaving {abandoned} later deliveries un-committed",
                    self.meta.id
                );
                return Err(err);
            }
            tracing::debug!("msg {}: delivery.commit ok, target = {name}", self.meta.id);
        }
        Ok(())
    }

    /// Abort every opened delivery, continuing past failures, then
    /// close all check states (most recently opened first). Returns the
    /// last error observed.
    pub async fn abort(&mut self) -> Result<(), TargetError> {
        assert!(
            self.phase != Phase::Done,
            "commit and abort are terminal and mutually exclusive"
        );
        self.phase = Phase::Done;

        let mut last_err = None;
        for open in &mut self.deliveries {
            if let Err(err) = open.delivery.abort().await {
                tracing::debug!(
                    "msg {}: delivery.abort failed, target = {}: {err}",
                    self.meta.id,
                    open.name
                );
                last_err = Some(err);
            } else {
                tracing::debug!("msg {}: delivery.abort ok, target = {}", self.meta.id, open.name);
            }
        }

        while let Some((_, mut state)) = self.rcpt_states.pop() {
            state.close().await;
        }
        self.source_state.close().await;
        self.global_state.close().await;

        tracing::debug!("msg {}: delivery aborted", self.meta.id);
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
