//! Helpers for checks that keep no per-message state beyond the shared
//! metadata: a plain-function adapter plus the built-in checks.

use crate::cancel::CancelToken;
use crate::check::{Check, CheckResult, CheckState};
use async_trait::async_trait;
use futures::future::BoxFuture;
use hickory_resolver::TokioAsyncResolver;
use message::{Buffer, Header, MsgMetadata};
use smtp_response::SmtpStatus;
use std::net::IpAddr;
use std::sync::Arc;

/// Everything a stateless check function gets to look at.
pub struct StatelessContext {
    pub meta: Arc<MsgMetadata>,
    pub cancel: CancelToken,
}

pub type ConnFn =
    Arc<dyn for<'a> Fn(&'a StatelessContext) -> BoxFuture<'a, CheckResult> + Send + Sync>;
pub type SenderFn = Arc<
    dyn for<'a> Fn(&'a StatelessContext, &'a str) -> BoxFuture<'a, CheckResult> + Send + Sync,
>;
pub type RcptFn = SenderFn;
pub type BodyFn = Arc<
    dyn for<'a> Fn(&'a StatelessContext, &'a Header, &'a dyn Buffer) -> BoxFuture<'a, CheckResult>
        + Send
        + Sync,
>;

/// Adapter that turns plain async functions into a [`Check`]. Stages
/// without a function installed are no-ops, mirroring the optional
/// hooks of [`CheckState`].
#[derive(Clone)]
pub struct StatelessCheck {
    name: String,
    conn: Option<ConnFn>,
    sender: Option<SenderFn>,
    rcpt: Option<RcptFn>,
    body: Option<BodyFn>,
}

impl StatelessCheck {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            conn: None,
            sender: None,
            rcpt: None,
            body: None,
        }
    }

    pub fn on_connection<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a StatelessContext) -> BoxFuture<'a, CheckResult> + Send + Sync + 'static,
    {
        self.conn = Some(Arc::new(f));
        self
    }

    pub fn on_sender<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a StatelessContext, &'a str) -> BoxFuture<'a, CheckResult>
            + Send
            + Sync
            + 'static,
    {
        self.sender = Some(Arc::new(f));
        self
    }

    pub fn on_rcpt<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a StatelessContext, &'a str) -> BoxFuture<'a, CheckResult>
            + Send
            + Sync
            + 'static,
    {
        self.rcpt = Some(Arc::new(f));
        self
    }

    pub fn on_body<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a StatelessContext, &'a Header, &'a dyn Buffer) -> BoxFuture<'a, CheckResult>
            + Send
            + Sync
            + 'static,
    {
        self.body = Some(Arc::new(f));
        self
    }
}

#[async_trait]
impl Check for StatelessCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_message(&self, meta: &Arc<MsgMetadata>) -> anyhow::Result<Box<dyn CheckState>> {
        Ok(Box::new(StatelessState {
            conn: self.conn.clone(),
            sender: self.sender.clone(),
            rcpt: self.rcpt.clone(),
            body: self.body.clone(),
            meta: meta.clone(),
        }))
    }
}

struct StatelessState {
    conn: Option<ConnFn>,
    sender: Option<SenderFn>,
    rcpt: Option<RcptFn>,
    body: Option<BodyFn>,
    meta: Arc<MsgMetadata>,
}

impl StatelessState {
    fn context(&self, ctx: &CancelToken) -> StatelessContext {
        StatelessContext {
            meta: self.meta.clone(),
            cancel: ctx.clone(),
        }
    }
}

#[async_trait]
impl CheckState for StatelessState {
    async fn check_connection(&mut self, ctx: &CancelToken) -> CheckResult {
        match &self.conn {
            Some(f) => f(&self.context(ctx)).await,
            None => CheckResult::default(),
        }
    }

    async fn check_sender(&mut self, ctx: &CancelToken, mail_from: &str) -> CheckResult {
        match &self.sender {
            Some(f) => f(&self.context(ctx), mail_from).await,
            None => CheckResult::default(),
        }
    }

    async fn check_rcpt(&mut self, ctx: &CancelToken, rcpt: &str) -> CheckResult {
        match &self.rcpt {
            Some(f) => f(&self.context(ctx), rcpt).await,
            None => CheckResult::default(),
        }
    }

    async fn check_body(
        &mut self,
        ctx: &CancelToken,
        header: &Header,
        body: &dyn Buffer,
    ) -> CheckResult {
        match &self.body {
            Some(f) => f(&self.context(ctx), header, body).await,
            None => CheckResult::default(),
        }
    }
}

fn require_auth_sender<'a>(
    ctx: &'a StatelessContext,
    _mail_from: &'a str,
) -> BoxFuture<'a, CheckResult> {
    Box::pin(async move {
        if ctx.meta.auth_user.is_some() {
            CheckResult::default()
        } else {
            CheckResult::reject(SmtpStatus::auth_required())
        }
    })
}

/// Reject senders that have not authenticated.
pub fn require_auth() -> StatelessCheck {
    StatelessCheck::new("require_auth").on_sender(require_auth_sender)
}

/// A trait for entities that resolve PTR records.
pub trait PtrLookup: Send + Sync {
    fn lookup_ptr<'a>(&'a self, ip: IpAddr) -> BoxFuture<'a, anyhow::Result<Vec<String>>>;
}

impl PtrLookup for TokioAsyncResolver {
    fn lookup_ptr<'a>(&'a self, ip: IpAddr) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
        Box::pin(async move {
            Ok(self
                .reverse_lookup(ip)
                .await?
                .into_iter()
                .map(|name| name.to_lowercase().to_string())
                .collect())
        })
    }
}

/// Verify that the source IP's PTR record points back at the HELO
/// hostname. Advisory by default; in `required` mode a mismatch rejects
/// the connection. The verdict is recorded in the message context bag
/// under `src_rdns_check` either way.
pub struct SourceRdns {
    resolver: Arc<dyn PtrLookup>,
    required: bool,
}

impl SourceRdns {
    pub fn new(resolver: Arc<dyn PtrLookup>, required: bool) -> Self {
        Self { resolver, required }
    }

    fn reject() -> SmtpStatus {
        SmtpStatus::new(
            550,
            Some((5, 7, 25)),
            "rDNS name does not match source hostname",
        )
    }
}

#[async_trait]
impl Check for SourceRdns {
    fn name(&self) -> &str {
        "source_rdns"
    }

    async fn new_message(&self, meta: &Arc<MsgMetadata>) -> anyhow::Result<Box<dyn CheckState>> {
        Ok(Box::new(SourceRdnsState {
            resolver: self.resolver.clone(),
            required: self.required,
            meta: meta.clone(),
        }))
    }
}

struct SourceRdnsState {
    resolver: Arc<dyn PtrLookup>,
    required: bool,
    meta: Arc<MsgMetadata>,
}

#[async_trait]
impl CheckState for SourceRdnsState {
    async fn check_connection(&mut self, _ctx: &CancelToken) -> CheckResult {
        let Some(addr) = self.meta.src_addr else {
            tracing::debug!("source_rdns: no IP source, skipped");
            return CheckResult::default();
        };

        let names = match self.resolver.lookup_ptr(addr.ip()).await {
            Ok(names) => names,
            Err(err) => {
                self.meta
                    .set_context("src_rdns_check", serde_json::Value::Bool(false));
                if self.required {
                    tracing::info!(
                        "source_rdns: rDNS query for {} failed ({err:#}), FAIL, msg ID = {}",
                        addr.ip(),
                        self.meta.id
                    );
                    return CheckResult::reject(SourceRdns::reject());
                }
                tracing::debug!("source_rdns: rDNS query for {} failed ({err:#}), OK", addr.ip());
                return CheckResult::default();
            }
        };

        let src_domain = self
            .meta
            .src_hostname
            .to_lowercase()
            .trim_end_matches('.')
            .to_string();
        let matched = names
            .iter()
            .any(|name| name.trim_end_matches('.') == src_domain);

        self.meta
            .set_context("src_rdns_check", serde_json::Value::Bool(matched));
        if matched {
            tracing::debug!("source_rdns: PTR record matches {src_domain}, OK");
            return CheckResult::default();
        }
        if self.required {
            tracing::info!(
                "source_rdns: no PTR record for {} pointing to {src_domain}, FAIL, msg ID = {}",
                addr.ip(),
                self.meta.id
            );
            return CheckResult::reject(SourceRdns::reject());
        }
        tracing::debug!(
            "source_rdns: no PTR record for {} pointing to {src_domain}, OK",
            addr.ip()
        );
        CheckResult::default()
    }
}
