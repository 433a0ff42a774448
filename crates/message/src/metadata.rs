use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Opaque message identifier: 32 random bytes rendered as lowercase hex.
/// Doubles as the on-disk name stem when a message enters the retry queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(String);

impl MsgId {
    pub fn generate() -> Self {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let mut id = String::with_capacity(raw.len() * 2);
        for byte in raw {
            write!(&mut id, "{byte:02x}").expect("writing to a String cannot fail");
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MsgId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MsgId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// Label of the protocol the message arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "ESMTP")]
    Esmtp,
    #[serde(rename = "ESMTPS")]
    Esmtps,
    #[serde(rename = "LMTP")]
    Lmtp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(match self {
            Self::Esmtp => "ESMTP",
            Self::Esmtps => "ESMTPS",
            Self::Lmtp => "LMTP",
        })
    }
}

/// Everything known about a message besides its header and body.
///
/// One instance is created per accepted message and shared (via `Arc`)
/// between the dispatcher, the checks and the delivery targets.
/// The quarantine flag and the context bag are interiorly mutable so
/// checks can record verdicts without exclusive access.
#[derive(Debug)]
pub struct MsgMetadata {
    pub id: MsgId,
    pub from: String,
    pub src_addr: Option<SocketAddr>,
    pub src_hostname: String,
    pub protocol: Protocol,
    pub auth_user: Option<String>,
    quarantine: AtomicBool,
    recipients: Mutex<Vec<String>>,
    context: Mutex<HashMap<String, serde_json::Value>>,
}

impl MsgMetadata {
    pub fn new<S: Into<String>>(from: S) -> Self {
        Self {
            id: MsgId::generate(),
            from: from.into(),
            src_addr: None,
            src_hostname: String::new(),
            protocol: Protocol::Esmtp,
            auth_user: None,
            quarantine: AtomicBool::new(false),
            recipients: Mutex::new(Vec::new()),
            context: Mutex::new(HashMap::new()),
        }
    }

    /// Record an accepted envelope recipient.
    pub fn add_recipient<S: Into<String>>(&self, rcpt: S) {
        self.recipients.lock().push(rcpt.into());
    }

    pub fn recipients(&self) -> Vec<String> {
        self.recipients.lock().clone()
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantine.load(Ordering::Relaxed)
    }

    /// Monotonic: once a message is quarantined it stays quarantined.
    pub fn set_quarantine(&self) {
        self.quarantine.store(true, Ordering::Relaxed);
    }

    pub fn set_context<S: Into<String>>(&self, key: S, value: serde_json::Value) {
        self.context.lock().insert(key.into(), value);
    }

    pub fn get_context(&self, key: &str) -> Option<serde_json::Value> {
        self.context.lock().get(key).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn msg_id_shape() {
        let id = MsgId::generate();
        k9::assert_equal!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id
            .as_str()
            .chars()
            .all(|c| !c.is_ascii_uppercase()));

        // ids must be unique in practice
        assert!(MsgId::generate() != id);
    }

    #[test]
    fn quarantine_is_monotonic() {
        let meta = MsgMetadata::new("sender@example.com");
        assert!(!meta.is_quarantined());
        meta.set_quarantine();
        meta.set_quarantine();
        assert!(meta.is_quarantined());
    }

    #[test]
    fn recipients_accumulate() {
        let meta = MsgMetadata::new("sender@example.com");
        meta.add_recipient("b@y.test");
        meta.add_recipient("c@y.test");
        k9::assert_equal!(
            meta.recipients(),
            vec!["b@y.test".to_string(), "c@y.test".to_string()]
        );
    }

    #[test]
    fn context_bag() {
        let meta = MsgMetadata::new("sender@example.com");
        assert!(meta.get_context("src_rdns_check").is_none());
        meta.set_context("src_rdns_check", serde_json::Value::Bool(true));
        k9::assert_equal!(
            meta.get_context("src_rdns_check"),
            Some(serde_json::Value::Bool(true))
        );
    }

    #[test]
    fn protocol_labels() {
        k9::assert_equal!(Protocol::Esmtp.to_string(), "ESMTP");
        k9::assert_equal!(Protocol::Esmtps.to_string(), "ESMTPS");
        k9::assert_equal!(Protocol::Lmtp.to_string(), "LMTP");
    }
}
