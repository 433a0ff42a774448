//! RFC 8601 Authentication-Results formatting.
//!
//! Checks report their verdicts as [`AuthResult`] records; the
//! dispatcher collects them across all check tiers and emits a single
//! header field before the message fans out to its targets.

/// One method verdict, e.g. `spf=pass smtp.mailfrom=example.org`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub method: String,
    pub result: String,
    pub reason: Option<String>,
    /// `ptype.property` / value pairs, e.g. `("smtp.mailfrom", "a@b")`.
    pub props: Vec<(String, String)>,
}

impl AuthResult {
    pub fn new<M: Into<String>, R: Into<String>>(method: M, result: R) -> Self {
        Self {
            method: method.into(),
            result: result.into(),
            reason: None,
            props: Vec::new(),
        }
    }

    pub fn with_reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_prop<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.props.push((key.into(), value.into()));
        self
    }
}

/// Render the value of an `Authentication-Results` field for
/// `authserv_id` (our hostname). An empty result list renders the
/// RFC's explicit `none` form.
pub fn format_header(authserv_id: &str, results: &[AuthResult]) -> String {
    if results.is_empty() {
        return format!("{authserv_id}; none");
    }
    let mut out = String::from(authserv_id);
    for result in results {
        out.push_str("; ");
        out.push_str(&result.method);
        out.push('=');
        out.push_str(&result.result);
        if let Some(reason) = &result.reason {
            out.push_str(&format!(" reason=\"{reason}\""));
        }
        for (key, value) in &result.props {
            out.push_str(&format!(" {key}={value}"));
        }
    }
    out
}
