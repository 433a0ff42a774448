use serde::{Deserialize, Serialize};

/// An RFC 3463 enhanced status code; `5.7.0` is represented
/// as `class=5, subject=7, detail=0`.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl std::fmt::Display for EnhancedCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// An SMTP status: the three digit code, the optional enhanced
/// code and the human readable text.
///
/// This is the error currency of the delivery pipeline: checks reject
/// with it, delivery targets fail with it, and the retry queue uses
/// the code class to decide between retrying and bouncing.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct SmtpStatus {
    pub code: u16,
    pub enhanced: Option<EnhancedCode>,
    pub message: String,
}

impl SmtpStatus {
    pub fn new<S: Into<String>>(code: u16, enhanced: Option<(u8, u16, u16)>, message: S) -> Self {
        Self {
            code,
            enhanced: enhanced.map(|(class, subject, detail)| EnhancedCode {
                class,
                subject,
                detail,
            }),
            message: message.into(),
        }
    }

    /// 501 5.1.3: the envelope address could not be parsed.
    pub fn malformed_address<S: std::fmt::Display>(detail: S) -> Self {
        Self::new(501, Some((5, 1, 3)), format!("{detail}"))
    }

    /// 550 5.7.0: the accumulated check score crossed the reject threshold.
    pub fn policy_violation(score: i32) -> Self {
        Self::new(
            550,
            Some((5, 7, 0)),
            format!("Message rejected due to multiple local policy violations (score {score})"),
        )
    }

    /// 530 5.7.0: the operation requires an authenticated session.
    pub fn auth_required() -> Self {
        Self::new(530, Some((5, 7, 0)), "Authentication is required")
    }

    /// 451 4.3.0: something went wrong on our side; the client should retry.
    pub fn internal_temporary() -> Self {
        Self::new(451, Some((4, 3, 0)), "Temporary internal error, try again later")
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Render as a single line suitable for logs and for the
    /// persisted per-recipient error in the retry queue.
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);
        if let Some(enhanced) = &self.enhanced {
            line.push_str(&format!("{enhanced} "));
        }
        line.push_str(&single_line(&self.message));
        line
    }
}

impl std::fmt::Display for SmtpStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.to_single_line())
    }
}

impl std::error::Error for SmtpStatus {}

/// Multi-line response texts are joined with single spaces so that
/// they cannot smuggle line breaks into logs or serialized metadata.
fn single_line(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (n, line) in text.lines().enumerate() {
        if n > 0 {
            out.push(' ');
        }
        out.push_str(line);
    }
    out
}
