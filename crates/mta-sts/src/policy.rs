use serde::{Deserialize, Serialize};
use thiserror::Error;

/// <https://datatracker.ietf.org/doc/html/rfc8461#section-3.2>
/// The largest max_age a policy may request, one year.
pub const MAX_POLICY_AGE: u64 = 31_557_600;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid STS policy: {0}")]
pub struct PolicyError(String);

impl PolicyError {
    fn new<S: Into<String>>(msg: S) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Enforce,
    Testing,
    None,
}

impl PolicyMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Enforce => "enforce",
            Self::Testing => "testing",
            Self::None => "none",
        }
    }
}

/// A parsed MTA-STS policy. The serde field names match the cache
/// document layout: `{"Mode":"enforce","MaxAge":604800,"MX":["…"]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "Mode")]
    pub mode: PolicyMode,
    #[serde(rename = "MaxAge")]
    pub max_age: u64,
    #[serde(rename = "MX")]
    pub mx: Vec<String>,
}

impl Policy {
    /// Parse the line oriented `key: value` policy body served at
    /// `.well-known/mta-sts.txt`. Unknown keys are ignored.
    pub fn parse(data: &str) -> Result<Self, PolicyError> {
        let mut version = None;
        let mut mode = None;
        let mut max_age = None;
        let mut mx = Vec::new();

        for line in data.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| PolicyError::new(format!("malformed line {line:?}")))?;
            let value = value.trim();
            match key.trim() {
                "version" => {
                    if version.replace(value).is_some() {
                        return Err(PolicyError::new("repeated version"));
                    }
                }
                "mode" => {
                    let parsed = match value {
                        "enforce" => PolicyMode::Enforce,
                        "testing" => PolicyMode::Testing,
                        "none" => PolicyMode::None,
                        _ => return Err(PolicyError::new(format!("invalid mode {value:?}"))),
                    };
                    if mode.replace(parsed).is_some() {
                        return Err(PolicyError::new("repeated mode"));
                    }
                }
                "max_age" => {
                    let parsed: u64 = value
                        .parse()
                        .map_err(|_| PolicyError::new(format!("max_age {value:?} is not an integer")))?;
                    if max_age.replace(parsed.min(MAX_POLICY_AGE)).is_some() {
                        return Err(PolicyError::new("repeated max_age"));
                    }
                }
                "mx" => mx.push(value.to_lowercase()),
                _ => {}
            }
        }

        match version {
            Some("STSv1") => {}
            Some(other) => {
                return Err(PolicyError::new(format!("incompatible version {other:?}")))
            }
            None => return Err(PolicyError::new("missing version")),
        }
        let mode = mode.ok_or_else(|| PolicyError::new("missing required mode"))?;
        let max_age = max_age.ok_or_else(|| PolicyError::new("missing required max_age"))?;
        if mx.is_empty() && mode != PolicyMode::None {
            return Err(PolicyError::new("missing required mx"));
        }

        Ok(Self { mode, max_age, mx })
    }

    /// Returns true if `name` matches one of the policy's mx patterns.
    /// `name` must be lowercase; a trailing dot on the name is ignored.
    pub fn mx_matches(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.');
        self.mx.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                match name.strip_suffix(suffix) {
                    // The wildcard covers exactly one label
                    Some(head) => !head.is_empty() && !head.contains('.'),
                    None => false,
                }
            } else {
                name == pattern
            }
        })
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "version: STSv1\nmode: {}\n", self.mode.as_str())?;
        write!(fmt, "max_age: {}\n", self.max_age)?;
        for mx in &self.mx {
            write!(fmt, "mx: {mx}\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE_POLICY: &str = "version: STSv1 \nmode: enforce\nmx: mail.example.com\r\nmx:\t*.example.net\nmx: backupmx.example.com\nmax_age: 604800";

    #[test]
    fn parse_policy() {
        let policy = Policy::parse(SAMPLE_POLICY).unwrap();
        k9::assert_equal!(
            policy,
            Policy {
                mode: PolicyMode::Enforce,
                max_age: 604800,
                mx: vec![
                    "mail.example.com".to_string(),
                    "*.example.net".to_string(),
                    "backupmx.example.com".to_string(),
                ],
            }
        );
    }

    #[test]
    fn parse_rejects_bad_policies() {
        assert!(Policy::parse("mode: enforce\nmax_age: 10\nmx: a.com").is_err());
        assert!(Policy::parse("version: STSv2\nmode: enforce\nmax_age: 10\nmx: a.com").is_err());
        assert!(Policy::parse("version: STSv1\nmode: sometimes\nmax_age: 10\nmx: a.com").is_err());
        assert!(Policy::parse("version: STSv1\nmode: enforce\nmax_age: ten\nmx: a.com").is_err());
        assert!(Policy::parse("version: STSv1\nmode: enforce\nmax_age: 10").is_err());
        // mode none does not need mx entries
        assert!(Policy::parse("version: STSv1\nmode: none\nmax_age: 10").is_ok());
    }

    #[test]
    fn max_age_is_capped() {
        let policy =
            Policy::parse("version: STSv1\nmode: none\nmax_age: 99999999999").unwrap();
        k9::assert_equal!(policy.max_age, MAX_POLICY_AGE);
    }

    #[test]
    fn format_parse_round_trip() {
        let policy = Policy {
            mode: PolicyMode::Enforce,
            max_age: 86400,
            mx: vec!["mx1.example.org".to_string(), "*.example.org".to_string()],
        };
        k9::assert_equal!(Policy::parse(&policy.to_string()).unwrap(), policy);

        let none = Policy {
            mode: PolicyMode::None,
            max_age: 60,
            mx: vec![],
        };
        k9::assert_equal!(Policy::parse(&none.to_string()).unwrap(), none);
    }

    #[test]
    fn name_matching() {
        let policy = Policy {
            mode: PolicyMode::Enforce,
            max_age: 60,
            mx: vec!["foo.com".to_string(), "*.example.com".to_string()],
        };
        assert!(policy.mx_matches("foo.com"));
        assert!(policy.mx_matches("foo.com."));
        assert!(!policy.mx_matches("bar.com"));
        assert!(policy.mx_matches("mx.example.com"));
        assert!(!policy.mx_matches("not.mx.example.com"));
        assert!(!policy.mx_matches("example.com"));
    }

    #[test]
    fn cache_document_shape() {
        let policy = Policy {
            mode: PolicyMode::Enforce,
            max_age: 604800,
            mx: vec!["*.example.org".to_string()],
        };
        k9::assert_equal!(
            serde_json::to_string(&policy).unwrap(),
            r#"{"Mode":"enforce","MaxAge":604800,"MX":["*.example.org"]}"#
        );
    }
}
