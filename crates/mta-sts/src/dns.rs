use futures::future::BoxFuture;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;

// <https://datatracker.ietf.org/doc/html/rfc8461#section-3.1>

#[derive(Debug, Error)]
pub enum DnsError {
    /// The name does not exist or has no TXT records. Permanent,
    /// resolves to "no policy" rather than an error.
    #[error("no TXT records for {0}")]
    NotFound(String),
    /// The lookup itself failed (timeout, SERVFAIL, connectivity).
    #[error("TXT lookup for {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// A trait for entities that perform DNS resolution.
pub trait Lookup: Send + Sync {
    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>, DnsError>>;
}

impl Lookup for TokioAsyncResolver {
    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
        Box::pin(async move {
            match self.txt_lookup(name).await {
                Ok(lookup) => Ok(lookup
                    .into_iter()
                    .map(|txt| {
                        txt.iter()
                            .map(|segment| String::from_utf8_lossy(segment))
                            .collect()
                    })
                    .collect()),
                Err(err) => Err(classify_resolve_error(name, err)),
            }
        })
    }
}

fn classify_resolve_error(name: &str, err: ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound(name.to_string()),
        _ => DnsError::Failed {
            name: name.to_string(),
            reason: format!("{err}"),
        },
    }
}

/// The id announced by the `_mta-sts.<domain>` TXT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StsDnsRecord {
    pub id: String,
}

/// Discover the policy id for `domain`.
///
/// `Ok(None)` covers everything the RFC files under "assume the domain
/// has no available policy": zero records, more than one valid record,
/// or a record that does not parse. Only transport-level lookup
/// failures surface as errors.
pub async fn discover(
    domain: &str,
    resolver: &dyn Lookup,
) -> Result<Option<StsDnsRecord>, DnsError> {
    let name = format!("_mta-sts.{domain}");
    let records = match resolver.lookup_txt(&name).await {
        Ok(records) => records,
        Err(DnsError::NotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut valid: Vec<StsDnsRecord> = records.iter().filter_map(|txt| parse_record(txt)).collect();
    if valid.len() != 1 {
        tracing::debug!(
            "{name}: {} syntactically valid STS records, treating as no policy",
            valid.len()
        );
        return Ok(None);
    }
    Ok(valid.pop())
}

fn parse_record(txt: &str) -> Option<StsDnsRecord> {
    let mut version = None;
    let mut id = None;
    for pair in txt.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=')?;
        match key.trim() {
            "v" => version = Some(value.trim()),
            "id" => id = Some(value.trim()),
            _ => {}
        }
    }
    if version != Some("STSv1") {
        return None;
    }
    let id = id?;
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(StsDnsRecord { id: id.to_string() })
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::collections::BTreeMap;

    /// Test double: a fixed name → TXT record set mapping.
    pub struct TestResolver {
        dns: BTreeMap<String, Vec<String>>,
    }

    impl TestResolver {
        pub fn new<K, V, I>(iter: I) -> Self
        where
            K: Into<String>,
            V: Into<String>,
            I: IntoIterator<Item = (K, V)>,
        {
            let mut dns: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (name, record) in iter {
                dns.entry(name.into()).or_default().push(record.into());
            }
            Self { dns }
        }
    }

    impl Lookup for TestResolver {
        fn lookup_txt<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
            Box::pin(async move {
                match self.dns.get(name) {
                    Some(records) => Ok(records.clone()),
                    None => Err(DnsError::NotFound(name.to_string())),
                }
            })
        }
    }

    /// Test double that fails every lookup, to model an unreachable
    /// resolver.
    pub struct BrokenResolver;

    impl Lookup for BrokenResolver {
        fn lookup_txt<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<Vec<String>, DnsError>> {
            Box::pin(async move {
                Err(DnsError::Failed {
                    name: name.to_string(),
                    reason: "connection timed out".to_string(),
                })
            })
        }
    }

    #[tokio::test]
    async fn discovers_single_record() {
        let resolver =
            TestResolver::new([("_mta-sts.gmail.com", "v=STSv1; id=20190429T010101;")]);
        let record = discover("gmail.com", &resolver).await.unwrap();
        k9::assert_equal!(
            record,
            Some(StsDnsRecord {
                id: "20190429T010101".to_string()
            })
        );
    }

    #[tokio::test]
    async fn missing_name_is_no_policy() {
        let resolver = TestResolver::new([] as [(&str, &str); 0]);
        k9::assert_equal!(discover("nowhere.test", &resolver).await.unwrap(), None);
    }

    #[tokio::test]
    async fn two_valid_records_is_no_policy() {
        let resolver = TestResolver::new([
            ("_mta-sts.dup.test", "v=STSv1; id=one1"),
            ("_mta-sts.dup.test", "v=STSv1; id=two2"),
        ]);
        k9::assert_equal!(discover("dup.test", &resolver).await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_record_is_no_policy() {
        let resolver = TestResolver::new([("_mta-sts.bad.test", "v=STSv1; id=")]);
        k9::assert_equal!(discover("bad.test", &resolver).await.unwrap(), None);

        let resolver = TestResolver::new([("_mta-sts.other.test", "not an sts record")]);
        k9::assert_equal!(discover("other.test", &resolver).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unrelated_records_are_ignored() {
        let resolver = TestResolver::new([
            ("_mta-sts.mixed.test", "v=spf1 -all"),
            ("_mta-sts.mixed.test", "v=STSv1; id=abc123"),
        ]);
        k9::assert_equal!(
            discover("mixed.test", &resolver).await.unwrap(),
            Some(StsDnsRecord {
                id: "abc123".to_string()
            })
        );
    }

    #[tokio::test]
    async fn lookup_failure_is_an_error() {
        assert!(matches!(
            discover("down.test", &BrokenResolver).await,
            Err(DnsError::Failed { .. })
        ));
    }
}
