//! MTA-STS (RFC 8461) policy discovery and caching.
//!
//! The outbound SMTP path asks [`Cache::get`] whether a recipient
//! domain publishes a policy before it is willing to deliver over an
//! unauthenticated connection. Policies are revalidated against the
//! `_mta-sts` TXT record id and cached on disk for their max_age.

use thiserror::Error;

pub mod cache;
pub mod dns;
pub mod fetch;
pub mod policy;

pub use cache::Cache;
pub use dns::{DnsError, Lookup};
pub use fetch::{FetchError, HttpsFetcher, PolicyFetcher};
pub use policy::{Policy, PolicyError, PolicyMode};

#[derive(Debug, Error)]
pub enum MtaStsError {
    /// The domain has no usable MTA-STS policy. This is the common,
    /// non-exceptional outcome for most of the internet.
    #[error("no MTA-STS policy found")]
    NoPolicy,
    #[error(transparent)]
    Dns(#[from] DnsError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("invalid policy domain {0:?}")]
    InvalidDomain(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
