use crate::dns::{discover, Lookup};
use crate::fetch::PolicyFetcher;
use crate::policy::Policy;
use crate::MtaStsError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The persisted form of a cached policy, one JSON file per domain
/// under the cache directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheDocument {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "FetchTime")]
    fetch_time: DateTime<Utc>,
    #[serde(rename = "Policy")]
    policy: Policy,
}

impl CacheDocument {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.fetch_time + chrono::Duration::seconds(self.policy.max_age as i64) > now
    }
}

/// Disk-backed MTA-STS policy cache.
///
/// Lookups revalidate against DNS: a cached policy is served only while
/// its id still matches the `_mta-sts` TXT record and its max_age has
/// not run out. Cache writes are whole-file atomic replaces, so
/// concurrent refreshes of one domain degrade to last-writer-wins.
pub struct Cache {
    location: PathBuf,
    resolver: Arc<dyn Lookup>,
    fetcher: Arc<dyn PolicyFetcher>,
}

impl Cache {
    pub fn open(
        location: &Path,
        resolver: Arc<dyn Lookup>,
        fetcher: Arc<dyn PolicyFetcher>,
    ) -> Result<Self, MtaStsError> {
        std::fs::create_dir_all(location)?;
        Ok(Self {
            location: location.to_path_buf(),
            resolver,
            fetcher,
        })
    }

    /// Resolve the policy for `domain`, from cache when possible.
    pub async fn get(&self, domain: &str) -> Result<Policy, MtaStsError> {
        let (_cache_hit, policy) = self.fetch(domain).await?;
        Ok(policy)
    }

    /// Revalidate every cached domain. Entries whose domain no longer
    /// publishes a policy are removed; individual failures are logged
    /// and do not stop the sweep.
    pub async fn refresh(&self) -> Result<(), MtaStsError> {
        let mut domains = Vec::new();
        for dirent in std::fs::read_dir(&self.location)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = dirent.file_name().to_str() {
                domains.push(name.to_string());
            }
        }

        for domain in domains {
            match self.fetch(&domain).await {
                Ok((cache_hit, _)) => {
                    if !cache_hit {
                        tracing::debug!("updated MTA-STS policy for {domain}");
                    }
                }
                Err(MtaStsError::NoPolicy) => {
                    // The cached copy is expired and the domain no longer
                    // offers a policy; drop the file to reclaim the space.
                    if let Err(err) = std::fs::remove_file(self.cache_path(&domain)?) {
                        tracing::error!("failed to remove MTA-STS policy for {domain}: {err}");
                    } else {
                        tracing::debug!("removed MTA-STS policy for {domain}");
                    }
                }
                Err(err) => {
                    tracing::warn!("failed to update MTA-STS policy for {domain}: {err}");
                }
            }
        }
        Ok(())
    }

    /// The full §4.6 flow. Returns `(cache_hit, policy)`.
    async fn fetch(&self, domain: &str) -> Result<(bool, Policy), MtaStsError> {
        let now = Utc::now();
        let cached = self.load(domain).await?;
        let valid_cache = cached
            .as_ref()
            .map(|doc| doc.is_fresh(now))
            .unwrap_or(false);

        let record = match discover(domain, &*self.resolver).await? {
            Some(record) => record,
            None => {
                // No usable TXT record. That alone does not invalidate a
                // previously cached policy that is still within max_age.
                return match cached {
                    Some(doc) if valid_cache => Ok((true, doc.policy)),
                    _ => Err(MtaStsError::NoPolicy),
                };
            }
        };

        if let Some(doc) = &cached {
            if valid_cache && doc.id == record.id {
                return Ok((true, doc.policy.clone()));
            }
        }

        let body = self.fetcher.fetch_policy(domain).await?;
        let policy = Policy::parse(&body)?;

        let document = CacheDocument {
            id: record.id,
            fetch_time: now,
            policy: policy.clone(),
        };
        if let Err(err) = self.store(domain, &document).await {
            // We still have an up to date policy; the cache is best effort.
            tracing::error!("failed to persist MTA-STS policy for {domain}: {err}");
        }
        Ok((false, policy))
    }

    fn cache_path(&self, domain: &str) -> Result<PathBuf, MtaStsError> {
        // Domain names become file names; refuse anything that could
        // escape the cache directory.
        if domain.is_empty()
            || domain.starts_with('.')
            || domain.contains('/')
            || domain.contains('\\')
        {
            return Err(MtaStsError::InvalidDomain(domain.to_string()));
        }
        Ok(self.location.join(domain))
    }

    async fn load(&self, domain: &str) -> Result<Option<CacheDocument>, MtaStsError> {
        let path = self.cache_path(domain)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&data) {
            Ok(doc) => Ok(Some(doc)),
            Err(err) => {
                // A torn or corrupted cache file must not wedge the
                // domain; treat it as a miss and overwrite it later.
                tracing::warn!("discarding corrupt MTA-STS cache entry for {domain}: {err}");
                Ok(None)
            }
        }
    }

    async fn store(&self, domain: &str, document: &CacheDocument) -> Result<(), MtaStsError> {
        let path = self.cache_path(domain)?;
        let dir = self.location.clone();
        let data = serde_json::to_vec(document)?;
        tokio::task::spawn_blocking(move || {
            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            temp.write_all(&data)?;
            temp.persist(&path).map_err(|err| err.error)?;
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(|err| std::io::Error::other(err))??;
        Ok(())
    }
}
