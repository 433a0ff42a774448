use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to GET {url}: HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("Content-Type must be text/plain, got {0:?}")]
    ContentType(String),
}

/// A trait for entities that retrieve the policy body over HTTPS.
pub trait PolicyFetcher: Send + Sync {
    fn fetch_policy<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<String, FetchError>>;
}

pub struct HttpsFetcher {
    client: reqwest::Client,
}

impl HttpsFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            // <https://datatracker.ietf.org/doc/html/rfc8461#section-3.3>
            // HTTP 3xx redirects MUST NOT be followed
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self { client })
    }
}

impl PolicyFetcher for HttpsFetcher {
    fn fetch_policy<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<String, FetchError>> {
        Box::pin(async move {
            let url = format!("https://mta-sts.{domain}/.well-known/mta-sts.txt");
            let response = self.client.get(&url).send().await?;

            // <https://datatracker.ietf.org/doc/html/rfc8461#section-3.3>
            // Policies fetched via HTTPS are only valid if the HTTP
            // response code is 200 (OK)
            let status = response.status();
            if status != reqwest::StatusCode::OK {
                return Err(FetchError::Status {
                    url,
                    status: status.as_u16(),
                });
            }

            // <https://datatracker.ietf.org/doc/html/rfc8461#section-3.2>
            // senders SHOULD validate that the media type is "text/plain"
            // to guard against web servers that let untrusted users host
            // non-text content. Response::text() does not check this, it
            // only cares whether the bytes decode.
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_string();
            let media_type = content_type
                .split_once(';')
                .map(|(ct, _)| ct)
                .unwrap_or(&content_type)
                .trim();
            if media_type != "text/plain" {
                return Err(FetchError::ContentType(content_type));
            }

            Ok(response.text().await?)
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::collections::BTreeMap;

    /// Test double serving canned policy bodies per domain.
    pub struct TestFetcher {
        policies: BTreeMap<String, String>,
    }

    impl TestFetcher {
        pub fn new<K, V, I>(iter: I) -> Self
        where
            K: Into<String>,
            V: Into<String>,
            I: IntoIterator<Item = (K, V)>,
        {
            Self {
                policies: iter
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            }
        }
    }

    impl PolicyFetcher for TestFetcher {
        fn fetch_policy<'a>(
            &'a self,
            domain: &'a str,
        ) -> BoxFuture<'a, Result<String, FetchError>> {
            Box::pin(async move {
                match self.policies.get(domain) {
                    Some(body) => Ok(body.clone()),
                    None => Err(FetchError::Status {
                        url: format!("https://mta-sts.{domain}/.well-known/mta-sts.txt"),
                        status: 404,
                    }),
                }
            })
        }
    }
}
