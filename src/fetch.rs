use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE};
use tracing::debug;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; DromScraper/1.0; +https://www.drom.ru/)";
const ACCEPT_LANGUAGE_RU: &str = "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking page retrieval. Any error here is the unit-hard-failure trigger
/// for the calling stage (except stage 3's per-configuration soft-fail).
pub trait Fetch {
    fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE_RU));
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<String> {
        debug!("Fetching {}", url);
        let body = self
            .client
            .get(url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("GET {url} failed"))?
            .text()
            .with_context(|| format!("failed to read body of {url}"))?;
        Ok(body)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use anyhow::{bail, Result};

    use super::Fetch;

    /// Canned fetcher for stage tests: a URL mapped to `Some(html)` serves
    /// that body, `None` fails, anything else is a 404. Records fetch order.
    pub(crate) struct StubFetcher {
        pages: HashMap<String, Option<String>>,
        pub(crate) calls: RefCell<Vec<String>>,
    }

    impl StubFetcher {
        pub(crate) fn new(pages: Vec<(&str, Option<&str>)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(url, html)| (url.to_string(), html.map(String::from)))
                    .collect(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Fetch for StubFetcher {
        fn fetch(&self, url: &str) -> Result<String> {
            self.calls.borrow_mut().push(url.to_string());
            match self.pages.get(url) {
                Some(Some(html)) => Ok(html.clone()),
                Some(None) => bail!("simulated network error for {url}"),
                None => bail!("404 for {url}"),
            }
        }
    }
}
