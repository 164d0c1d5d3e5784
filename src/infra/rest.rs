//! REST source for the hosted backend.
//!
//! Reads rows with `GET {base}/rest/v1/{table}?{query}`, authenticated with the
//! project API key both as `apikey` header and bearer token.

use std::fmt;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, Response, Url};
use serde_json::Value;
use tracing::debug;

use crate::cache::{CacheKey, Resource};
use crate::config::BackendSettings;

use super::error::InfraError;

const REST_PATH: &str = "rest/v1/";

#[derive(Clone)]
pub struct RestSource {
    client: Client,
    base: Url,
    api_key: Option<String>,
}

impl fmt::Debug for RestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestSource")
            .field("base", &self.base.as_str())
            .field("authenticated", &self.api_key.is_some())
            .finish()
    }
}

impl RestSource {
    pub fn new(settings: &BackendSettings) -> Result<Self, InfraError> {
        let base = settings.base_url.as_ref().ok_or_else(|| {
            InfraError::configuration(
                "backend.url is required (use --backend-url or CABINET__BACKEND__URL)",
            )
        })?;
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            client,
            base: rest_base(base)?,
            api_key: settings.api_key.clone(),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("cabinet/", env!("CARGO_PKG_VERSION"))
    }

    /// URL of `table` with an optional raw query string.
    pub fn url(&self, table: &str, query: Option<&str>) -> Result<Url, InfraError> {
        let mut url = self
            .base
            .join(table)
            .map_err(|err| InfraError::configuration(format!("invalid table `{table}`: {err}")))?;
        url.set_query(query.filter(|query| !query.is_empty()));
        Ok(url)
    }

    /// Cache key under which rows of `resource` selected by `query` are stored.
    ///
    /// Query parameters are hashed so that equivalent queries share one entry
    /// regardless of parameter order.
    pub fn cache_key(resource: Resource, query: Option<&str>) -> CacheKey {
        let key = CacheKey::for_resource(resource);
        match query.filter(|query| !query.is_empty()) {
            Some(query) => {
                let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect();
                key.params(&pairs)
            }
            None => key,
        }
    }

    /// Fetch the rows of `table`.
    pub async fn fetch(&self, table: &str, query: Option<&str>) -> Result<Value, InfraError> {
        let url = self.url(table, query)?;
        debug!(target = "cabinet::rest", %url, "fetching rows");

        let mut request = self.client.get(url);
        if let Some(key) = self.api_key.as_deref() {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request.send().await?;
        Self::handle(response).await
    }

    /// Fetch function for [`crate::cache::SwrCache::read`] reading `resource`.
    pub fn fetcher(
        &self,
        resource: Resource,
        query: Option<String>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Value, InfraError>> + Send + 'static {
        let source = self.clone();
        move || {
            async move { source.fetch(resource.as_str(), query.as_deref()).await }.boxed()
        }
    }

    async fn handle(response: Response) -> Result<Value, InfraError> {
        let status = response.status();
        if !status.is_success() {
            return Err(InfraError::Status {
                status,
                url: response.url().to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

fn rest_base(base: &Url) -> Result<Url, InfraError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(REST_PATH)
        .map_err(|err| InfraError::configuration(format!("invalid backend.url: {err}")))
}
