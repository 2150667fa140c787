use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use feed_core::cursor::PageRequest;
use feed_core::{ItemKind, Page, TxSummary};
use feed_dag::{SnapshotSource, SourceError};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    transactions: Vec<TxSummary>,
    #[serde(default)]
    has_more: bool,
}

/// Explorer REST client for the list endpoints the feeds read from.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base: Url,
}

impl ApiClient {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("Invalid api url '{base}'"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, base })
    }

    pub fn transactions_url(&self, kind: ItemKind, count: usize, request: &PageRequest) -> Result<Url> {
        let mut url = self
            .base
            .join("transaction")
            .with_context(|| format!("Invalid api base '{}'", self.base))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("type", kind.as_str());
            query.append_pair("count", &count.to_string());
            for (key, value) in request.query_pairs() {
                query.append_pair(key, &value);
            }
        }
        Ok(url)
    }

    pub async fn fetch_page(
        &self,
        kind: ItemKind,
        count: usize,
        request: &PageRequest,
    ) -> Result<Page<TxSummary>> {
        let url = self.transactions_url(kind, count, request)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Request failed: GET {url}"))?
            .error_for_status()
            .with_context(|| format!("Request failed: GET {url}"))?;
        let body: TransactionsResponse = response
            .json()
            .await
            .with_context(|| format!("Invalid response body from {url}"))?;
        let (items, has_more) = unpack(body)?;
        debug!(
            event = "api_page",
            url = %url,
            items = items.len(),
            has_more = has_more
        );
        Ok(Page::from_response(request, items, has_more))
    }

    async fn fetch_first(&self, kind: ItemKind, count: usize) -> Result<Vec<TxSummary>, SourceError> {
        self.fetch_page(kind, count, &PageRequest::First)
            .await
            .map(|page| page.items)
            .map_err(|err| SourceError::Request(format!("{err:#}")))
    }
}

fn unpack(body: TransactionsResponse) -> Result<(Vec<TxSummary>, bool)> {
    if body.success == Some(false) {
        bail!(
            "Explorer api error: {}",
            body.message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok((body.transactions, body.has_more))
}

#[async_trait]
impl SnapshotSource for ApiClient {
    async fn fetch_blocks(&self, count: usize) -> Result<Vec<TxSummary>, SourceError> {
        self.fetch_first(ItemKind::Block, count).await
    }

    async fn fetch_transactions(&self, count: usize) -> Result<Vec<TxSummary>, SourceError> {
        self.fetch_first(ItemKind::Tx, count).await
    }
}
