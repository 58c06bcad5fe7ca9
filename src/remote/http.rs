//! HTTP implementation of the remote data service.

use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{RemoteDataService, TableInfo};
use crate::config::RemoteConfig;
use crate::connectivity::ReachabilityProbe;
use crate::error::{RemoteError, RemoteResult};
use crate::sync::SyncJob;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// REST client for the portal backend.
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base: Url,
  page_size: u64,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, api_key: Option<String>) -> RemoteResult<Self> {
    let base = Url::parse(&config.url)?;
    if base.cannot_be_a_base() {
      return Err(RemoteError::Rejected(format!(
        "remote url {} cannot carry paths",
        config.url
      )));
    }

    let mut headers = header::HeaderMap::new();
    if let Some(key) = api_key {
      let value = header::HeaderValue::from_str(&format!("Bearer {}", key))
        .map_err(|e| RemoteError::Rejected(format!("invalid api key: {}", e)))?;
      headers.insert(header::AUTHORIZATION, value);
    }

    let client = Client::builder()
      .default_headers(headers)
      .connect_timeout(Duration::from_secs(config.timeout_secs))
      .build()?;

    Ok(Self {
      client,
      base,
      page_size: config.page_size.max(1),
    })
  }

  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base.clone();
    // cannot_be_a_base was rejected in new()
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  async fn check(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
      status: status.as_u16(),
      body,
    })
  }

  async fn get_json<T: DeserializeOwned>(&self, url: Url) -> RemoteResult<T> {
    let response = self.client.get(url).send().await?;
    Ok(Self::check(response).await?.json().await?)
  }
}

#[async_trait]
impl RemoteDataService for HttpRemote {
  async fn list_tables(&self) -> RemoteResult<Vec<TableInfo>> {
    self.get_json(self.endpoint(&["tables"])).await
  }

  async fn fetch_all(&self, table: &str) -> RemoteResult<Vec<serde_json::Value>> {
    let mut records = Vec::new();
    let mut offset = 0u64;

    loop {
      let mut url = self.endpoint(&["tables", table, "records"]);
      url
        .query_pairs_mut()
        .append_pair("offset", &offset.to_string())
        .append_pair("limit", &self.page_size.to_string());

      let page: Vec<serde_json::Value> = self.get_json(url).await?;
      let page_len = page.len() as u64;
      records.extend(page);

      // A short page is the last page
      if page_len < self.page_size {
        break;
      }
      offset += page_len;
    }

    debug!(table, records = records.len(), "fetched remote table");
    Ok(records)
  }

  async fn apply_mutation(&self, job: &SyncJob) -> RemoteResult<()> {
    let response = self
      .client
      .post(self.endpoint(&["mutations"]))
      .json(job)
      .send()
      .await?;
    Self::check(response).await?;
    Ok(())
  }
}

#[async_trait]
impl ReachabilityProbe for HttpRemote {
  async fn is_reachable(&self) -> bool {
    let request = self
      .client
      .get(self.endpoint(&["health"]))
      .timeout(PROBE_TIMEOUT);
    match request.send().await {
      Ok(response) => response.status().is_success(),
      Err(e) => {
        debug!(error = %e, "remote unreachable");
        false
      }
    }
  }
}
