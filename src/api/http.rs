use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::wire::{EntityResponse, ListResponse};
use super::{AbortSignal, ApiError, CollectionApi, PageSlice, Patch};
use crate::cache::Entity;
use crate::config::{ApiConfig, Config};
use crate::filters::FilterContext;

/// Longest error body kept in an `ApiError::Http` message.
const MAX_ERROR_BODY: usize = 200;

/// HTTP client for one REST collection (e.g. `/products`).
pub struct HttpCollectionApi<E> {
  client: reqwest::Client,
  base: Url,
  resource: String,
  _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for HttpCollectionApi<E> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      base: self.base.clone(),
      resource: self.resource.clone(),
      _entity: PhantomData,
    }
  }
}

impl<E: Entity> HttpCollectionApi<E> {
  /// Create a client for `resource` under the configured base URL.
  pub fn new(config: &ApiConfig, resource: &str) -> Result<Self> {
    let base =
      Url::parse(&config.base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("API base URL cannot be used as a base: {}", config.base_url));
    }

    let mut headers = HeaderMap::new();
    if let Some(token) = Config::api_token() {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("API token is not a valid header value: {}", e))?;
      headers.insert(AUTHORIZATION, value);
    }

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      resource: resource.trim_matches('/').to_string(),
      _entity: PhantomData,
    })
  }

  /// Build `{base}/{resource}/{segments...}` with each segment escaped.
  fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| ApiError::Transport(format!("invalid base URL {}", self.base)))?
      .pop_if_empty()
      .push(&self.resource)
      .extend(segments);
    Ok(url)
  }

  async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
    let response = request
      .send()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(http_error(status, &body));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
  }
}

fn http_error(status: StatusCode, body: &str) -> ApiError {
  let message: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
  ApiError::Http {
    status: status.as_u16(),
    message: if message.is_empty() {
      status.canonical_reason().unwrap_or("error").to_string()
    } else {
      message
    },
  }
}

#[async_trait]
impl<E: Entity> CollectionApi<E> for HttpCollectionApi<E> {
  async fn fetch_page(
    &self,
    page: u32,
    page_size: u32,
    filters: &FilterContext,
  ) -> Result<PageSlice<E>, ApiError> {
    let mut url = self.endpoint(&[])?;
    {
      let mut query = url.query_pairs_mut();
      query
        .append_pair("page", &page.to_string())
        .append_pair("page_size", &page_size.to_string());
      if !filters.search_term().is_empty() {
        query.append_pair("search", filters.search_term());
      }
      if let Some(category) = &filters.category {
        query.append_pair("category", category);
      }
      if let Some(stock) = filters.stock_filter.as_query() {
        query.append_pair("stock", stock);
      }
    }

    debug!(url = %url, "fetching page");
    let response: ListResponse<E> = self.send_json(self.client.get(url)).await?;
    Ok(response.into_slice())
  }

  async fn search(&self, term: &str, signal: &AbortSignal) -> Result<Vec<E>, ApiError> {
    if signal.is_aborted() {
      return Err(ApiError::Aborted);
    }

    let mut url = self.endpoint(&["search"])?;
    url.query_pairs_mut().append_pair("q", term);

    debug!(url = %url, "searching");
    let request = self.send_json::<ListResponse<E>>(self.client.get(url));

    tokio::select! {
      biased;
      _ = signal.cancelled() => Err(ApiError::Aborted),
      response = request => Ok(response?.into_slice().items),
    }
  }

  async fn mutate(&self, id: &str, patch: &Patch) -> Result<E, ApiError> {
    let url = self.endpoint(&[id])?;

    debug!(url = %url, fields = patch.len(), "patching entity");
    let response: EntityResponse<E> = self
      .send_json(self.client.patch(url).json(patch))
      .await?;
    Ok(response.into_entity())
  }
}
