//! HTTP adapter for the external scheduling provider.
//!
//! Collections live at `{base_url}/{path}`, single records at
//! `{base_url}/{path}/{identity}`. List responses are either a bare JSON
//! array or `{"collection": [...], "pagination": {"next_page": url}}`.

use super::{now_millis, AdapterError, Result, StateSink, StateSource};
use async_trait::async_trait;
use converge_engine::{
    EntityKind, EntitySchema, FieldMap, Filter, Identity, Origin, Predicate, Record, Snapshot,
};
use reqwest::{header::RETRY_AFTER, Client, Response, StatusCode, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound on followed `next_page` links per fetch.
const MAX_PAGES: usize = 1000;

pub struct ProviderAdapter {
    name: String,
    client: Client,
    base_url: String,
    token: String,
    paths: HashMap<EntityKind, String>,
}

impl ProviderAdapter {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            paths: HashMap::new(),
        }
    }

    /// Map an entity kind to its collection path.
    pub fn with_path(mut self, kind: impl Into<EntityKind>, path: impl Into<String>) -> Self {
        self.paths.insert(kind.into(), path.into());
        self
    }

    fn collection_url(&self, schema: &EntitySchema) -> Result<Url> {
        let path = self
            .paths
            .get(&schema.kind)
            .map(String::as_str)
            .unwrap_or(schema.kind.as_str());
        let raw = format!("{}/{}", self.base_url, path.trim_matches('/'));
        Url::parse(&raw).map_err(|e| AdapterError::NotConfigured(format!("{raw}: {e}")))
    }

    fn record_url(&self, schema: &EntitySchema, identity: &Identity) -> Result<Url> {
        let mut url = self.collection_url(schema)?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::NotConfigured(format!("{} cannot be a base", self.base_url)))?
            .push(identity.as_str());
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        let response = self.dispatch(request).await?;
        check_status(response).await
    }

    /// Send with credentials; only transport failures are errors here.
    async fn dispatch(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(classify_transport)
    }
}

/// Translate a non-success response into an adapter error.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(AdapterError::RateLimited { retry_after });
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{status}: {body}");
    Err(match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AdapterError::Timeout,
        s if s.is_server_error() => AdapterError::Unavailable(message),
        _ => AdapterError::Rejected(message),
    })
}

fn classify_transport(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout
    } else if err.is_decode() {
        AdapterError::Malformed(err.to_string())
    } else {
        AdapterError::Unavailable(err.to_string())
    }
}

/// Split a list response into its items and the next page link.
fn parse_page(body: Value) -> Result<(Vec<Value>, Option<String>)> {
    match body {
        Value::Array(items) => Ok((items, None)),
        Value::Object(mut object) => {
            let items = match object.remove("collection") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(AdapterError::Malformed(
                        "expected a `collection` array".into(),
                    ))
                }
            };
            let next = object
                .get("pagination")
                .and_then(|p| p.get("next_page"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok((items, next))
        }
        _ => Err(AdapterError::Malformed("expected an array or object".into())),
    }
}

/// Equality predicates are sent as query parameters; everything else is
/// evaluated locally after the fetch.
fn query_params(filter: &Filter) -> Vec<(String, String)> {
    filter
        .predicates
        .iter()
        .filter_map(|p| match p {
            Predicate::Eq { field, value } => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((field.clone(), text))
            }
            _ => None,
        })
        .collect()
}

#[async_trait]
impl StateSource for ProviderAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        schema: &EntitySchema,
        filter: &Filter,
        origin: Origin,
    ) -> Result<Snapshot> {
        let captured_at = now_millis();
        let mut request = self
            .client
            .get(self.collection_url(schema)?)
            .query(&query_params(filter));
        let mut records = Vec::new();

        for page in 0.. {
            if page >= MAX_PAGES {
                return Err(AdapterError::Malformed(format!(
                    "pagination exceeded {MAX_PAGES} pages"
                )));
            }

            let body: Value = self
                .send(request)
                .await?
                .json()
                .await
                .map_err(|e| AdapterError::Malformed(e.to_string()))?;
            let (items, next) = parse_page(body)?;

            for item in items {
                let record = schema.record(item)?;
                if filter.matches(&record) {
                    records.push(record);
                }
            }

            match next {
                Some(next) => request = self.client.get(next),
                None => break,
            }
        }

        tracing::debug!(
            origin = %self.name,
            kind = %schema.kind,
            records = records.len(),
            "fetched provider collection"
        );
        Ok(Snapshot::new(schema.kind.clone(), origin, captured_at, records)?)
    }
}

#[async_trait]
impl StateSink for ProviderAdapter {
    fn as_source(&self) -> &dyn StateSource {
        self
    }

    async fn apply_create(&self, schema: &EntitySchema, record: &Record) -> Result<()> {
        let request = self
            .client
            .post(self.collection_url(schema)?)
            .json(&record.fields);
        self.send(request).await?;
        Ok(())
    }

    async fn apply_update(
        &self,
        schema: &EntitySchema,
        identity: &Identity,
        changed: &FieldMap,
    ) -> Result<()> {
        let request = self
            .client
            .patch(self.record_url(schema, identity)?)
            .json(changed);
        self.send(request).await?;
        Ok(())
    }

    async fn apply_delete(&self, schema: &EntitySchema, identity: &Identity) -> Result<()> {
        let request = self.client.delete(self.record_url(schema, identity)?);
        let response = self.dispatch(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    fn independent_creates(&self, schema: &EntitySchema) -> bool {
        schema.independent_creates
    }
}
