use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::SalesforceConfig;
use crate::error::{AppError, Result};

use super::auth::{request_session, Session};

#[derive(Debug, Deserialize)]
struct QueryResponse {
    records: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    success: bool,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

/// Thin REST client for the Salesforce data API.
pub struct SalesforceClient {
    http: Client,
    config: SalesforceConfig,
    session: RwLock<Option<Session>>,
}

impl SalesforceClient {
    pub fn new(config: &SalesforceConfig) -> Self {
        Self {
            http: Client::new(),
            config: config.clone(),
            session: RwLock::new(None),
        }
    }

    async fn session(&self) -> Result<Session> {
        {
            let cached = self.session.read().await;
            if let Some(session) = cached.as_ref().filter(|s| s.is_fresh()) {
                return Ok(session.clone());
            }
        }

        let session = request_session(&self.http, &self.config).await?;
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    async fn invalidate(&self) {
        *self.session.write().await = None;
    }

    fn data_url(&self, session: &Session, path: &str) -> String {
        format!(
            "{}/services/data/{}/{}",
            session.instance_url, self.config.api_version, path
        )
    }

    /// Send a request, re-authenticating once if the session was revoked.
    async fn send(
        &self,
        method: Method,
        path: &str,
        build: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut reauthenticated = false;
        loop {
            let session = self.session().await?;
            let request = self
                .http
                .request(method.clone(), self.data_url(&session, path))
                .bearer_auth(&session.access_token);
            let response = build(request).send().await?;

            if response.status() == StatusCode::UNAUTHORIZED && !reauthenticated {
                tracing::warn!("Salesforce session rejected, re-authenticating");
                self.invalidate().await;
                reauthenticated = true;
                continue;
            }

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Err(AppError::SalesforceNotFound(path.to_string()));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::Salesforce(format!(
                    "{method} {path} returned {status}: {body}"
                )));
            }
            return Ok(response);
        }
    }

    /// Run a SOQL query and return the raw records.
    pub async fn query(&self, soql: &str) -> Result<Vec<serde_json::Value>> {
        let path = format!("query?q={}", urlencoding::encode(soql));
        let response = self.send(Method::GET, &path, |r| r).await?;
        let parsed: QueryResponse = response.json().await?;
        Ok(parsed.records)
    }

    /// Create an sObject record and return its id.
    pub async fn create(&self, sobject: &str, body: &serde_json::Value) -> Result<String> {
        let path = format!("sobjects/{sobject}");
        let response = self.send(Method::POST, &path, |r| r.json(body)).await?;
        let created: CreateResponse = response.json().await?;
        if !created.success {
            return Err(AppError::Salesforce(format!(
                "creating {sobject} failed: {}",
                serde_json::Value::Array(created.errors)
            )));
        }
        Ok(created.id)
    }

    pub async fn update(&self, sobject: &str, id: &str, body: &serde_json::Value) -> Result<()> {
        let path = format!("sobjects/{sobject}/{}", urlencoding::encode(id));
        self.send(Method::PATCH, &path, |r| r.json(body)).await?;
        Ok(())
    }
}
