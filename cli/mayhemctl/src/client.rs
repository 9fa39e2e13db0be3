//! HTTP client for the control API.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};

use crate::error::CliError;

#[derive(Debug, Clone)]
pub struct ControlClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct BehaviorList {
    pub behaviors: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActiveBehavior {
    pub behavior: String,
}

impl ControlClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn behaviors(&self) -> Result<BehaviorList, CliError> {
        let response = self.client.get(self.url("/behaviors")).send().await?;
        self.handle_response(response).await
    }

    pub async fn active_behavior(&self) -> Result<ActiveBehavior, CliError> {
        let response = self.client.get(self.url("/behavior")).send().await?;
        self.handle_response(response).await
    }

    /// Switch the active behavior. `options` are sent next to `name`.
    pub async fn set_behavior(
        &self,
        name: &str,
        options: Map<String, Value>,
    ) -> Result<(), CliError> {
        let body = request_body(name, options);
        let response = self.client.put(self.url("/behavior")).json(&body).send().await?;
        self.handle_response::<Value>(response).await.map(|_| ())
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CliError> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to parse response: {}", e)))
        } else {
            let body: ErrorResponse = response.json().await.unwrap_or_default();
            Err(CliError::Api {
                status: status.as_u16(),
                errors: body.describe(),
            })
        }
    }
}

fn request_body(name: &str, mut options: Map<String, Value>) -> Value {
    options.insert("name".to_string(), Value::String(name.to_string()));
    Value::Object(options)
}

/// `{"status":"error","errors":[...]}` as sent by the control API.
#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<FieldError>,
}

#[derive(Debug, Deserialize)]
struct FieldError {
    name: String,
    description: String,
}

impl ErrorResponse {
    fn describe(self) -> Vec<String> {
        if self.errors.is_empty() {
            return vec!["unknown error".to_string()];
        }
        self.errors
            .into_iter()
            .map(|e| format!("{}: {}", e.name, e.description))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_building() {
        let client = ControlClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.url("/behavior"), "http://localhost:8080/behavior");
    }

    #[test]
    fn test_name_wins_over_option() {
        let mut options = Map::new();
        options.insert("sleep".to_string(), json!(2));
        options.insert("name".to_string(), json!("ignored"));
        assert_eq!(
            request_body("delay", options),
            json!({ "name": "delay", "sleep": 2 })
        );
    }

    #[test]
    fn test_error_body_description() {
        let body: ErrorResponse = serde_json::from_value(json!({
            "status": "error",
            "errors": [{ "location": "body", "name": "name", "description": "unknown behavior" }]
        }))
        .unwrap();
        assert_eq!(body.describe(), vec!["name: unknown behavior"]);
        assert_eq!(ErrorResponse::default().describe(), vec!["unknown error"]);
    }
}
