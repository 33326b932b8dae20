//! HTTP client for the REST side of a Web Thing

use std::time::Duration;

use reqwest::{header, Client, Method, Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::config::TargetConfig;
use crate::error::{ConformanceError, ConformanceResult};

/// REST client bound to one target and its path prefix
#[derive(Clone)]
pub struct ThingClient {
    client: Client,
    config: TargetConfig,
}

/// Response from a REST call, reduced to what the checks look at
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    pub body: Option<Value>,
    pub raw_body: String,
    /// Why a non-empty body could not be parsed as JSON
    pub parse_error: Option<String>,
}

impl ThingClient {
    /// Create a client for the configured target
    pub fn new(config: &TargetConfig) -> ConformanceResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Make a GET request
    pub async fn get(&self, path: &str) -> ConformanceResult<ApiResponse> {
        self.request(Method::GET, path, None).await
    }

    /// Make a PUT request with a JSON body
    pub async fn put(&self, path: &str, body: Value) -> ConformanceResult<ApiResponse> {
        self.request(Method::PUT, path, Some(body)).await
    }

    /// Make a POST request with a JSON body
    pub async fn post(&self, path: &str, body: Value) -> ConformanceResult<ApiResponse> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> ConformanceResult<ApiResponse> {
        self.request(Method::DELETE, path, None).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ConformanceResult<ApiResponse> {
        let url = self.config.url(path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(header::ACCEPT, "application/json");

        if let Some(ref auth) = self.config.authorization {
            request = request.header(header::AUTHORIZATION, auth);
        }

        match body {
            Some(ref body) => {
                debug!(%method, %url, %body, "request");
                request = request.json(body);
            }
            None => debug!(%method, %url, "request"),
        }

        let response = request.send().await?;
        Self::parse_response(method, path, response).await
    }

    async fn parse_response(
        method: Method,
        path: &str,
        response: Response,
    ) -> ConformanceResult<ApiResponse> {
        let status = response.status();
        let raw_body = response.text().await?;
        debug!(status = status.as_u16(), body = %raw_body, "response");

        // Parse failures surface from json() so a wrong status is reported first.
        let (body, parse_error) = if raw_body.trim().is_empty() {
            (None, None)
        } else {
            match serde_json::from_str(&raw_body) {
                Ok(body) => (Some(body), None),
                Err(e) => (None, Some(e.to_string())),
            }
        };

        Ok(ApiResponse {
            method,
            path: path.to_string(),
            status,
            body,
            raw_body,
            parse_error,
        })
    }
}

impl ApiResponse {
    /// Fail unless the response carries the given status
    pub fn expect_status(self, expected: StatusCode) -> ConformanceResult<Self> {
        if self.status != expected {
            return Err(ConformanceError::Status {
                method: self.method.to_string(),
                path: self.path.clone(),
                expected: expected.as_u16(),
                actual: self.status.as_u16(),
            });
        }
        Ok(self)
    }

    /// The JSON body, failing if the response had none
    pub fn json(&self) -> ConformanceResult<&Value> {
        if let Some(ref error) = self.parse_error {
            return Err(ConformanceError::shape(
                format!("{} {} body", self.method, self.path),
                "JSON",
                error,
            ));
        }
        self.body.as_ref().ok_or_else(|| {
            ConformanceError::shape(
                format!("{} {} body", self.method, self.path),
                "a JSON body",
                "an empty body",
            )
        })
    }

    /// Consume the response, returning its JSON body
    pub fn into_json(self) -> ConformanceResult<Value> {
        self.json()?;
        Ok(self.body.unwrap_or(Value::Null))
    }

    /// Fail if the response carried a body
    pub fn expect_empty(&self) -> ConformanceResult<()> {
        if !self.raw_body.trim().is_empty() {
            return Err(ConformanceError::shape(
                format!("{} {} body", self.method, self.path),
                "no body",
                &self.raw_body,
            ));
        }
        Ok(())
    }
}
