//! HTTP(S) backend: ranged GETs against any server that honours `Range`.
//!
//! Object keys are full URLs. The object size is only learned on offset-0
//! fetches (range responses do not carry the total), via a `HEAD` request
//! with a `GET` fallback for servers that reject `HEAD`.

use anyhow::anyhow;
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::RANGE;
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::source::{StreamAtResponse, StreamSource};

pub struct HttpBackend {
    client: reqwest::Client,
    headers: Vec<(String, String)>,
    basic_auth: Option<(String, String)>,
    cancel: CancellationToken,
}

pub struct HttpBackendBuilder {
    client: Option<reqwest::Client>,
    headers: Vec<(String, String)>,
    basic_auth: Option<(String, String)>,
    cancel: Option<CancellationToken>,
}

impl HttpBackendBuilder {
    /// Use a preconfigured [`reqwest::Client`] (proxies, timeouts, TLS).
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Add a header to every request. Useful for API keys.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    /// Send basic-auth credentials with every request.
    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        self.basic_auth = Some((username.to_string(), password.to_string()));
        self
    }

    /// Cancellation for all fetches issued through this backend. Once the
    /// token fires, in-flight and future requests fail.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> HttpBackend {
        HttpBackend {
            client: self.client.unwrap_or_default(),
            headers: self.headers,
            basic_auth: self.basic_auth,
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HttpBackend {
    pub fn builder() -> HttpBackendBuilder {
        HttpBackendBuilder {
            client: None,
            headers: Vec::new(),
            basic_auth: None,
            cancel: None,
        }
    }

    pub fn new() -> Self {
        Self::default()
    }

    fn prepare(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request;
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password.clone()));
        }
        request
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        match self.cancel.run_until_cancelled(request.send()).await {
            Some(result) => result.map_err(|err| Error::Backend(anyhow::Error::new(err))),
            None => Err(Error::Backend(anyhow!("fetch cancelled"))),
        }
    }

    /// Learn the object size with a `HEAD` request, retrying as `GET` for
    /// servers that answer `HEAD` with 403/405.
    async fn key_size(&self, key: &str) -> Result<u64> {
        let response = self.execute(self.prepare(self.client.head(key))).await?;
        let status = response.status();
        if status == StatusCode::OK {
            return content_length(key, &response);
        }
        if status != StatusCode::FORBIDDEN && status != StatusCode::METHOD_NOT_ALLOWED {
            return Err(status_error(key, status));
        }
        let response = self.execute(self.prepare(self.client.get(key))).await?;
        if response.status() == StatusCode::OK {
            return content_length(key, &response);
        }
        Err(status_error(key, response.status()))
    }
}

fn content_length(key: &str, response: &Response) -> Result<u64> {
    response
        .content_length()
        .ok_or_else(|| Error::Backend(anyhow!("no content length for {key}")))
}

fn status_error(key: &str, status: StatusCode) -> Error {
    if status == StatusCode::NOT_FOUND {
        Error::NotFound(key.to_string())
    } else {
        Error::Backend(anyhow!("reader for {key}: status code {status}"))
    }
}

#[async_trait]
impl StreamSource for HttpBackend {
    async fn stream_at(&self, key: &str, offset: u64, len: u64) -> Result<StreamAtResponse> {
        let total_size = if offset == 0 {
            Some(self.key_size(key).await?)
        } else {
            None
        };

        let request = self
            .prepare(self.client.get(key))
            .header(RANGE, format!("bytes={}-{}", offset, offset + len - 1));
        let response = self.execute(request).await?;
        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(StreamAtResponse::past_end(total_size));
        }
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(status_error(key, status));
        }

        let body = StreamReader::new(Box::pin(
            response.bytes_stream().map_err(std::io::Error::other),
        ));
        Ok(StreamAtResponse {
            body: Some(Box::new(body)),
            total_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(status_error("k", StatusCode::NOT_FOUND).is_not_found());
        assert!(!status_error("k", StatusCode::INTERNAL_SERVER_ERROR).is_not_found());
    }

    #[tokio::test]
    async fn test_cancelled_token_fails_fetch() {
        let token = CancellationToken::new();
        token.cancel();
        let backend = HttpBackend::builder().cancel_token(token).build();
        let err = backend
            .stream_at("http://localhost:9/none", 0, 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
