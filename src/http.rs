//! HTTP collaborator seam.
//!
//! stampede does not ship a network stack. Scenarios talk to the system under
//! test through any type implementing [`HttpClient`]; wrapping a call in
//! [`VuContext::http`] records the built-in `http_reqs`, `http_req_duration` and
//! `http_req_failed` metrics around it.
//!
//! With the `reqwest` feature enabled, `reqwest::Client` implements [`HttpClient`].

use std::{future::Future, time::Duration};

use tokio::time::Instant;

use crate::{
    error::BoxError,
    metric::{Sample, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED},
    scenario::VuContext,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub options: RequestOptions,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// 2xx and 3xx are expected statuses; anything else counts as a failed request.
    pub fn is_expected(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A pooled HTTP client supplied by the test author.
///
/// Implementations must be safe to share between all virtual users; connection
/// lifecycles are entirely theirs to manage.
pub trait HttpClient: Send + Sync {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, BoxError>> + Send;
}

/// [`HttpClient`] calls instrumented with the built-in HTTP metrics.
pub struct Http<'a, C> {
    client: &'a C,
    ctx: &'a VuContext,
}

impl<'a, C: HttpClient> Http<'a, C> {
    pub async fn get(
        &self,
        url: impl Into<String>,
        options: RequestOptions,
    ) -> Result<HttpResponse, BoxError> {
        self.send(HttpRequest {
            method: Method::Get,
            url: url.into(),
            options,
        })
        .await
    }

    pub async fn post(
        &self,
        url: impl Into<String>,
        body: impl Into<Vec<u8>>,
        mut options: RequestOptions,
    ) -> Result<HttpResponse, BoxError> {
        options.body = Some(body.into());
        self.send(HttpRequest {
            method: Method::Post,
            url: url.into(),
            options,
        })
        .await
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BoxError> {
        let sink = self.ctx.sink();
        let start = Instant::now();
        let result = self.client.send(request).await;
        let elapsed = start.elapsed();

        sink.add(HTTP_REQS, 1.0);
        match &result {
            Ok(response) => {
                sink.record(Sample::duration(HTTP_REQ_DURATION, elapsed));
                sink.hit(HTTP_REQ_FAILED, !response.is_expected());
            }
            Err(e) => {
                tracing::debug!(vu = self.ctx.vu(), "Request failed: {e}");
                sink.hit(HTTP_REQ_FAILED, true);
            }
        }
        result
    }
}

impl VuContext {
    /// Issue requests through `client`, recording the built-in HTTP metrics.
    pub fn http<'a, C: HttpClient>(&'a self, client: &'a C) -> Http<'a, C> {
        Http { client, ctx: self }
    }
}

#[cfg(feature = "reqwest")]
impl HttpClient for reqwest::Client {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BoxError> {
        let HttpRequest {
            method,
            url,
            options,
        } = request;
        let method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };

        let mut builder = self.request(method, url).query(&options.query);
        for (name, value) in &options.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = options.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_owned(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
