#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use chrono::Utc;
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderValue, PRAGMA};
use serde_json::Value;
use tracing::debug;
use url::Url;
use wikichat_domain::SecretString;

/// Session cookie lifetime (ten years).
const COOKIE_MAX_AGE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Query string as ordered key/value pairs.
pub type Query = Vec<(String, String)>;

/// HTTP boundary used by the site lookups and the long-poll connections.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
	/// GET returning a JSON document.
	async fn get(&self, url: &str, query: &[(String, String)]) -> anyhow::Result<Value>;

	/// POST a form body, returning a JSON document.
	async fn post(&self, url: &str, query: &[(String, String)], form: &[(String, String)]) -> anyhow::Result<Value>;

	/// Long-poll exchange: GET without a body, POST with one. Returns the raw response text.
	async fn poll(&self, url: &str, query: &[(String, String)], body: Option<String>) -> anyhow::Result<String>;
}

/// `reqwest` transport with a session cookie for the service domain.
#[derive(Debug, Clone)]
pub struct HttpTransport {
	client: reqwest::Client,
}

impl HttpTransport {
	/// Builds the client; with a token, `access_token` is set as a cookie valid for every host under `base_domain`.
	pub fn new(user_agent: &str, base_domain: &str, token: Option<&SecretString>) -> anyhow::Result<Self> {
		let jar = Jar::default();
		if let Some(token) = token {
			let origin = Url::parse(&format!("http://{base_domain}/")).context("parse service domain")?;
			jar.add_cookie_str(
				&format!(
					"access_token={}; Max-Age={COOKIE_MAX_AGE_SECS}; Domain={base_domain}; Path=/; HttpOnly",
					token.expose()
				),
				&origin,
			);
		}

		let client = reqwest::Client::builder()
			.user_agent(user_agent)
			.cookie_provider(Arc::new(jar))
			.build()
			.context("build http client")?;
		Ok(Self { client })
	}

	fn poll_headers() -> HeaderMap {
		let mut headers = HeaderMap::new();
		headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain;charset=UTF-8"));
		headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
		headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
		headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
		headers
	}
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
	async fn get(&self, url: &str, query: &[(String, String)]) -> anyhow::Result<Value> {
		let resp = self.client.get(url).query(query).send().await.with_context(|| format!("GET {url}"))?;
		if !resp.status().is_success() {
			return Err(anyhow!("GET {url} failed: status={}", resp.status()));
		}
		resp.json().await.with_context(|| format!("parse JSON from {url}"))
	}

	async fn post(&self, url: &str, query: &[(String, String)], form: &[(String, String)]) -> anyhow::Result<Value> {
		let resp = self
			.client
			.post(url)
			.query(query)
			.form(form)
			.send()
			.await
			.with_context(|| format!("POST {url}"))?;
		if !resp.status().is_success() {
			return Err(anyhow!("POST {url} failed: status={}", resp.status()));
		}
		resp.json().await.with_context(|| format!("parse JSON from {url}"))
	}

	async fn poll(&self, url: &str, query: &[(String, String)], body: Option<String>) -> anyhow::Result<String> {
		let cache_buster = Utc::now().timestamp_millis().to_string();
		let request = match body {
			Some(body) => self.client.post(url).body(body),
			None => self.client.get(url),
		};

		let resp = request
			.headers(Self::poll_headers())
			.query(query)
			.query(&[("t", cache_buster.as_str())])
			.send()
			.await
			.with_context(|| format!("poll {url}"))?;

		let status = resp.status();
		let text = resp.text().await.context("read poll response")?;
		if !status.is_success() {
			debug!(%status, body = %text, "poll request rejected");
			return Err(anyhow!("poll {url} failed: status={status}"));
		}
		Ok(text)
	}
}
