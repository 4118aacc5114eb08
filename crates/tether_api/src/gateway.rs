#![forbid(unsafe_code)]

//! REST gateway: URL normalization, GET coalescing, 404 cooldown and error classification.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reqwest::header::{COOKIE, HeaderValue};
use serde_json::{Map, Value};
use tether_core::{Event, EventBus, SessionEvent, Toast};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::secret::SecretString;

pub const DEFAULT_BASE_URL: &str = "https://api.vrchat.cloud/api/1/";
pub const DEFAULT_NOT_FOUND_COOLDOWN: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_USER_AGENT: &str = concat!("tether/", env!("CARGO_PKG_VERSION"));

const MISSING_CREDENTIALS: &str = "Missing Credentials";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
	#[error("{endpoint}: not found recently; cooling down")]
	CoolingDown { endpoint: String },

	#[error("{endpoint}: not found")]
	NotFound { endpoint: String },

	#[error("unauthorized: {message}")]
	Unauthorized { message: String },

	#[error("{endpoint}: remote error {status}: {message}")]
	Remote { status: u16, message: String, endpoint: String },

	#[error("{endpoint}: transport error: {message}")]
	Transport { endpoint: String, message: String },

	#[error("{endpoint}: invalid endpoint")]
	InvalidEndpoint { endpoint: String },

	#[error("{endpoint}: unexpected response: {message}")]
	Decode { endpoint: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
	#[default]
	Get,
	Post,
	Put,
	Delete,
}

impl Method {
	pub const fn as_str(self) -> &'static str {
		match self {
			Method::Get => "GET",
			Method::Post => "POST",
			Method::Put => "PUT",
			Method::Delete => "DELETE",
		}
	}
}

/// Method and parameters of one call. GET parameters go into the query string, all
/// others into a JSON body.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
	pub method: Method,
	pub params: Map<String, Value>,
}

impl CallOptions {
	pub fn get() -> Self {
		Self::default()
	}

	pub fn post() -> Self {
		Self {
			method: Method::Post,
			..Self::default()
		}
	}

	pub fn put() -> Self {
		Self {
			method: Method::Put,
			..Self::default()
		}
	}

	pub fn delete() -> Self {
		Self {
			method: Method::Delete,
			..Self::default()
		}
	}

	pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.params.insert(key.into(), value.into());
		self
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
	pub method: Method,
	pub url: Url,
	pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
	pub status: u16,
	/// Parsed JSON; a non-JSON body is carried as a string.
	pub body: Value,
}

#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
	async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse>;

	/// Replace the session cookie sent with every request. Transports without a session
	/// ignore it.
	fn set_auth_cookie(&self, _cookie: Option<SecretString>) {}
}

/// [`HttpTransport`] over `reqwest`, carrying the session cookie.
pub struct ReqwestTransport {
	http: reqwest::Client,
	auth_cookie: Mutex<Option<SecretString>>,
}

impl ReqwestTransport {
	pub fn new(user_agent: &str, auth_cookie: Option<SecretString>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent(user_agent)
			.gzip(true)
			.build()
			.context("build reqwest client")?;
		Ok(Self {
			http,
			auth_cookie: Mutex::new(auth_cookie),
		})
	}
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
	async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
		let HttpRequest { method, url, body } = request;
		let mut req = match method {
			Method::Get => self.http.get(url),
			Method::Post => self.http.post(url),
			Method::Put => self.http.put(url),
			Method::Delete => self.http.delete(url),
		};

		let cookie = self.auth_cookie.lock().clone();
		if let Some(cookie) = cookie {
			let value = HeaderValue::from_str(&format!("auth={}", cookie.expose())).context("auth cookie header")?;
			req = req.header(COOKIE, value);
		}
		if let Some(body) = &body {
			req = req.json(body);
		}

		let resp = req.send().await.with_context(|| format!("{} send", method.as_str()))?;
		let status = resp.status().as_u16();
		let text = resp.text().await.with_context(|| format!("{} read body", method.as_str()))?;

		let body = if text.trim().is_empty() {
			Value::Null
		} else {
			serde_json::from_str(&text).unwrap_or(Value::String(text))
		};
		Ok(HttpResponse { status, body })
	}

	fn set_auth_cookie(&self, cookie: Option<SecretString>) {
		*self.auth_cookie.lock() = cookie;
	}
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
	pub base_url: Url,
	pub not_found_cooldown: Duration,
}

impl GatewayConfig {
	pub fn new(base_url: Url) -> Self {
		Self {
			base_url,
			not_found_cooldown: DEFAULT_NOT_FOUND_COOLDOWN,
		}
	}
}

type Pending = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

#[derive(Default)]
struct GatewayState {
	/// Endpoint -> time of its last GET 404.
	failed_gets: HashMap<String, Instant>,
	/// Normalized URL -> pending GET shared by every caller.
	in_flight: HashMap<String, Pending>,
	auto_login_requested: bool,
}

#[derive(Clone)]
pub struct RestGateway {
	inner: Arc<Inner>,
}

struct Inner {
	config: GatewayConfig,
	transport: Arc<dyn HttpTransport>,
	bus: EventBus,
	state: Mutex<GatewayState>,
}

impl RestGateway {
	pub fn new(config: GatewayConfig, transport: Arc<dyn HttpTransport>, bus: EventBus) -> Self {
		Self {
			inner: Arc::new(Inner {
				config,
				transport,
				bus,
				state: Mutex::new(GatewayState::default()),
			}),
		}
	}

	pub fn bus(&self) -> &EventBus {
		&self.inner.bus
	}

	pub fn set_auth_cookie(&self, cookie: Option<SecretString>) {
		self.inner.transport.set_auth_cookie(cookie);
	}

	/// Issue one call. The request runs on its own task, so dropping the returned future
	/// does not cancel it.
	pub async fn call(&self, endpoint: &str, options: CallOptions) -> Result<Value, ApiError> {
		metrics::counter!("tether_api_calls_total").increment(1);
		let endpoint = endpoint.trim_start_matches('/');

		if options.method != Method::Get {
			let url = self.url(endpoint, None)?;
			let request = HttpRequest {
				method: options.method,
				url,
				body: Some(Value::Object(options.params)),
			};
			let this = self.clone();
			let endpoint_owned = endpoint.to_string();
			let task = tokio::spawn(async move { this.execute(&endpoint_owned, request, None).await });
			return join(endpoint, task).await;
		}

		if self.cooling_down(endpoint) {
			metrics::counter!("tether_api_cooldown_hits_total").increment(1);
			debug!(%endpoint, "gateway: endpoint cooling down after 404");
			return Err(ApiError::CoolingDown {
				endpoint: endpoint.to_string(),
			});
		}

		let url = self.url(endpoint, Some(&options.params))?;
		let key = url.to_string();

		let pending = {
			let mut st = self.inner.state.lock();
			match st.in_flight.get(&key) {
				Some(pending) => {
					metrics::counter!("tether_api_coalesced_total").increment(1);
					debug!(%key, "gateway: joining in-flight request");
					pending.clone()
				}
				None => {
					let request = HttpRequest {
						method: Method::Get,
						url,
						body: None,
					};
					let this = self.clone();
					let endpoint_owned = endpoint.to_string();
					let in_flight_key = key.clone();
					let task = tokio::spawn(async move { this.execute(&endpoint_owned, request, Some(in_flight_key)).await });

					let endpoint_owned = endpoint.to_string();
					let pending = async move { join(&endpoint_owned, task).await }.boxed().shared();
					st.in_flight.insert(key, pending.clone());
					pending
				}
			}
		};

		pending.await
	}

	pub fn in_flight_len(&self) -> usize {
		self.inner.state.lock().in_flight.len()
	}

	/// Forget cooldowns and the auto-login latch (logout).
	pub fn reset_session(&self) {
		let mut st = self.inner.state.lock();
		st.failed_gets.clear();
		st.auto_login_requested = false;
	}

	fn cooling_down(&self, endpoint: &str) -> bool {
		let mut st = self.inner.state.lock();
		let Some(at) = st.failed_gets.get(endpoint).copied() else {
			return false;
		};
		if at.elapsed() < self.inner.config.not_found_cooldown {
			return true;
		}
		st.failed_gets.remove(endpoint);
		false
	}

	fn url(&self, endpoint: &str, params: Option<&Map<String, Value>>) -> Result<Url, ApiError> {
		let mut url = self
			.inner
			.config
			.base_url
			.join(endpoint)
			.map_err(|_| ApiError::InvalidEndpoint {
				endpoint: endpoint.to_string(),
			})?;

		if let Some(params) = params
			&& !params.is_empty()
		{
			let sorted: BTreeMap<&str, String> = params.iter().map(|(k, v)| (k.as_str(), query_value(v))).collect();
			let query = sorted
				.iter()
				.map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
				.collect::<Vec<_>>()
				.join("&");
			url.set_query(Some(&query));
		}
		Ok(url)
	}

	async fn execute(&self, endpoint: &str, request: HttpRequest, in_flight_key: Option<String>) -> Result<Value, ApiError> {
		let method = request.method;
		let sent = self.inner.transport.send(request).await;

		// Settled: later callers start a fresh request, including ones made by bus handlers
		// reacting to this outcome.
		if let Some(key) = in_flight_key {
			self.inner.state.lock().in_flight.remove(&key);
		}

		match sent {
			Ok(resp) => self.classify(endpoint, method, resp),
			Err(e) => {
				metrics::counter!("tether_api_transport_errors_total").increment(1);
				warn!(%endpoint, error = %format!("{e:#}"), "gateway: transport failure");
				Err(ApiError::Transport {
					endpoint: endpoint.to_string(),
					message: format!("{e:#}"),
				})
			}
		}
	}

	fn classify(&self, endpoint: &str, method: Method, resp: HttpResponse) -> Result<Value, ApiError> {
		let HttpResponse { status, body } = resp;

		if status == 404 && method == Method::Get {
			self.inner
				.state
				.lock()
				.failed_gets
				.insert(endpoint.to_string(), Instant::now());
			return Err(ApiError::NotFound {
				endpoint: endpoint.to_string(),
			});
		}
		self.inner.state.lock().failed_gets.remove(endpoint);

		if (200..300).contains(&status) {
			if let Some(success) = body.get("success") {
				let message = success
					.get("message")
					.and_then(Value::as_str)
					.unwrap_or("OK")
					.to_string();
				self.inner.bus.publish(Event::Toast(Toast::success(message)));
			}
			return Ok(body);
		}

		let message = error_message(&body, status);
		if status == 401 {
			if message == MISSING_CREDENTIALS {
				let first = {
					let mut st = self.inner.state.lock();
					!std::mem::replace(&mut st.auto_login_requested, true)
				};
				if first {
					self.inner.bus.publish(Event::Session(SessionEvent::AutoLoginRequested));
				}
			}
			return Err(ApiError::Unauthorized { message });
		}

		self.inner
			.bus
			.publish(Event::Toast(Toast::error(format!("{} {endpoint}: {message}", method.as_str()))));
		Err(ApiError::Remote {
			status,
			message,
			endpoint: endpoint.to_string(),
		})
	}
}

async fn join(endpoint: &str, task: tokio::task::JoinHandle<Result<Value, ApiError>>) -> Result<Value, ApiError> {
	match task.await {
		Ok(result) => result,
		Err(e) => Err(ApiError::Transport {
			endpoint: endpoint.to_string(),
			message: format!("request task failed: {e}"),
		}),
	}
}

fn query_value(v: &Value) -> String {
	match v {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

/// `{"error": {"message": ..}}`, `{"error": ".."}` or the raw body, with stray quotes removed.
fn error_message(body: &Value, status: u16) -> String {
	let raw = match body.get("error") {
		Some(Value::Object(err)) => err.get("message").and_then(Value::as_str).map(str::to_string),
		Some(Value::String(s)) => Some(s.clone()),
		_ => match body {
			Value::String(s) if !s.is_empty() => Some(s.clone()),
			_ => None,
		},
	};
	raw.map(|m| m.trim().trim_matches('"').to_string())
		.unwrap_or_else(|| format!("HTTP {status}"))
}
