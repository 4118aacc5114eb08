#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tether_core::{Event, EventBus, EventKind, SessionEvent, Toast, ToastLevel};
use url::Url;

use crate::gateway::{
	ApiError, CallOptions, GatewayConfig, HttpRequest, HttpResponse, HttpTransport, Method, RestGateway,
};

/// Scripted transport: answers from a queue (falling back to `200 {}`) after `latency`.
#[derive(Default)]
struct FakeTransport {
	latency: Duration,
	responses: Mutex<VecDeque<anyhow::Result<HttpResponse>>>,
	requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
	fn with_latency(latency: Duration) -> Self {
		Self {
			latency,
			..Self::default()
		}
	}

	fn respond(&self, status: u16, body: Value) {
		self.responses.lock().push_back(Ok(HttpResponse { status, body }));
	}

	fn fail(&self, message: &str) {
		self.responses.lock().push_back(Err(anyhow::anyhow!(message.to_string())));
	}

	fn calls(&self) -> usize {
		self.requests.lock().len()
	}

	fn last_url(&self) -> String {
		self.requests
			.lock()
			.last()
			.map(|r| r.url.to_string())
			.unwrap_or_default()
	}
}

#[async_trait]
impl HttpTransport for FakeTransport {
	async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
		self.requests.lock().push(request);
		if !self.latency.is_zero() {
			tokio::time::sleep(self.latency).await;
		}
		self.responses.lock().pop_front().unwrap_or_else(|| {
			Ok(HttpResponse {
				status: 200,
				body: json!({}),
			})
		})
	}
}

fn gateway(transport: Arc<FakeTransport>) -> (RestGateway, EventBus) {
	let bus = EventBus::new();
	let base = Url::parse("https://api.example.test/api/1/").expect("base url");
	(RestGateway::new(GatewayConfig::new(base), transport, bus.clone()), bus)
}

fn record<T: Send + 'static>(
	bus: &EventBus,
	kind: EventKind,
	pick: impl Fn(&Event) -> Option<T> + Send + Sync + 'static,
) -> Arc<Mutex<Vec<T>>> {
	let seen = Arc::new(Mutex::new(Vec::new()));
	let sink = seen.clone();
	bus.subscribe(kind, move |ev| {
		if let Some(v) = pick(ev) {
			sink.lock().push(v);
		}
		Ok(())
	});
	seen
}

fn toasts(bus: &EventBus) -> Arc<Mutex<Vec<Toast>>> {
	record(bus, EventKind::Toast, |ev| match ev {
		Event::Toast(t) => Some(t.clone()),
		_ => None,
	})
}

#[tokio::test(start_paused = true)]
async fn identical_gets_share_one_request() {
	let transport = Arc::new(FakeTransport::with_latency(Duration::from_millis(200)));
	transport.respond(200, json!({ "id": "usr_a" }));
	let (gw, _) = gateway(transport.clone());

	let first = gw.call("users/usr_a", CallOptions::get().param("b", 2).param("a", "x"));
	let second = gw.call("users/usr_a", CallOptions::get().param("a", "x").param("b", 2));
	let probe = async {
		tokio::task::yield_now().await;
		gw.in_flight_len()
	};

	let (a, b, in_flight) = tokio::join!(first, second, probe);
	assert_eq!(in_flight, 1);
	assert_eq!(a, Ok(json!({ "id": "usr_a" })));
	assert_eq!(a, b);
	assert_eq!(transport.calls(), 1);
	assert_eq!(gw.in_flight_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn query_params_are_sorted_and_encoded() {
	let transport = Arc::new(FakeTransport::default());
	let (gw, _) = gateway(transport.clone());

	gw.call("/auth/user/friends", CallOptions::get().param("b", 2).param("a", "x y"))
		.await
		.expect("call");

	assert_eq!(
		transport.last_url(),
		"https://api.example.test/api/1/auth/user/friends?a=x%20y&b=2"
	);
}

#[tokio::test(start_paused = true)]
async fn not_found_get_cools_down_for_fifteen_minutes() {
	let transport = Arc::new(FakeTransport::default());
	transport.respond(404, json!({ "error": { "message": "not found", "status_code": 404 } }));
	let (gw, _) = gateway(transport.clone());

	let err = gw.call("worlds/wrld_gone", CallOptions::get()).await;
	assert!(matches!(err, Err(ApiError::NotFound { .. })), "{err:?}");

	tokio::time::advance(Duration::from_secs(14 * 60)).await;
	let err = gw.call("worlds/wrld_gone", CallOptions::get()).await;
	assert!(matches!(err, Err(ApiError::CoolingDown { .. })), "{err:?}");
	assert_eq!(transport.calls(), 1);

	tokio::time::advance(Duration::from_secs(61)).await;
	let ok = gw.call("worlds/wrld_gone", CallOptions::get()).await;
	assert!(ok.is_ok(), "{ok:?}");
	assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn non_404_outcome_clears_the_cooldown() {
	let transport = Arc::new(FakeTransport::default());
	transport.respond(404, Value::Null);
	let (gw, _) = gateway(transport.clone());

	let _ = gw.call("avatars/avtr_1", CallOptions::get()).await;
	// Writes to the same endpoint are not gated and reset it.
	gw.call("avatars/avtr_1", CallOptions::put().param("name", "n"))
		.await
		.expect("put");
	gw.call("avatars/avtr_1", CallOptions::get()).await.expect("get after reset");
	assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn writes_carry_params_as_json_body() {
	let transport = Arc::new(FakeTransport::default());
	let (gw, _) = gateway(transport.clone());

	gw.call("favorites", CallOptions::post().param("type", "friend").param("favoriteId", "usr_a"))
		.await
		.expect("post");

	let req = transport.requests.lock()[0].clone();
	assert_eq!(req.method, Method::Post);
	assert_eq!(req.url.query(), None);
	assert_eq!(req.body, Some(json!({ "type": "friend", "favoriteId": "usr_a" })));
}

#[tokio::test(start_paused = true)]
async fn success_envelope_raises_toast() {
	let transport = Arc::new(FakeTransport::default());
	transport.respond(200, json!({ "success": { "message": "Friend removed", "status_code": 200 } }));
	let (gw, bus) = gateway(transport);
	let seen = toasts(&bus);

	gw.call("auth/user/friends/usr_a", CallOptions::delete()).await.expect("delete");

	assert_eq!(*seen.lock(), vec![Toast::success("Friend removed")]);
}

#[tokio::test(start_paused = true)]
async fn missing_credentials_requests_auto_login_once_per_session() {
	let transport = Arc::new(FakeTransport::default());
	for _ in 0..3 {
		transport.respond(401, json!({ "error": { "message": "\"Missing Credentials\"", "status_code": 401 } }));
	}
	let (gw, bus) = gateway(transport);
	let logins = record(&bus, EventKind::Session, |ev| match ev {
		Event::Session(SessionEvent::AutoLoginRequested) => Some(()),
		_ => None,
	});

	let err = gw.call("auth/user", CallOptions::get()).await;
	assert_eq!(
		err,
		Err(ApiError::Unauthorized {
			message: "Missing Credentials".to_string()
		})
	);
	let _ = gw.call("auth/user", CallOptions::get()).await;
	assert_eq!(logins.lock().len(), 1);

	gw.reset_session();
	let _ = gw.call("auth/user", CallOptions::get()).await;
	assert_eq!(logins.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn remote_error_is_typed_and_toasted() {
	let transport = Arc::new(FakeTransport::default());
	transport.respond(400, json!({ "error": { "message": "bad tag", "status_code": 400 } }));
	let (gw, bus) = gateway(transport);
	let seen = toasts(&bus);

	let err = gw.call("favorites", CallOptions::post().param("tags", "x")).await;
	assert_eq!(
		err,
		Err(ApiError::Remote {
			status: 400,
			message: "bad tag".to_string(),
			endpoint: "favorites".to_string(),
		})
	);
	let seen = seen.lock();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].level, ToastLevel::Error);
	assert!(seen[0].message.contains("bad tag"));
}

#[tokio::test(start_paused = true)]
async fn transport_failure_is_not_retried() {
	let transport = Arc::new(FakeTransport::default());
	transport.fail("connection reset");
	let (gw, _) = gateway(transport.clone());

	let err = gw.call("auth/user", CallOptions::get()).await;
	assert!(
		matches!(&err, Err(ApiError::Transport { message, .. }) if message.contains("connection reset")),
		"{err:?}"
	);
	assert_eq!(transport.calls(), 1);
	assert_eq!(gw.in_flight_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_caller_does_not_cancel_request() {
	let transport = Arc::new(FakeTransport::with_latency(Duration::from_secs(1)));
	let (gw, _) = gateway(transport.clone());

	let caller = tokio::spawn({
		let gw = gw.clone();
		async move { gw.call("users/usr_a", CallOptions::get()).await }
	});
	tokio::time::sleep(Duration::from_millis(10)).await;
	caller.abort();
	assert_eq!(gw.in_flight_len(), 1);

	tokio::time::sleep(Duration::from_secs(2)).await;
	assert_eq!(transport.calls(), 1);
	assert_eq!(gw.in_flight_len(), 0);
}
