#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt as _, future::BoxFuture};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tether_api::{HttpRequest, HttpResponse, HttpTransport, SecretString, WsConnector, WsSink, WsStream};
use tether_client::{App, AppDeps, BindingsFile, ClientConfig};
use tether_core::{Bucket, Event, EventKind, FeedDetail, FeedStore, MemoryStore, PipelineEvent, SessionEvent};
use tether_domain::FriendState;
use tungstenite::Message;
use url::Url;

#[derive(Default)]
struct Remote {
	paths: Mutex<Vec<String>>,
	cookie: Mutex<Option<String>>,
	/// How many upcoming current-user requests answer "Missing Credentials".
	missing_credentials: Mutex<usize>,
	notifications: Mutex<Vec<Value>>,
	/// Users the per-user route reports as offline.
	users_offline: Mutex<Vec<String>>,
}

impl Remote {
	fn count(&self, path: &str) -> usize {
		self.paths.lock().iter().filter(|p| p.as_str() == path).count()
	}

	fn route(&self, url: &Url) -> (u16, Value) {
		let offline = url.query_pairs().any(|(k, v)| k == "offline" && v == "true");
		match url.path() {
			"/api/1/auth/user" => {
				let mut missing = self.missing_credentials.lock();
				if *missing > 0 {
					*missing -= 1;
					return (
						401,
						json!({ "error": { "message": "\"Missing Credentials\"", "status_code": 401 } }),
					);
				}
				(
					200,
					json!({
						"id": "usr_me",
						"displayName": "Me",
						"friends": ["usr_a", "usr_b"],
						"onlineFriends": ["usr_a"],
						"offlineFriends": ["usr_b"],
					}),
				)
			}
			"/api/1/auth" => (200, json!({ "ok": true, "token": "authcookie_pipeline" })),
			"/api/1/auth/user/friends" if offline => (
				200,
				json!([{ "id": "usr_b", "displayName": "Bob", "state": "offline", "location": "offline" }]),
			),
			"/api/1/auth/user/friends" => (
				200,
				json!([{ "id": "usr_a", "displayName": "Alice", "state": "online", "location": "wrld_1:1" }]),
			),
			"/api/1/favorite/groups" => (
				200,
				json!([
					{ "id": "fvgrp_1", "name": "group_0", "displayName": "Besties", "type": "friend", "visibility": "private" },
					{ "id": "fvgrp_2", "name": "worlds1", "displayName": "Hangouts", "type": "world", "visibility": "public" },
				]),
			),
			"/api/1/favorites" => (
				200,
				json!([{ "id": "fvrt_1", "type": "friend", "favoriteId": "usr_a", "tags": ["group_0"] }]),
			),
			path if path.starts_with("/api/1/users/") => {
				let id = path.trim_start_matches("/api/1/users/");
				if !self.users_offline.lock().iter().any(|u| u == id) {
					return (404, json!({ "error": { "message": "no route", "status_code": 404 } }));
				}
				(
					200,
					json!({ "id": id, "displayName": "Alice", "state": "offline", "location": "offline" }),
				)
			}
			"/api/1/auth/user/notifications" => (200, Value::Array(self.notifications.lock().clone())),
			"/api/1/auth/user/playermoderations" => (200, json!([])),
			"/api/1/logout" => (200, json!({ "success": { "message": "Ok!", "status_code": 200 } })),
			_ => (404, json!({ "error": { "message": "no route", "status_code": 404 } })),
		}
	}
}

#[async_trait]
impl HttpTransport for Remote {
	async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
		self.paths.lock().push(request.url.path().to_string());
		let (status, body) = self.route(&request.url);
		Ok(HttpResponse { status, body })
	}

	fn set_auth_cookie(&self, cookie: Option<SecretString>) {
		*self.cookie.lock() = cookie.map(|c| c.expose().to_string());
	}
}

/// Accepts every connection and keeps it open until the client closes it.
fn connector(connects: Arc<Mutex<Vec<Url>>>) -> WsConnector {
	Arc::new(move |url: Url| {
		connects.lock().push(url);
		Box::pin(async move {
			let sink: WsSink =
				Box::pin(futures::sink::drain::<Message>().sink_map_err(|_| tungstenite::Error::ConnectionClosed));
			let stream: WsStream = Box::pin(futures::stream::pending::<Result<Message, tungstenite::Error>>());
			Ok((sink, stream))
		}) as BoxFuture<'static, anyhow::Result<(WsSink, WsStream)>>
	})
}

struct Harness {
	app: App,
	remote: Arc<Remote>,
	store: MemoryStore,
	connects: Arc<Mutex<Vec<Url>>>,
}

fn harness(configure: impl FnOnce(&mut ClientConfig), bindings: Option<BindingsFile>) -> Harness {
	let mut config = ClientConfig::defaults().expect("defaults");
	configure(&mut config);

	let remote = Arc::new(Remote::default());
	let store = MemoryStore::new();
	let connects = Arc::new(Mutex::new(Vec::new()));
	let deps = AppDeps {
		transport: remote.clone(),
		connector: connector(connects.clone()),
		store: Arc::new(store.clone()),
		bindings,
	};
	Harness {
		app: App::init(config, deps).expect("init"),
		remote,
		store,
		connects,
	}
}

async fn settle() {
	tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn full_refresh_populates_state_and_connects_pipeline() {
	let h = harness(|_| {}, None);
	h.remote.notifications.lock().push(json!({ "id": "not_1", "type": "friendRequest", "senderUserId": "usr_x" }));

	h.app.refresh_all().await.expect("refresh");

	let caches = h.app.caches();
	assert_eq!(caches.users.len(), 2);
	assert_eq!(caches.favorite_groups.len(), 2);
	assert_eq!(caches.favorites.len(), 1);
	assert_eq!(caches.notifications.len(), 1);

	assert_eq!(h.app.presence().state_of("usr_a"), Some(FriendState::Online));
	assert_eq!(h.app.presence().state_of("usr_b"), Some(FriendState::Offline));
	// usr_a sits in a friend favorite group.
	assert_eq!(h.app.presence().bucket(Bucket::VipOnline), vec!["usr_a"]);

	let slot = h.app.favorites().slot("friend:group_0").expect("friend slot");
	assert_eq!(slot.display_name, "Besties");
	assert_eq!(slot.count, 1);

	assert!(h.app.pipeline().is_connected());
	let connects = h.connects.lock();
	assert_eq!(connects.len(), 1);
	assert_eq!(connects[0].query(), Some("auth=authcookie_pipeline"));
}

#[tokio::test(start_paused = true)]
async fn refresh_sweeps_records_the_server_no_longer_returns() {
	let h = harness(|_| {}, None);
	*h.remote.notifications.lock() = vec![json!({ "id": "not_1" }), json!({ "id": "not_2" })];
	h.app.refresh_notifications().await.expect("first");
	assert_eq!(h.app.caches().notifications.len(), 2);

	*h.remote.notifications.lock() = vec![json!({ "id": "not_2" })];
	h.app.refresh_notifications().await.expect("second");
	assert!(h.app.caches().notifications.get("not_1").is_none());
	assert!(h.app.caches().notifications.get("not_2").is_some());
}

#[tokio::test(start_paused = true)]
async fn slot_bindings_are_persisted_and_reloaded() {
	let dir = tempfile::tempdir().expect("tempdir");
	let file = BindingsFile::new(dir.path().join("favorite_slots.toml"));

	let h = harness(|_| {}, Some(file.clone()));
	h.app.refresh_favorites().await.expect("favorites");

	let saved = file.load().expect("load");
	assert_eq!(saved.len(), 2);
	assert_eq!(saved, h.app.favorites().bindings());

	let again = harness(|_| {}, Some(file));
	assert_eq!(again.app.favorites().bindings(), saved);
}

#[tokio::test(start_paused = true)]
async fn missing_credentials_reapplies_stored_session_once() {
	let h = harness(
		|cfg| cfg.auth_cookie = Some(SecretString::new("authcookie_stored")),
		None,
	);
	*h.remote.missing_credentials.lock() = 1;

	assert!(h.app.refresh_current_user().await.is_err());
	settle().await;

	assert_eq!(h.remote.cookie.lock().as_deref(), Some("authcookie_stored"));
	assert_eq!(h.remote.count("/api/1/auth/user"), 2);
	assert!(h.app.pipeline().is_connected());

	*h.remote.missing_credentials.lock() = 1;
	assert!(h.app.refresh_current_user().await.is_err());
	settle().await;
	assert_eq!(h.remote.count("/api/1/auth/user"), 3);
}

#[tokio::test(start_paused = true)]
async fn finished_auto_login_tasks_are_not_kept() {
	let h = harness(
		|cfg| cfg.auth_cookie = Some(SecretString::new("authcookie_stored")),
		None,
	);

	for round in 1..=3 {
		*h.remote.missing_credentials.lock() = 1;
		assert!(h.app.refresh_current_user().await.is_err());
		settle().await;
		assert_eq!(h.remote.count("/api/1/auth/user"), round * 2);
		assert_eq!(h.app.tracked_tasks(), 1);
		h.app.logout().await;
	}
}

#[tokio::test(start_paused = true)]
async fn periodic_refresh_runs_until_shutdown() {
	let h = harness(|cfg| cfg.refresh_interval = Duration::from_secs(60), None);
	let logged_out = Arc::new(Mutex::new(0usize));
	{
		let logged_out = logged_out.clone();
		h.app.bus().subscribe(EventKind::Session, move |ev| {
			if let Event::Session(SessionEvent::LoggedOut) = ev {
				*logged_out.lock() += 1;
			}
			Ok(())
		});
	}

	h.app.start();
	tokio::time::sleep(Duration::from_secs(1)).await;
	assert_eq!(h.remote.count("/api/1/auth/user"), 1);

	tokio::time::sleep(Duration::from_secs(60)).await;
	assert_eq!(h.remote.count("/api/1/auth/user"), 2);
	assert_eq!(h.remote.count("/api/1/auth"), 1, "pipeline stays up between refreshes");

	h.app.shutdown().await;
	tokio::time::sleep(Duration::from_secs(300)).await;
	assert_eq!(h.remote.count("/api/1/auth/user"), 2);
	assert_eq!(h.remote.count("/api/1/logout"), 1);

	assert_eq!(*logged_out.lock(), 1);
	assert!(!h.app.pipeline().is_connected());
	assert!(h.app.caches().users.is_empty());
	assert!(h.app.presence().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stored_memos_are_loaded_at_init() {
	let store = MemoryStore::new();
	store.set_memo("usr_a", "met at the pug").expect("memo");

	let remote = Arc::new(Remote::default());
	let deps = AppDeps {
		transport: remote,
		connector: connector(Arc::new(Mutex::new(Vec::new()))),
		store: Arc::new(store),
		bindings: None,
	};
	let app = App::init(ClientConfig::defaults().expect("defaults"), deps).expect("init");
	assert_eq!(app.presence().memo("usr_a").as_deref(), Some("met at the pug"));
}

#[tokio::test(start_paused = true)]
async fn offline_push_reaches_the_store_through_the_app() {
	let h = harness(|cfg| cfg.presence_debounce = Duration::from_secs(10), None);
	h.app.refresh_all().await.expect("refresh");
	h.remote.users_offline.lock().push("usr_a".to_string());

	h.app.bus().publish(Event::Pipeline(PipelineEvent::FriendOffline {
		user_id: "usr_a".to_string(),
	}));
	tokio::time::sleep(Duration::from_secs(5)).await;
	assert_eq!(h.app.presence().state_of("usr_a"), Some(FriendState::Online));

	tokio::time::sleep(Duration::from_secs(6)).await;
	assert_eq!(h.app.presence().state_of("usr_a"), Some(FriendState::Offline));
	assert_eq!(h.remote.count("/api/1/users/usr_a"), 1);

	let persisted = h.store.feed_entries();
	assert_eq!(persisted.len(), 1);
	assert!(matches!(persisted[0].detail, FeedDetail::Offline { .. }));
	assert_eq!(h.app.feed().compose(), persisted);
}
