#![forbid(unsafe_code)]

//! Application state: owns every component, wires them over the bus and drives the
//! periodic refresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Context as _;
use parking_lot::Mutex;
use tether_api::{
	Api, GatewayConfig, HttpTransport, Pipeline, PipelineState, ReqwestTransport, RestGateway, WsConnector,
	default_connector,
};
use tether_core::{
	Caches, Dispatcher, Event, EventBus, EventKind, FavoriteGroupEvent, FavoriteGroups, FavoritesConfig, FeedCompositor,
	FeedConfig, FeedStore, MemoryStore, Presence, PresenceConfig, SessionEvent, SlotBindings, install_persistence,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bindings::BindingsFile;
use crate::config::ClientConfig;

/// Collaborators the application is built from. Tests swap in fakes.
pub struct AppDeps {
	pub transport: Arc<dyn HttpTransport>,
	pub connector: WsConnector,
	pub store: Arc<dyn FeedStore>,
	pub bindings: Option<BindingsFile>,
}

impl AppDeps {
	pub fn production(config: &ClientConfig) -> anyhow::Result<Self> {
		let transport = ReqwestTransport::new(&config.user_agent, config.auth_cookie.clone())?;
		Ok(Self {
			transport: Arc::new(transport),
			connector: default_connector(),
			store: Arc::new(MemoryStore::new()),
			bindings: config.bindings_path.clone().map(BindingsFile::new),
		})
	}
}

#[derive(Clone)]
pub struct App {
	inner: Arc<Inner>,
}

struct Inner {
	config: ClientConfig,
	bus: EventBus,
	caches: Caches,
	presence: Presence,
	favorites: FavoriteGroups,
	feed: FeedCompositor,
	store: Arc<dyn FeedStore>,
	api: Api,
	pipeline: Pipeline,
	/// Set once the stored session was reapplied; cleared on logout.
	auto_login_used: AtomicBool,
	shutdown: watch::Sender<bool>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
	pub fn init(config: ClientConfig, deps: AppDeps) -> anyhow::Result<Self> {
		let AppDeps {
			transport,
			connector,
			store,
			bindings,
		} = deps;

		let bus = EventBus::new();
		let caches = Caches::new(&bus);

		let gateway = RestGateway::new(
			GatewayConfig {
				base_url: config.api_base_url.clone(),
				not_found_cooldown: config.not_found_cooldown,
			},
			transport,
			bus.clone(),
		);
		let api = Api::new(gateway);

		let presence = Presence::new(
			bus.clone(),
			Arc::new(api.clone()),
			PresenceConfig {
				debounce: config.presence_debounce,
			},
		);
		presence.load_memos(store.memos().context("load memos")?);
		Dispatcher::new(bus.clone(), caches.clone(), presence.clone()).install();

		let table = match bindings.as_ref().map(BindingsFile::load).transpose() {
			Ok(table) => table.unwrap_or_default(),
			Err(e) => {
				warn!(error = %format!("{e:#}"), "app: unreadable slot bindings; starting fresh");
				SlotBindings::new()
			}
		};
		let favorites = FavoriteGroups::new(bus.clone(), FavoritesConfig::default(), table);
		favorites.install();
		if let Some(file) = bindings {
			bus.subscribe(EventKind::FavoriteGroups, move |ev| {
				if let Event::FavoriteGroups(FavoriteGroupEvent::BindingsChanged(table)) = ev {
					file.save(table)?;
				}
				Ok(())
			});
		}

		let feed = FeedCompositor::new(FeedConfig {
			wrist_cap: config.wrist_cap,
			..FeedConfig::default()
		});
		feed.install(&bus);
		install_persistence(&bus, store.clone());

		let pipeline = Pipeline::new(config.pipeline_url.clone(), bus.clone(), connector);

		let (shutdown, _) = watch::channel(false);
		let app = Self {
			inner: Arc::new(Inner {
				config,
				bus,
				caches,
				presence,
				favorites,
				feed,
				store,
				api,
				pipeline,
				auto_login_used: AtomicBool::new(false),
				shutdown,
				tasks: Mutex::new(Vec::new()),
			}),
		};

		let weak = Arc::downgrade(&app.inner);
		app.inner.bus.subscribe(EventKind::Session, move |ev| {
			if let Event::Session(SessionEvent::AutoLoginRequested) = ev
				&& let Some(app) = upgrade(&weak)
			{
				app.on_auto_login();
			}
			Ok(())
		});

		info!("app: initialised");
		Ok(app)
	}

	pub fn config(&self) -> &ClientConfig {
		&self.inner.config
	}

	pub fn bus(&self) -> &EventBus {
		&self.inner.bus
	}

	pub fn caches(&self) -> &Caches {
		&self.inner.caches
	}

	pub fn presence(&self) -> &Presence {
		&self.inner.presence
	}

	pub fn favorites(&self) -> &FavoriteGroups {
		&self.inner.favorites
	}

	pub fn feed(&self) -> &FeedCompositor {
		&self.inner.feed
	}

	pub fn store(&self) -> &Arc<dyn FeedStore> {
		&self.inner.store
	}

	pub fn api(&self) -> &Api {
		&self.inner.api
	}

	pub fn pipeline(&self) -> &Pipeline {
		&self.inner.pipeline
	}

	/// Start the periodic refresh. The first refresh runs immediately.
	pub fn start(&self) {
		let app = self.clone();
		let period = self.inner.config.refresh_interval;
		let mut shutdown = self.inner.shutdown.subscribe();

		let task = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						if let Err(e) = app.refresh_all().await {
							warn!(error = %format!("{e:#}"), "app: refresh failed");
						}
					}
					_ = shutdown.changed() => break,
				}
			}
			debug!("app: refresh loop stopped");
		});
		self.track(task);
	}

	/// Current user first (it seeds presence and gates the rest), then every other resource.
	pub async fn refresh_all(&self) -> anyhow::Result<()> {
		metrics::counter!("tether_client_refreshes_total").increment(1);
		self.refresh_current_user().await?;

		let results = [
			("friends", self.refresh_friends().await.map(|_| ())),
			("favorites", self.refresh_favorites().await),
			("notifications", self.refresh_notifications().await),
			("player_moderations", self.refresh_player_moderations().await),
		];
		for (what, result) in results {
			if let Err(e) = result {
				metrics::counter!("tether_client_refresh_failures_total").increment(1);
				warn!(what, error = %format!("{e:#}"), "app: partial refresh failed");
			}
		}
		Ok(())
	}

	/// Refresh the logged-in user; reconnect the pipeline if it is down.
	pub async fn refresh_current_user(&self) -> anyhow::Result<()> {
		self.inner.api.current_user().await.context("refresh current user")?;

		if self.inner.pipeline.state() == PipelineState::Disconnected
			&& let Err(e) = self.connect_pipeline().await
		{
			warn!(error = %format!("{e:#}"), "app: pipeline reconnect failed");
		}
		Ok(())
	}

	pub async fn connect_pipeline(&self) -> anyhow::Result<bool> {
		let token = self.inner.api.auth_token().await.context("fetch pipeline token")?;
		self.inner.pipeline.connect(&token).await.context("connect pipeline")
	}

	pub async fn refresh_friends(&self) -> anyhow::Result<usize> {
		let online = self.inner.api.friends(false).await.context("online friends")?;
		let offline = self.inner.api.friends(true).await.context("offline friends")?;
		Ok(online + offline)
	}

	pub async fn refresh_favorites(&self) -> anyhow::Result<()> {
		let groups = self.inner.caches.favorite_groups.begin_refresh();
		self.inner.api.favorite_groups().await.context("favorite groups")?;
		groups.finish();

		let favorites = self.inner.caches.favorites.begin_refresh();
		self.inner.api.favorites().await.context("favorites")?;
		favorites.finish();
		Ok(())
	}

	pub async fn refresh_notifications(&self) -> anyhow::Result<()> {
		let ticket = self.inner.caches.notifications.begin_refresh();
		self.inner.api.notifications().await.context("notifications")?;
		ticket.finish();
		Ok(())
	}

	pub async fn refresh_player_moderations(&self) -> anyhow::Result<()> {
		let ticket = self.inner.caches.player_moderations.begin_refresh();
		self.inner
			.api
			.player_moderations()
			.await
			.context("player moderations")?;
		ticket.finish();
		Ok(())
	}

	fn on_auto_login(&self) {
		if !self.inner.config.auto_login {
			debug!("app: auto-login disabled");
			return;
		}
		if self.inner.auto_login_used.swap(true, Ordering::SeqCst) {
			return;
		}
		let Some(cookie) = self.inner.config.auth_cookie.clone() else {
			warn!("app: credentials missing and no stored session to reapply");
			return;
		};
		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			warn!("app: auto-login requested outside a runtime");
			return;
		};

		info!("app: reapplying stored session");
		metrics::counter!("tether_client_auto_logins_total").increment(1);
		self.inner.api.gateway().set_auth_cookie(Some(cookie));

		let app = self.clone();
		let task = handle.spawn(async move {
			if let Err(e) = app.refresh_current_user().await {
				warn!(error = %format!("{e:#}"), "app: auto-login refresh failed");
			}
		});
		self.track(task);
	}

	/// Keep `task` for shutdown, dropping handles of tasks that already finished.
	fn track(&self, task: JoinHandle<()>) {
		let mut tasks = self.inner.tasks.lock();
		tasks.retain(|t| !t.is_finished());
		tasks.push(task);
	}

	/// Background tasks held for shutdown.
	pub fn tracked_tasks(&self) -> usize {
		self.inner.tasks.lock().len()
	}

	/// End the session: remote logout (best effort) and every piece of local state reset.
	pub async fn logout(&self) {
		// No auto-login may fire for the logout call itself.
		self.inner.auto_login_used.store(true, Ordering::SeqCst);
		if let Err(e) = self.inner.api.logout().await {
			debug!(error = %e, "app: remote logout failed");
		}

		self.inner.pipeline.disconnect();
		self.inner.presence.reset();
		match self.inner.store.memos() {
			Ok(memos) => self.inner.presence.load_memos(memos),
			Err(e) => warn!(error = %format!("{e:#}"), "app: could not reload memos"),
		}
		self.inner.caches.clear();
		self.inner.favorites.reset();
		self.inner.feed.clear();
		self.inner.api.gateway().reset_session();
		self.inner.auto_login_used.store(false, Ordering::SeqCst);

		self.inner.bus.publish(Event::Session(SessionEvent::LoggedOut));
		info!("app: logged out");
	}

	/// Stop timers and background tasks, then log out.
	pub async fn shutdown(&self) {
		self.inner.shutdown.send_replace(true);
		let tasks = std::mem::take(&mut *self.inner.tasks.lock());
		for task in tasks {
			task.abort();
		}
		self.logout().await;
		info!("app: shut down");
	}
}

fn upgrade(weak: &Weak<Inner>) -> Option<App> {
	weak.upgrade().map(|inner| App { inner })
}
