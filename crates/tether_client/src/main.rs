#![forbid(unsafe_code)]

use tether_client::{App, AppDeps, default_config_path, load_client_config_from_path};
use tether_core::{Event, EventKind, PresenceEvent, ToastLevel};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tether_client=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Without a renderer attached, toasts and notification decisions go to the log.
fn log_surfaces(app: &App) {
	app.bus().subscribe(EventKind::Toast, |ev| {
		if let Event::Toast(toast) = ev {
			match toast.level {
				ToastLevel::Error => warn!(message = %toast.message, "toast"),
				_ => info!(message = %toast.message, "toast"),
			}
		}
		Ok(())
	});

	let feed = app.feed().clone();
	app.bus().subscribe(EventKind::Presence, move |ev| {
		if let Event::Presence(PresenceEvent::Feed(entry)) = ev {
			let decision = feed.dispatch_decision(entry);
			if !decision.is_silent() {
				info!(
					user = %entry.display_name,
					kind = ?entry.kind(),
					overlay = decision.overlay,
					tts = decision.tts,
					desktop = decision.desktop,
					"notify"
				);
			}
		}
		Ok(())
	});
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = default_config_path()?;
	let config = load_client_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded client config (toml + env overrides)");

	init_metrics(config.metrics_bind.as_deref());

	let deps = AppDeps::production(&config)?;
	let app = App::init(config, deps)?;
	log_surfaces(&app);
	app.start();

	tokio::signal::ctrl_c().await?;
	info!("ctrl-c received; shutting down");
	app.shutdown().await;
	Ok(())
}
