#![forbid(unsafe_code)]

//! Push pipeline: one websocket, decoded into [`PipelineEvent`]s on the bus.
//!
//! There is no reconnect loop. The client calls [`Pipeline::connect`] again when a
//! current-user refresh succeeds while the pipeline is down.

use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context as _;
use futures::future::BoxFuture;
use futures::{Sink, SinkExt as _, Stream, StreamExt as _};
use parking_lot::Mutex;
use tether_core::{Event, EventBus, PipelineEvent};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tungstenite::Message;
use url::Url;

use crate::decode::decode_message;
use crate::secret::SecretString;

pub const DEFAULT_PIPELINE_URL: &str = "wss://pipeline.vrchat.cloud/";

pub type WsSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
pub type WsStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<(WsSink, WsStream)>> + Send + Sync>;

pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| {
		Box::pin(async move {
			let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
				.await
				.context("connect_async to pipeline ws")?;
			let (sink, stream) = ws.split();
			Ok::<_, anyhow::Error>((Box::pin(sink) as WsSink, Box::pin(stream) as WsStream))
		}) as BoxFuture<'static, anyhow::Result<(WsSink, WsStream)>>
	})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
	Disconnected,
	Connecting,
	Connected,
}

enum Conn {
	Disconnected,
	Connecting { id: u64 },
	Connected { id: u64, task: JoinHandle<()> },
}

#[derive(Clone)]
pub struct Pipeline {
	inner: Arc<Inner>,
}

struct Inner {
	url: Url,
	bus: EventBus,
	connector: WsConnector,
	conn: Mutex<Conn>,
	next_id: Mutex<u64>,
}

impl Pipeline {
	pub fn new(url: Url, bus: EventBus, connector: WsConnector) -> Self {
		Self {
			inner: Arc::new(Inner {
				url,
				bus,
				connector,
				conn: Mutex::new(Conn::Disconnected),
				next_id: Mutex::new(0),
			}),
		}
	}

	pub fn state(&self) -> PipelineState {
		match &*self.inner.conn.lock() {
			Conn::Disconnected => PipelineState::Disconnected,
			Conn::Connecting { .. } => PipelineState::Connecting,
			Conn::Connected { .. } => PipelineState::Connected,
		}
	}

	pub fn is_connected(&self) -> bool {
		self.state() == PipelineState::Connected
	}

	/// Open the socket. Returns `Ok(false)` without connecting when a socket is already
	/// open or being opened.
	pub async fn connect(&self, token: &SecretString) -> anyhow::Result<bool> {
		let id = {
			let mut conn = self.inner.conn.lock();
			if !matches!(*conn, Conn::Disconnected) {
				debug!("pipeline: connect ignored; already connected");
				return Ok(false);
			}
			let mut next = self.inner.next_id.lock();
			*next += 1;
			*conn = Conn::Connecting { id: *next };
			*next
		};

		let mut url = self.inner.url.clone();
		url.query_pairs_mut().append_pair("auth", token.expose());

		let (sink, stream) = match (self.inner.connector)(url).await {
			Ok(ws) => ws,
			Err(e) => {
				let mut conn = self.inner.conn.lock();
				if matches!(*conn, Conn::Connecting { id: current } if current == id) {
					*conn = Conn::Disconnected;
				}
				metrics::counter!("tether_pipeline_connect_failures_total").increment(1);
				return Err(e);
			}
		};

		let mut conn = self.inner.conn.lock();
		if !matches!(*conn, Conn::Connecting { id: current } if current == id) {
			debug!("pipeline: disconnected while connecting; dropping socket");
			return Ok(false);
		}
		let task = tokio::spawn(read_loop(self.inner.clone(), id, sink, stream));
		*conn = Conn::Connected { id, task };
		info!(url = %self.inner.url, "pipeline: connected");
		Ok(true)
	}

	/// Close the socket (logout). Publishes `Disconnected` if a socket was open.
	pub fn disconnect(&self) {
		let prev = std::mem::replace(&mut *self.inner.conn.lock(), Conn::Disconnected);
		if let Conn::Connected { task, .. } = prev {
			task.abort();
			self.inner.bus.publish(Event::Pipeline(PipelineEvent::Disconnected {
				reason: "closed by client".to_string(),
			}));
		}
	}
}

async fn read_loop(inner: Arc<Inner>, id: u64, mut sink: WsSink, mut stream: WsStream) {
	inner.bus.publish(Event::Pipeline(PipelineEvent::Connected));

	let reason = loop {
		let Some(msg) = stream.next().await else {
			break "stream ended".to_string();
		};

		match msg {
			Ok(Message::Text(t)) => {
				metrics::counter!("tether_pipeline_messages_total").increment(1);
				match decode_message(t.as_str()) {
					Ok(ev) => inner.bus.publish(Event::Pipeline(ev)),
					Err(e) => {
						metrics::counter!("tether_pipeline_decode_errors_total").increment(1);
						warn!(error = %e, "pipeline: dropping undecodable message");
					}
				}
			}
			Ok(Message::Ping(p)) => {
				if let Err(e) = sink.send(Message::Pong(p)).await {
					break format!("pong failed: {e}");
				}
			}
			Ok(Message::Close(frame)) => {
				break frame
					.map(|f| format!("closed by server: {}", f.reason.as_str()))
					.unwrap_or_else(|| "closed by server".to_string());
			}
			Ok(_) => {}
			Err(e) => break format!("read error: {e}"),
		}
	};

	let transitioned = {
		let mut conn = inner.conn.lock();
		if matches!(*conn, Conn::Connected { id: current, .. } if current == id) {
			*conn = Conn::Disconnected;
			true
		} else {
			false
		}
	};
	if transitioned {
		info!(%reason, "pipeline: disconnected");
		inner.bus.publish(Event::Pipeline(PipelineEvent::Disconnected { reason }));
	}
}
