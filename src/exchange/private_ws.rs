//! Private per-user WebSocket session
//!
//! Connect flow: fetch a short-lived token over REST, authenticate the
//! socket with it, subscribe to the per-user order-events channel, then
//! flip the subscribed flag once the exchange acknowledges. Live trading
//! gates on that flag.
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{error, info, warn};

use super::rest::{ApiCredentials, RestClient};
use super::wire::{orders_channel, ChannelFrame, OrderEvent, OrderEventFrame};
use crate::error::{EngineError, Result};

const RECONNECT_BACKOFF_SECS: [u64; 6] = [1, 2, 4, 8, 16, 30];

#[derive(Debug, Deserialize)]
struct PrivateFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

/// One authenticated session for one user.
pub struct PrivateSession {
    user_id: u64,
    subscribed_rx: watch::Receiver<bool>,
}

impl PrivateSession {
    /// Spawn the session task; order events arrive on the returned
    /// receiver for as long as the session lives.
    pub fn spawn(
        user_id: u64,
        creds: ApiCredentials,
        rest: Arc<RestClient>,
        url: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OrderEvent>) {
        let (subscribed_tx, subscribed_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let session = Arc::new(PrivateSession { user_id, subscribed_rx });

        tokio::spawn(async move {
            run_session(user_id, creds, rest, url, subscribed_tx, out_tx).await;
        });

        (session, out_rx)
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    /// True only after the authenticated subscription was confirmed.
    pub fn is_subscribed(&self) -> bool {
        *self.subscribed_rx.borrow()
    }

    /// Wait until the subscription is confirmed, bounded by `timeout`.
    pub async fn wait_subscribed(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribed_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|confirmed| *confirmed))
            .await
            .map_err(|_| {
                EngineError::NotSubscribed(format!(
                    "user {} subscription not confirmed within {:?}",
                    self.user_id, timeout
                ))
            })?
            .map_err(|_| EngineError::NotSubscribed(format!("user {} session ended", self.user_id)))?;
        Ok(())
    }
}

async fn run_session(
    user_id: u64,
    creds: ApiCredentials,
    rest: Arc<RestClient>,
    url: String,
    subscribed_tx: watch::Sender<bool>,
    out_tx: mpsc::UnboundedSender<OrderEvent>,
) {
    let mut backoff_idx = 0usize;

    loop {
        if out_tx.is_closed() {
            return;
        }

        match connect_and_stream(user_id, &creds, &rest, &url, &subscribed_tx, &out_tx).await {
            Ok(()) => {
                backoff_idx = 0;
            }
            Err(e) => {
                error!("Private session for user {} failed: {}", user_id, e);
            }
        }
        let _ = subscribed_tx.send(false);

        let backoff = RECONNECT_BACKOFF_SECS[backoff_idx.min(RECONNECT_BACKOFF_SECS.len() - 1)];
        backoff_idx += 1;
        warn!("Reconnecting private session for user {} in {}s", user_id, backoff);
        tokio::time::sleep(Duration::from_secs(backoff)).await;
    }
}

async fn connect_and_stream(
    user_id: u64,
    creds: &ApiCredentials,
    rest: &RestClient,
    url: &str,
    subscribed_tx: &watch::Sender<bool>,
    out_tx: &mpsc::UnboundedSender<OrderEvent>,
) -> Result<()> {
    let token = rest.ws_token(creds).await?;

    let (stream, _) = connect_async(url)
        .await
        .map_err(|e| EngineError::WebSocket(format!("connect failed: {}", e)))?;
    let (mut write, mut read) = stream.split();

    let auth = serde_json::to_string(&ChannelFrame::auth(token))?;
    write
        .send(Message::Text(auth.into()))
        .await
        .map_err(|e| EngineError::WebSocket(format!("auth send failed: {}", e)))?;

    let subscribe = serde_json::to_string(&ChannelFrame::subscribe(orders_channel(user_id)))?;
    write
        .send(Message::Text(subscribe.into()))
        .await
        .map_err(|e| EngineError::WebSocket(format!("subscribe send failed: {}", e)))?;

    info!("🔐 Private session for user {} connected, awaiting ack", user_id);

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_private_frame(user_id, &text, subscribed_tx, out_tx);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                warn!("Private session for user {} closed by server", user_id);
                return Ok(());
            }
            Err(e) => {
                return Err(EngineError::WebSocket(format!("read failed: {}", e)));
            }
            _ => {}
        }
    }

    Ok(())
}

fn handle_private_frame(
    user_id: u64,
    text: &str,
    subscribed_tx: &watch::Sender<bool>,
    out_tx: &mpsc::UnboundedSender<OrderEvent>,
) {
    let frame: PrivateFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            error!("Dropping unparseable private frame for user {}: {}", user_id, e);
            return;
        }
    };

    if frame.event.as_deref() == Some("subscribed") {
        info!("✅ Order-event subscription confirmed for user {}", user_id);
        let _ = subscribed_tx.send(true);
        return;
    }

    if frame.channel.as_deref() == Some(orders_channel(user_id).as_str()) {
        match serde_json::from_value::<OrderEventFrame>(frame.data) {
            Ok(raw) => {
                if let Some(event) = raw.normalize() {
                    let _ = out_tx.send(event);
                } else {
                    warn!("Dropping order event with unknown status/side for user {}", user_id);
                }
            }
            Err(e) => error!("Dropping unparseable order event for user {}: {}", user_id, e),
        }
    }
}
