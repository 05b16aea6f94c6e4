//! Public ticker WebSocket: one process-wide connection
use std::collections::HashSet;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{error, info, warn};

use super::wire::{book_channel, BookFrame, ChannelFrame, PublicMessage, SummaryTick, SUMMARY_CHANNEL};

const RECONNECT_BACKOFF_SECS: [u64; 6] = [1, 2, 4, 8, 16, 30];

#[derive(Debug)]
enum Command {
    SubscribeBook(String),
    UnsubscribeBook(String),
}

#[derive(Debug, Deserialize)]
struct IncomingFrame {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

/// Handle to the process-wide public market stream. The connection task
/// subscribes to the market summary on connect and keeps per-pair
/// order-book channels alive across reconnects.
pub struct PublicWs {
    cmd_tx: mpsc::UnboundedSender<Command>,
    subscribed_books: Arc<RwLock<HashSet<String>>>,
    connected: Arc<RwLock<bool>>,
}

impl PublicWs {
    /// Spawn the connection task. Normalized messages arrive on the
    /// returned receiver.
    pub fn spawn(url: String) -> (Arc<Self>, mpsc::UnboundedReceiver<PublicMessage>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let ws = Arc::new(PublicWs {
            cmd_tx,
            subscribed_books: Arc::new(RwLock::new(HashSet::new())),
            connected: Arc::new(RwLock::new(false)),
        });

        let task_ws = Arc::clone(&ws);
        tokio::spawn(async move {
            task_ws.run(url, cmd_rx, out_tx).await;
        });

        (ws, out_rx)
    }

    /// Ensure the order-book channel for `pair` is active.
    pub async fn subscribe_book(&self, pair: &str) {
        {
            let mut books = self.subscribed_books.write().await;
            if !books.insert(pair.to_string()) {
                return;
            }
        }
        let _ = self.cmd_tx.send(Command::SubscribeBook(pair.to_string()));
    }

    /// Tear the order-book channel for `pair` down.
    pub async fn unsubscribe_book(&self, pair: &str) {
        {
            let mut books = self.subscribed_books.write().await;
            if !books.remove(pair) {
                return;
            }
        }
        let _ = self.cmd_tx.send(Command::UnsubscribeBook(pair.to_string()));
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    async fn run(
        &self,
        url: String,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        out_tx: mpsc::UnboundedSender<PublicMessage>,
    ) {
        let mut backoff_idx = 0usize;

        loop {
            match connect_async(&url).await {
                Ok((stream, _)) => {
                    info!("🔌 Public stream connected");
                    backoff_idx = 0;
                    {
                        let mut connected = self.connected.write().await;
                        *connected = true;
                    }

                    let (mut write, mut read) = stream.split();

                    // Summary channel plus every book channel that was
                    // active before the reconnect.
                    let mut channels = vec![SUMMARY_CHANNEL.to_string()];
                    {
                        let books = self.subscribed_books.read().await;
                        channels.extend(books.iter().map(|p| book_channel(p)));
                    }
                    let mut send_failed = false;
                    for channel in channels {
                        let frame = ChannelFrame::subscribe(channel);
                        if let Ok(text) = serde_json::to_string(&frame) {
                            if write.send(Message::Text(text.into())).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                    }

                    while !send_failed {
                        tokio::select! {
                            cmd = cmd_rx.recv() => {
                                let Some(cmd) = cmd else { return };
                                let frame = match cmd {
                                    Command::SubscribeBook(pair) => {
                                        ChannelFrame::subscribe(book_channel(&pair))
                                    }
                                    Command::UnsubscribeBook(pair) => {
                                        ChannelFrame::unsubscribe(book_channel(&pair))
                                    }
                                };
                                if let Ok(text) = serde_json::to_string(&frame) {
                                    if write.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        Self::dispatch(&text, &out_tx);
                                    }
                                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                                    Some(Ok(Message::Close(_))) | None => {
                                        warn!("Public stream closed by server");
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        error!("Public stream error: {}", e);
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }

                    let mut connected = self.connected.write().await;
                    *connected = false;
                }
                Err(e) => {
                    error!("Public stream connect failed: {}", e);
                }
            }

            let backoff = RECONNECT_BACKOFF_SECS[backoff_idx.min(RECONNECT_BACKOFF_SECS.len() - 1)];
            backoff_idx += 1;
            warn!("Reconnecting public stream in {}s", backoff);
            tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
        }
    }

    /// Parse one frame; unparseable ticks are dropped with an error log.
    /// The stream is high-frequency, single-message loss is benign.
    fn dispatch(text: &str, out_tx: &mpsc::UnboundedSender<PublicMessage>) {
        let frame: IncomingFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                error!("Dropping unparseable public frame: {}", e);
                return;
            }
        };

        let Some(channel) = frame.channel else { return };

        if channel == SUMMARY_CHANNEL {
            match serde_json::from_value::<SummaryTick>(frame.data) {
                Ok(tick) => {
                    let _ = out_tx.send(PublicMessage::Summary(tick));
                }
                Err(e) => error!("Dropping unparseable summary tick: {}", e),
            }
        } else if channel.starts_with("market:order-book-") {
            match serde_json::from_value::<BookFrame>(frame.data) {
                Ok(book) => {
                    let _ = out_tx.send(PublicMessage::Book(book.into_ticker()));
                }
                Err(e) => error!("Dropping unparseable book frame: {}", e),
            }
        }
    }
}
