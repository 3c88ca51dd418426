//! Reconnecting websocket client

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::handler::{EventHandler, HandlerChannels};
use super::rpc::Request;
use super::{ClientCommand, MetadataUpdate};
use crate::config::MoonrakerConfig;
use crate::printer::MoonrakerClient;
use crate::scheduler::Tick;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// Receiving ends of [`HandlerChannels`]
#[derive(Debug)]
pub struct StreamReceivers {
    pub outbox: mpsc::UnboundedReceiver<Request>,
    pub ticks: mpsc::UnboundedReceiver<Tick>,
    pub metadata: mpsc::UnboundedReceiver<MetadataUpdate>,
}

pub fn create_stream_channels() -> (HandlerChannels, StreamReceivers) {
    let (outbox_tx, outbox) = mpsc::unbounded_channel();
    let (ticks_tx, ticks) = mpsc::unbounded_channel();
    let (metadata_tx, metadata) = mpsc::unbounded_channel();
    (
        HandlerChannels {
            outbox: outbox_tx,
            ticks: ticks_tx,
            metadata: metadata_tx,
        },
        StreamReceivers {
            outbox,
            ticks,
            metadata,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Closed,
    Shutdown,
}

fn jitter_multiplier(host: &str, attempt: u32) -> f64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    host.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let bucket = (hasher.finish() % 401) as f64;
    0.8 + (bucket / 1000.0)
}

fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    let exp = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.checked_mul(exp)
        .unwrap_or(MAX_RECONNECT_BACKOFF)
        .min(MAX_RECONNECT_BACKOFF)
}

/// Owns the websocket and feeds everything into the [`EventHandler`]
pub struct EventStreamClient {
    config: MoonrakerConfig,
    api: Arc<MoonrakerClient>,
    handler: EventHandler,
    receivers: StreamReceivers,
    commands: mpsc::Receiver<ClientCommand>,
    next_id: u64,
}

impl EventStreamClient {
    pub fn new(
        config: MoonrakerConfig,
        api: Arc<MoonrakerClient>,
        handler: EventHandler,
        receivers: StreamReceivers,
        commands: mpsc::Receiver<ClientCommand>,
    ) -> Self {
        if config.ssl && !config.ssl_verify {
            warn!("ssl_verify = false only applies to REST calls; the event stream still verifies certificates");
        }
        Self {
            config,
            api,
            handler,
            receivers,
            commands,
            next_id: 0,
        }
    }

    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }

    async fn url(&self) -> String {
        let token = match self.api.oneshot_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Failed to get one-shot token, connecting without: {}", e);
                None
            }
        };
        self.config.websocket_url(token.as_deref())
    }

    /// Connect and reconnect until shut down
    pub async fn run(mut self) -> Result<()> {
        let base = Duration::from_secs(self.config.reconnect_interval_secs.max(1));
        let mut attempt: u32 = 0;

        loop {
            let url = self.url().await;
            info!("Connecting to {}:{}", self.config.host, self.config.port);
            match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
                Ok(Ok((socket, _response))) => {
                    attempt = 0;
                    if self.serve(socket).await == Flow::Shutdown {
                        break;
                    }
                }
                Ok(Err(e)) => warn!("Event stream connection failed: {}", e),
                Err(_) => warn!("Event stream connection timed out"),
            }
            self.handler.on_closed();

            attempt = attempt.saturating_add(1);
            let delay = backoff_for_attempt(base, attempt)
                .mul_f64(jitter_multiplier(&self.config.host, attempt));
            debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
            if self.idle(delay).await == Flow::Shutdown {
                break;
            }
        }

        self.handler.on_closed();
        info!("Event stream client stopped");
        Ok(())
    }

    fn frame(&mut self, request: &Request) -> Message {
        self.next_id = self.next_id.wrapping_add(1);
        let frame = request.to_frame(self.next_id);
        debug!("-> {}", frame);
        Message::text(frame)
    }

    /// Process one connection until it closes
    async fn serve(&mut self, socket: Socket) -> Flow {
        let (mut sink, mut stream) = socket.split();

        // Requests queued while offline referred to the old session
        let mut stale = 0;
        while self.receivers.outbox.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Dropped {} stale requests", stale);
        }
        self.handler.on_open();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handler.handle_text(&text),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.handler.handle_text(text),
                        Err(e) => warn!("Dropping non-UTF-8 frame: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("Event stream closed by server: {:?}", frame);
                        return Flow::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Event stream error: {}", e);
                        return Flow::Closed;
                    }
                    None => return Flow::Closed,
                },

                Some(request) = self.receivers.outbox.recv() => {
                    let message = self.frame(&request);
                    if let Err(e) = sink.send(message).await {
                        warn!("Failed to send {}: {}", request.method(), e);
                        return Flow::Closed;
                    }
                }

                Some(tick) = self.receivers.ticks.recv() => self.handler.handle_tick(tick),

                Some(update) = self.receivers.metadata.recv() => self.handler.handle_metadata(update),

                Some(command) = self.commands.recv() => match command {
                    ClientCommand::Request(request) => {
                        let message = self.frame(&request);
                        if let Err(e) = sink.send(message).await {
                            warn!("Failed to send {}: {}", request.method(), e);
                            return Flow::Closed;
                        }
                    }
                    ClientCommand::Shutdown => {
                        info!("Shutdown command received");
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            debug!("Close frame not sent: {}", e);
                        }
                        return Flow::Shutdown;
                    }
                },
            }
        }
    }

    /// Keep ticks and metadata flowing while waiting to reconnect
    async fn idle(&mut self, delay: Duration) -> Flow {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Closed,
                Some(tick) = self.receivers.ticks.recv() => self.handler.handle_tick(tick),
                Some(update) = self.receivers.metadata.recv() => self.handler.handle_metadata(update),
                Some(command) = self.commands.recv() => match command {
                    ClientCommand::Request(request) => {
                        warn!("Not connected, dropping {}", request.method());
                    }
                    ClientCommand::Shutdown => return Flow::Shutdown,
                },
            }
        }
    }
}
