use std::time::Duration;

use futures::{SinkExt, StreamExt};
use kerbside_session::events::OutboundEvent;
use kerbside_session::transport::make_transport_channels;
use kerbside_session::{
    ChannelLease, InboundEvent, Transport, TransportCommand, TransportEvent, TransportHandle,
    TransportResult,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::codec::{self, EnginePacket, Handshake, SocketPacket};
use super::config::TransportConfig;
use super::error::{
    ClosedSnafu, CodecSnafu, ConnectSnafu, ConnectTimeoutSnafu, HandshakeSnafu, JsonSnafu,
    SocketError, SocketResult,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reason string used when the server ends the session itself; no reconnect follows.
const SERVER_DISCONNECT: &str = "io server disconnect";

/// Socket.IO v4 client over the WebSocket transport.
#[derive(Debug, Clone)]
pub struct SocketIoTransport {
    config: TransportConfig,
}

impl SocketIoTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl Transport for SocketIoTransport {
    fn open(&self) -> TransportResult<TransportHandle> {
        let (commands, command_rx, event_tx, events) = make_transport_channels();
        let worker = SocketWorker {
            config: self.config.clone(),
            commands: command_rx,
            events: event_tx,
        };

        Ok(TransportHandle {
            commands,
            events,
            lease: ChannelLease::new(),
            worker: Box::pin(worker.run()),
        })
    }
}

/// What the worker does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// `attempt == 0` is a fresh connect; higher values are reconnects after a drop.
    Connect { attempt: u32 },
    /// Gave up or was told to go away by the server; waits for an explicit connect.
    Idle,
    Stop,
}

/// Result of racing some connection work against the command channel.
enum Raced<T> {
    Done(T),
    Stop,
}

struct Connection {
    ws: WsStream,
    handshake: Handshake,
}

struct SocketWorker {
    config: TransportConfig,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl SocketWorker {
    async fn run(mut self) {
        let mut phase = Phase::Connect { attempt: 0 };
        loop {
            phase = match phase {
                Phase::Connect { attempt } => self.connect_phase(attempt).await,
                Phase::Idle => self.idle_phase().await,
                Phase::Stop => break,
            };
        }
        tracing::debug!(endpoint = %self.config.endpoint(), "chat transport worker stopped");
    }

    async fn connect_phase(&mut self, attempt: u32) -> Phase {
        if attempt > 0 {
            self.notify(TransportEvent::ReconnectAttempt { attempt });
            let delay = self.config.reconnect.delay_for(attempt);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling chat channel reconnect"
            );
            if let Raced::Stop = self.race_commands(tokio::time::sleep(delay)).await {
                return Phase::Stop;
            }
        }

        let config = self.config.clone();
        let connection = match self.race_commands(establish(&config)).await {
            Raced::Done(connection) => connection,
            Raced::Stop => return Phase::Stop,
        };

        match connection {
            Ok(connection) => {
                if attempt == 0 {
                    self.notify(TransportEvent::Connected);
                } else {
                    self.notify(TransportEvent::Reconnected { attempts: attempt });
                }
                self.connected_phase(connection).await
            }
            Err(error) => {
                tracing::warn!(attempt, error = %error, "chat channel connect failed");
                self.notify(TransportEvent::ConnectError {
                    message: error.to_string(),
                });
                let next = attempt + 1;
                if self.config.reconnect.allows(next) {
                    Phase::Connect { attempt: next }
                } else {
                    self.notify(TransportEvent::ReconnectFailed);
                    Phase::Idle
                }
            }
        }
    }

    async fn idle_phase(&mut self) -> Phase {
        loop {
            match self.commands.recv().await {
                Some(TransportCommand::Connect) => return Phase::Connect { attempt: 0 },
                Some(TransportCommand::Emit(event)) => drop_emit(&event, "idle"),
                Some(TransportCommand::Close) | None => return Phase::Stop,
            }
        }
    }

    async fn connected_phase(&mut self, connection: Connection) -> Phase {
        let Connection { mut ws, handshake } = connection;
        // Servers ping every `pingInterval`; silence past interval + timeout means the link is dead.
        let liveness = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
        let mut deadline = Instant::now() + liveness;

        tracing::info!(
            sid = %handshake.sid,
            ping_interval_ms = handshake.ping_interval,
            "chat channel connected"
        );

        loop {
            let silence = tokio::time::sleep_until(deadline);
            tokio::pin!(silence);

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(TransportCommand::Emit(event)) => {
                        match send_event(&mut ws, &event).await {
                            Ok(()) => {}
                            Err(error @ SocketError::Connect { .. }) => {
                                tracing::warn!(event = event.name(), error = %error, "chat emit failed");
                                return self.dropped(error.to_string(), true);
                            }
                            Err(error) => {
                                tracing::warn!(event = event.name(), error = %error, "chat event could not be encoded");
                            }
                        }
                    }
                    Some(TransportCommand::Connect) => {}
                    Some(TransportCommand::Close) | None => {
                        close_gracefully(&mut ws).await;
                        self.notify(TransportEvent::Disconnected {
                            reason: "io client disconnect".to_string(),
                            will_reconnect: false,
                        });
                        return Phase::Stop;
                    }
                },

                frame = ws.next() => {
                    deadline = Instant::now() + liveness;
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(phase) = self.on_text(&mut ws, text.as_str()).await {
                                return phase;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|frame| frame.reason.to_string())
                                .filter(|reason| !reason.is_empty())
                                .unwrap_or_else(|| "transport close".to_string());
                            return self.dropped(reason, true);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            return self.dropped(format!("transport error: {error}"), true);
                        }
                        None => return self.dropped("transport close".to_string(), true),
                    }
                }

                () = &mut silence => {
                    tracing::warn!(liveness_ms = liveness.as_millis() as u64, "chat channel ping timeout");
                    return self.dropped("ping timeout".to_string(), true);
                }
            }
        }
    }

    /// Handles one text frame. Returns the next phase when the connection ended.
    async fn on_text(&mut self, ws: &mut WsStream, text: &str) -> Option<Phase> {
        let packet = match codec::decode(text) {
            Ok(packet) => packet,
            Err(error) => {
                tracing::warn!(error = %error, "ignoring malformed chat frame");
                return None;
            }
        };

        match packet {
            EnginePacket::Ping(data) => {
                tracing::trace!("chat channel ping");
                if let Err(error) = send_packet(ws, &EnginePacket::Pong(data)).await {
                    return Some(self.dropped(format!("pong failed: {error}"), true));
                }
            }
            EnginePacket::Close => {
                return Some(self.dropped("transport close".to_string(), true));
            }
            EnginePacket::Message(SocketPacket::Event { name, payload }) => {
                match InboundEvent::decode(&name, payload) {
                    Ok(Some(event)) => self.notify(TransportEvent::Inbound(event)),
                    Ok(None) => tracing::debug!(event = %name, "ignoring unhandled chat event"),
                    Err(error) => {
                        tracing::warn!(event = %name, error = %error, "ignoring undecodable chat event");
                    }
                }
            }
            EnginePacket::Message(SocketPacket::Disconnect) => {
                return Some(self.dropped(SERVER_DISCONNECT.to_string(), false));
            }
            EnginePacket::Message(SocketPacket::ConnectError(data)) => {
                self.notify(TransportEvent::ConnectError {
                    message: data.to_string(),
                });
            }
            EnginePacket::Message(SocketPacket::Unsupported { kind }) => {
                tracing::debug!(kind = %kind, "ignoring unsupported socket.io packet");
            }
            EnginePacket::Open(_)
            | EnginePacket::Pong(_)
            | EnginePacket::Upgrade
            | EnginePacket::Noop
            | EnginePacket::Message(SocketPacket::Connect(_)) => {}
        }
        None
    }

    fn dropped(&mut self, reason: String, will_reconnect: bool) -> Phase {
        let will_reconnect = will_reconnect && self.config.reconnect.allows(1);
        tracing::info!(reason = %reason, will_reconnect, "chat channel dropped");
        self.notify(TransportEvent::Disconnected {
            reason,
            will_reconnect,
        });
        if will_reconnect {
            Phase::Connect { attempt: 1 }
        } else {
            Phase::Idle
        }
    }

    fn notify(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("chat transport listener is gone");
        }
    }

    /// Drives `work` while still honouring `Close`. Emits issued meanwhile are dropped.
    async fn race_commands<F: Future>(&mut self, work: F) -> Raced<F::Output> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(TransportCommand::Close) | None => return Raced::Stop,
                    Some(TransportCommand::Connect) => {}
                    Some(TransportCommand::Emit(event)) => drop_emit(&event, "connecting"),
                },
                output = &mut work => return Raced::Done(output),
            }
        }
    }
}

fn drop_emit(event: &OutboundEvent, phase: &'static str) {
    tracing::warn!(event = event.name(), phase, "chat channel not connected; dropping emit");
}

/// Opens the WebSocket and completes the Engine.IO and Socket.IO handshakes.
async fn establish(config: &TransportConfig) -> SocketResult<Connection> {
    let url = config.socket_url();
    tracing::debug!(url = %url, "connecting chat channel");

    let timeout = config.connect_timeout;
    match tokio::time::timeout(timeout, handshake(url.as_str())).await {
        Ok(result) => result,
        Err(_) => ConnectTimeoutSnafu {
            stage: "socket-establish",
            timeout_ms: timeout.as_millis() as u64,
        }
        .fail(),
    }
}

async fn handshake(url: &str) -> SocketResult<Connection> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .context(ConnectSnafu {
            stage: "socket-connect",
        })?;

    let handshake = match next_packet(&mut ws, "socket-handshake-open").await? {
        EnginePacket::Open(handshake) => handshake,
        other => {
            return HandshakeSnafu {
                stage: "socket-handshake-open",
                details: format!("expected open packet, got {other:?}"),
            }
            .fail();
        }
    };

    send_packet(&mut ws, &EnginePacket::Message(SocketPacket::Connect(None))).await?;

    loop {
        match next_packet(&mut ws, "socket-handshake-connect").await? {
            EnginePacket::Message(SocketPacket::Connect(_)) => break,
            EnginePacket::Message(SocketPacket::ConnectError(data)) => {
                return HandshakeSnafu {
                    stage: "socket-handshake-connect",
                    details: format!("server refused connection: {data}"),
                }
                .fail();
            }
            EnginePacket::Ping(data) => send_packet(&mut ws, &EnginePacket::Pong(data)).await?,
            EnginePacket::Close => {
                return ClosedSnafu {
                    stage: "socket-handshake-connect",
                    reason: "server closed during handshake",
                }
                .fail();
            }
            _ => {}
        }
    }

    Ok(Connection { ws, handshake })
}

async fn next_packet(ws: &mut WsStream, stage: &'static str) -> SocketResult<EnginePacket> {
    loop {
        let frame = ws.next().await.context(ClosedSnafu {
            stage,
            reason: "stream ended",
        })?;
        match frame.context(ConnectSnafu { stage })? {
            Message::Text(text) => return codec::decode(text.as_str()),
            Message::Close(_) => {
                return ClosedSnafu {
                    stage,
                    reason: "close frame",
                }
                .fail();
            }
            Message::Ping(payload) => {
                ws.send(Message::Pong(payload))
                    .await
                    .context(ConnectSnafu { stage })?;
            }
            _ => {}
        }
    }
}

async fn send_packet(ws: &mut WsStream, packet: &EnginePacket) -> SocketResult<()> {
    let frame = codec::encode(packet)?;
    ws.send(Message::Text(frame.into()))
        .await
        .context(ConnectSnafu {
            stage: "socket-send",
        })
}

async fn send_event(ws: &mut WsStream, event: &OutboundEvent) -> SocketResult<()> {
    let payload = event.payload().context(JsonSnafu {
        stage: "socket-send-event",
    })?;
    ensure!(
        payload.is_object(),
        CodecSnafu {
            stage: "socket-send-event",
            details: format!("{} payload is not an object", event.name()),
        }
    );
    send_packet(ws, &EnginePacket::Message(SocketPacket::event(event.name(), payload))).await
}

async fn close_gracefully(ws: &mut WsStream) {
    let _ = send_packet(ws, &EnginePacket::Message(SocketPacket::Disconnect)).await;
    let _ = ws.close(None).await;
}
