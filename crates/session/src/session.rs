use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use snafu::ResultExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::channel::{ChannelController, ChannelState, ControllerOutput};
use super::dispatch::{DEFAULT_SEND_RETRY_DELAY, OutboundDispatcher, Submission};
use super::error::{
    ChannelNotReadySnafu, NoActiveConversationSnafu, SessionClosedSnafu, SessionResult,
    TransportOpenSnafu, TransportResult,
};
use super::events::OutboundEvent;
use super::history::{HistoryDelivery, HistoryLoader, HistoryOutcome, HistorySource};
use super::ids::ConversationId;
use super::merge::{ConversationState, DEFAULT_DEDUP_WINDOW};
use super::message::{MessageRecord, ParticipantIdentity};
use super::teardown::{ChannelPort, TeardownCoordinator, TeardownReason};
use super::transport::{ChannelLease, Transport, TransportCommands, TransportEvent};

pub type SessionWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub dedup_window: Duration,
    pub send_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            send_retry_delay: DEFAULT_SEND_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HistoryStatus {
    #[default]
    Idle,
    Loading,
    Loaded {
        count: usize,
    },
    Unavailable {
        reason: String,
    },
}

/// Read-only view of the session published after every processed input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub conversation_id: Option<ConversationId>,
    pub participant: Option<ParticipantIdentity>,
    pub messages: Vec<MessageRecord>,
    pub channel: ChannelState,
    pub history: HistoryStatus,
    /// Non-fatal channel problem, cleared on the next successful connect.
    pub channel_unavailable: Option<String>,
    pub closed: bool,
}

type SendReply = oneshot::Sender<SessionResult<()>>;

enum SessionCommand {
    SetParticipant(Option<ParticipantIdentity>),
    OpenConversation(Option<ConversationId>),
    Send { text: String, reply: SendReply },
    Close { reason: TeardownReason, reply: oneshot::Sender<()> },
}

/// Cloneable front end of a running chat session.
#[derive(Clone)]
pub struct ChatSessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl ChatSessionHandle {
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn set_participant(&self, identity: Option<ParticipantIdentity>) -> SessionResult<()> {
        self.command(SessionCommand::SetParticipant(identity), "session-set-participant")
    }

    pub fn open_conversation(&self, conversation_id: Option<ConversationId>) -> SessionResult<()> {
        self.command(
            SessionCommand::OpenConversation(conversation_id),
            "session-open-conversation",
        )
    }

    /// Sends `text` to the current conversation. The message shows up in the snapshot only
    /// once the channel echoes it back.
    pub async fn send(&self, text: impl Into<String>) -> SessionResult<()> {
        let (reply, response) = oneshot::channel();
        self.command(
            SessionCommand::Send {
                text: text.into(),
                reply,
            },
            "session-send",
        )?;
        response.await.unwrap_or_else(|_| {
            SessionClosedSnafu {
                stage: "session-send-reply",
            }
            .fail()
        })
    }

    /// Tears the session down. Safe to call more than once.
    pub async fn close(&self) {
        self.close_for(TeardownReason::ViewClosed).await;
    }

    /// Best-effort teardown when the process is about to exit.
    pub async fn close_for_exit(&self) {
        self.close_for(TeardownReason::ProcessExit).await;
    }

    async fn close_for(&self, reason: TeardownReason) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Close { reason, reply })
            .is_err()
        {
            return;
        }
        let _ = done.await;
    }

    fn command(&self, command: SessionCommand, stage: &'static str) -> SessionResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionClosedSnafu { stage }.build())
    }
}

pub struct SessionParts {
    pub handle: ChatSessionHandle,
    /// Must be spawned by the caller; it is the only owner of session state.
    pub worker: SessionWorker,
}

pub struct ChatSession;

impl ChatSession {
    pub fn start(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistorySource>,
    ) -> SessionParts {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let driver = SessionDriver {
            config,
            transport,
            loader: HistoryLoader::new(history, delivery_tx),
            deliveries: delivery_rx,
            participant: None,
            conversation_id: None,
            conversation: ConversationState::new(config.dedup_window),
            active: None,
            dispatcher: OutboundDispatcher::new(config.send_retry_delay),
            history_status: HistoryStatus::Idle,
            channel_unavailable: None,
            snapshots: snapshot_tx,
            closed: false,
        };

        SessionParts {
            handle: ChatSessionHandle {
                commands: command_tx,
                snapshots: snapshot_rx,
            },
            worker: Box::pin(driver.run(command_rx)),
        }
    }
}

/// Transport side of one open channel.
struct ChannelLink {
    commands: TransportCommands,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    lease: ChannelLease,
    subscribed: bool,
    _worker: JoinHandle<()>,
}

impl ChannelLink {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        if !self.subscribed {
            return std::future::pending().await;
        }
        self.events.recv().await
    }
}

impl ChannelPort for ChannelLink {
    fn emit(&mut self, event: OutboundEvent) -> TransportResult<()> {
        self.commands.emit(event)
    }

    fn unsubscribe_all(&mut self) -> usize {
        if !self.subscribed {
            return 0;
        }
        self.subscribed = false;
        self.events.close();
        1
    }

    fn release(&mut self) -> TransportResult<bool> {
        if !self.lease.is_sole_holder() {
            return Ok(false);
        }
        self.commands.close()?;
        Ok(true)
    }
}

struct ActiveChannel {
    controller: ChannelController,
    link: ChannelLink,
    teardown: TeardownCoordinator,
}

struct SessionDriver {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    loader: HistoryLoader,
    deliveries: mpsc::UnboundedReceiver<HistoryDelivery>,
    participant: Option<ParticipantIdentity>,
    conversation_id: Option<ConversationId>,
    conversation: ConversationState,
    active: Option<ActiveChannel>,
    dispatcher: OutboundDispatcher<SendReply>,
    history_status: HistoryStatus,
    channel_unavailable: Option<String>,
    snapshots: watch::Sender<SessionSnapshot>,
    closed: bool,
}

impl SessionDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        while !self.closed {
            let retry_at = self.dispatcher.next_due();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.shutdown(TeardownReason::ViewClosed),
                },
                event = next_transport_event(&mut self.active) => self.handle_transport_event(event),
                Some(delivery) = self.deliveries.recv() => self.handle_history(delivery),
                () = sleep_until_due(retry_at) => self.handle_due_retries(),
            }
            self.publish();
        }

        tracing::debug!("chat session worker stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetParticipant(identity) => {
                if self.participant == identity {
                    return;
                }
                let same_participant = matches!(
                    (&self.participant, &identity),
                    (Some(current), Some(next)) if current.id == next.id
                );
                if same_participant {
                    // Only the display name changed: rejoin under the new name, keep the
                    // conversation and the history already requested for this pair.
                    self.teardown_active(TeardownReason::IdentityChanged);
                    self.participant = identity;
                    self.reopen_channel();
                    return;
                }
                self.teardown_active(TeardownReason::ConversationChanged);
                self.participant = identity;
                self.reopen();
            }
            SessionCommand::OpenConversation(conversation_id) => {
                if self.conversation_id == conversation_id {
                    return;
                }
                self.teardown_active(TeardownReason::ConversationChanged);
                self.conversation_id = conversation_id;
                self.reopen();
            }
            SessionCommand::Send { text, reply } => self.handle_send(&text, reply),
            SessionCommand::Close { reason, reply } => {
                self.shutdown(reason);
                let _ = reply.send(());
            }
        }
    }

    /// Starts over for the current `(participant, conversation)` pair with empty state.
    fn reopen(&mut self) {
        self.loader.reset();
        self.conversation = ConversationState::new(self.config.dedup_window);
        self.history_status = HistoryStatus::Idle;
        self.channel_unavailable = None;

        let (Some(identity), Some(conversation_id)) =
            (self.participant.clone(), self.conversation_id.clone())
        else {
            return;
        };

        if self
            .loader
            .load(Some(&conversation_id), Some(&identity.id))
            .is_some()
        {
            self.history_status = HistoryStatus::Loading;
        }

        self.reopen_channel();
    }

    /// Opens a fresh channel for the current pair, leaving history and messages alone.
    fn reopen_channel(&mut self) {
        self.channel_unavailable = None;

        let (Some(identity), Some(conversation_id)) =
            (self.participant.clone(), self.conversation_id.clone())
        else {
            return;
        };

        if !identity.can_join() {
            tracing::warn!(
                conversation_id = %conversation_id,
                participant_id = %identity.id,
                "participant has no display name; not joining the chat channel"
            );
            self.channel_unavailable = Some("participant has no display name".to_string());
            return;
        }

        match self.open_channel(identity, conversation_id) {
            Ok(active) => self.active = Some(active),
            Err(error) => {
                tracing::warn!(error = %error, "chat channel could not be opened");
                self.channel_unavailable = Some(error.to_string());
            }
        }
    }

    fn open_channel(
        &self,
        identity: ParticipantIdentity,
        conversation_id: ConversationId,
    ) -> SessionResult<ActiveChannel> {
        let handle = self.transport.open().context(TransportOpenSnafu {
            stage: "session-open-channel",
        })?;

        let mut controller = ChannelController::new(identity, conversation_id);
        // The transport connects as soon as its worker runs.
        controller.request_connect();

        Ok(ActiveChannel {
            controller,
            link: ChannelLink {
                commands: handle.commands,
                events: handle.events,
                lease: handle.lease,
                subscribed: true,
                _worker: tokio::spawn(handle.worker),
            },
            teardown: TeardownCoordinator::new(),
        })
    }

    fn handle_send(&mut self, text: &str, reply: SendReply) {
        if self.participant.is_none() || self.conversation_id.is_none() {
            let _ = reply.send(
                NoActiveConversationSnafu {
                    stage: "session-send",
                }
                .fail(),
            );
            return;
        }

        let Some(active) = self.active.as_mut() else {
            let _ = reply.send(
                ChannelNotReadySnafu {
                    stage: "session-send",
                    conversation_id: self
                        .conversation_id
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                }
                .fail(),
            );
            return;
        };

        match self
            .dispatcher
            .submit(text, &mut active.controller, Instant::now(), reply)
        {
            Err((error, reply)) => {
                let _ = reply.send(Err(error));
            }
            Ok(Submission::SendNow { event, reply }) => {
                let _ = reply.send(emit_send(active, event));
            }
            Ok(Submission::Deferred { request_connect }) => {
                if !request_connect {
                    return;
                }
                if let Err(error) = active.link.commands.connect() {
                    tracing::warn!(error = %error, "failed to request chat channel connect");
                }
            }
        }
    }

    fn handle_due_retries(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        for retry in self
            .dispatcher
            .take_due(Instant::now(), &active.controller)
        {
            let result = match retry.result {
                Ok(event) => emit_send(active, event),
                Err(error) => Err(error),
            };
            let _ = retry.reply.send(result);
        }
    }

    fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let outputs = match event {
            Some(event) => {
                if matches!(
                    event,
                    TransportEvent::Connected | TransportEvent::Reconnected { .. }
                ) {
                    self.channel_unavailable = None;
                }
                active.controller.on_transport_event(event, Utc::now())
            }
            None => {
                active.link.subscribed = false;
                active.controller.on_transport_closed()
            }
        };

        for output in outputs {
            match output {
                ControllerOutput::Emit(event) => {
                    if let Err(error) = active.link.commands.emit(event) {
                        tracing::warn!(error = %error, "failed to emit chat membership signal");
                    }
                }
                ControllerOutput::Candidate(record) => {
                    self.conversation.merge(record);
                }
                ControllerOutput::Unavailable { reason } => {
                    self.channel_unavailable = Some(reason);
                }
            }
        }
    }

    fn handle_history(&mut self, delivery: HistoryDelivery) {
        if !self.loader.accept(&delivery) {
            return;
        }

        match delivery.outcome {
            HistoryOutcome::Loaded(records) => {
                let count = records.len();
                let accepted = self.conversation.merge_all(records);
                tracing::info!(
                    conversation_id = %delivery.ticket.conversation_id,
                    count,
                    accepted,
                    "conversation history loaded"
                );
                self.history_status = HistoryStatus::Loaded { count };
            }
            HistoryOutcome::Unavailable { reason } => {
                self.history_status = HistoryStatus::Unavailable { reason };
            }
        }
    }

    fn teardown_active(&mut self, reason: TeardownReason) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        let conversation_id = active.controller.conversation_id().to_string();
        for retry in self.dispatcher.fail_all(&conversation_id) {
            let _ = retry.reply.send(retry.result.map(|_| ()));
        }

        active
            .teardown
            .run(reason, &mut active.controller, &mut active.link);
    }

    fn shutdown(&mut self, reason: TeardownReason) {
        if self.closed {
            return;
        }
        self.teardown_active(reason);
        self.loader.reset();
        self.closed = true;
    }

    fn publish(&self) {
        self.snapshots.send_replace(SessionSnapshot {
            conversation_id: self.conversation_id.clone(),
            participant: self.participant.clone(),
            messages: self.conversation.records().to_vec(),
            channel: self
                .active
                .as_ref()
                .map(|active| active.controller.state())
                .unwrap_or_default(),
            history: self.history_status.clone(),
            channel_unavailable: self.channel_unavailable.clone(),
            closed: self.closed,
        });
    }
}

fn emit_send(active: &ActiveChannel, event: OutboundEvent) -> SessionResult<()> {
    active.link.commands.emit(event).map_err(|error| {
        tracing::warn!(error = %error, "chat transport rejected message");
        ChannelNotReadySnafu {
            stage: "session-emit",
            conversation_id: active.controller.conversation_id().to_string(),
        }
        .build()
    })
}

async fn next_transport_event(active: &mut Option<ActiveChannel>) -> Option<TransportEvent> {
    match active {
        Some(active) => active.link.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
