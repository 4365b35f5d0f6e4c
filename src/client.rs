//! HostLink Client (spec §4.5): the top-level state machine. Runs as a single
//! actor task that exclusively owns the transport, decode buffer, tracker,
//! reassembler and team-chat negotiator (spec §5's "single-writer,
//! multi-reader" model); callers interact through a cloneable [`HostLinkHandle`]
//! that sends commands in and receives [`FrameEvent`]s out.

use crate::codec::{self, Decoder, Frame};
use crate::config::ConnectOptions;
use crate::error::{Error, Result};
use crate::events::{ClientState, FrameEvent};
use crate::ports;
use crate::reassembler::Reassembler;
use crate::teamchat::{TeamChatContext, TeamChatSender};
use crate::tracker::{RequestTracker, Terminal, TxOutcome};
use crate::transport::{Transport, TransportErrorKind, TransportEvent};
use crate::types::{
    Capabilities, Direction, DeviceInfo, MessageEntry, MessageStatus, RadioMetadata, TeamState,
};
use crate::wire::{self, ack_code, frame_type};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

const CLIENT_NAME: &str = "hostlink-core";
const CLIENT_PROTOCOL_VERSION: u16 = 1;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 64;
const TIMEOUT_TICK: Duration = Duration::from_millis(50);
/// Outbound node id used when no application-level identity is configured.
/// The core has no notion of "this device's node id" of its own (spec §3
/// tracks only the remote `DeviceInfo`); higher layers that need a real
/// sender id stamp it by constructing `MessageEntry`/`AppDataPacket` values
/// themselves from the events this client emits.
const LOCAL_NODE_ID: u32 = 0;
const BROADCAST_NODE_ID: u32 = 0xFFFF_FFFF;

enum Command {
    SendMessage {
        to: u32,
        channel: u8,
        text: String,
        respond: oneshot::Sender<Result<()>>,
    },
    SendTeamText {
        text: String,
        channel: u8,
        conversation_key: Option<String>,
        respond: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        respond: oneshot::Sender<ClientSnapshot>,
    },
    Disconnect,
}

/// Point-in-time view of the client's cached state, for callers that want
/// to poll rather than (or in addition to) subscribing to events.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
    pub state: ClientState,
    pub last_error: Option<String>,
    pub device_info: Option<DeviceInfo>,
    pub team_state: Option<TeamState>,
}

/// Cheap, cloneable handle to a running [`HostLinkClient`] actor.
#[derive(Clone)]
pub struct HostLinkHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<FrameEvent>,
}

impl HostLinkHandle {
    /// Subscribes to the event stream. Each subscriber gets its own queue;
    /// slow subscribers lag rather than stall the client (spec §5: the client
    /// task must never block on a subscriber).
    pub fn subscribe(&self) -> broadcast::Receiver<FrameEvent> {
        self.events.subscribe()
    }

    /// Sends a team message and waits for the device to acknowledge it.
    /// Resolves once `Ack` arrives (or a terminal failure); the later
    /// tx-result is reported separately as [`FrameEvent::TxResult`].
    pub async fn send_message(&self, to: u32, channel: u8, text: impl Into<String>) -> Result<()> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::SendMessage {
                to,
                channel,
                text: text.into(),
                respond,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Sends team-chat text, negotiating wire format as needed (spec §4.6).
    pub async fn send_team_text(
        &self,
        text: impl Into<String>,
        channel: u8,
        conversation_key: Option<String>,
    ) -> Result<()> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::SendTeamText {
                text: text.into(),
                channel,
                conversation_key,
                respond,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Reads the client's current state, device info, and team-state cache.
    /// Returns the disconnected-default snapshot if the actor has already
    /// stopped (same as it would report a moment before stopping).
    pub async fn snapshot(&self) -> ClientSnapshot {
        let (respond, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot { respond }).await.is_err() {
            return ClientSnapshot {
                state: ClientState::Disconnected,
                last_error: None,
                device_info: None,
                team_state: None,
            };
        }
        rx.await.unwrap_or(ClientSnapshot {
            state: ClientState::Disconnected,
            last_error: None,
            device_info: None,
            team_state: None,
        })
    }

    /// Cancels all pending requests, closes the transport, and stops the
    /// client's run loop for good (spec §5 `disconnect()` contract).
    pub async fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect).await;
    }
}

/// Spawns the client actor for transport kind `T` and returns a handle to it.
/// The actor begins in `Connecting` immediately and reconnects on its own
/// per `options.auto_reconnect` until `disconnect()` is called.
pub fn spawn<T>(options: ConnectOptions) -> HostLinkHandle
where
    T: Transport + Send + Sync + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let handle = HostLinkHandle {
        commands: command_tx,
        events: events_tx.clone(),
    };

    let actor = ClientActor::<T> {
        options,
        state: ClientState::Disconnected,
        last_error: None,
        transport: None,
        transport_events: None,
        decoder: Decoder::new(codec::DEFAULT_MAX_PAYLOAD_LEN),
        tracker: RequestTracker::new(),
        reassembler: Reassembler::default(),
        team_chat: TeamChatSender::new(),
        device_info: None,
        team_state: None,
        messages: HashMap::new(),
        pending_results: VecDeque::new(),
        next_msg_id: 1,
        events: events_tx,
        commands: command_rx,
        shutting_down: false,
    };
    tokio::spawn(actor.run());
    handle
}

struct ClientActor<T: Transport> {
    options: ConnectOptions,
    state: ClientState,
    last_error: Option<String>,
    transport: Option<T>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    decoder: Decoder,
    tracker: RequestTracker,
    reassembler: Reassembler,
    team_chat: TeamChatSender,
    device_info: Option<DeviceInfo>,
    team_state: Option<TeamState>,
    messages: HashMap<u16, MessageEntry>,
    /// FIFO of seqs awaiting a tx-result, mirroring the tracker's own
    /// "oldest pending" rule so an uncorrelated `EvTxResult` still updates
    /// the right `MessageEntry` (spec §4.5 dispatch table).
    pending_results: VecDeque<u16>,
    next_msg_id: u32,
    events: broadcast::Sender<FrameEvent>,
    commands: mpsc::Receiver<Command>,
    shutting_down: bool,
}

impl<T: Transport> ClientActor<T> {
    async fn run(mut self) {
        loop {
            match self.connect_once().await {
                Ok(()) => self.serve().await,
                Err(e) => debug!("connect attempt failed: {e}"),
            }
            if self.shutting_down || !self.options.auto_reconnect {
                break;
            }
            self.transition(ClientState::Reconnecting);
            tokio::time::sleep(self.reconnect_delay()).await;
        }
    }

    /// Reconnect delay plus up to 10% jitter, so a fleet of clients that all
    /// lost the same transport don't all redial in lockstep.
    fn reconnect_delay(&self) -> Duration {
        let base = self.options.reconnect_delay_ms;
        let jitter = fastrand::u64(0..=base / 10 + 1);
        Duration::from_millis(base + jitter)
    }

    fn transition(&mut self, state: ClientState) {
        self.state = state.clone();
        let _ = self.events.send(FrameEvent::StateChanged {
            state,
            last_error: self.last_error.clone(),
        });
    }

    fn max_frame_len(&self) -> usize {
        self.device_info
            .as_ref()
            .map(|d| d.max_frame_len as usize)
            .unwrap_or(self.options.max_frame_len)
    }

    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.options.ack_timeout_ms)
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        match self.transport.as_ref() {
            Some(t) => t.write(bytes).await.map_err(Error::Io),
            None => Err(Error::Disconnected),
        }
    }

    async fn connect_once(&mut self) -> Result<()> {
        self.transition(ClientState::Connecting);
        let (transport, rx) = T::open(&self.options.endpoint).await.map_err(|e| {
            self.last_error = Some(e.to_string());
            self.transition(ClientState::Error);
            Error::Io(e)
        })?;
        self.transport = Some(transport);
        self.transport_events = Some(rx);
        self.decoder = Decoder::new(self.options.max_frame_len);
        self.transition(ClientState::Handshaking);
        self.handshake().await
    }

    async fn handshake(&mut self) -> Result<()> {
        let seq = self.tracker.next_seq();
        let payload = wire::encode_hello(CLIENT_PROTOCOL_VERSION, 0, CLIENT_NAME);
        let frame = Frame::new(frame_type::HELLO, seq, payload);
        let encoded = codec::encode(&frame, self.options.max_frame_len).map_err(Error::Decode)?;
        self.write(&encoded).await?;

        let deadline = Instant::now() + Duration::from_millis(self.options.handshake_timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.fail_handshake("handshake timed out");
            }
            let events = self
                .transport_events
                .as_mut()
                .expect("transport open during handshake");
            let event = match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return self.fail_handshake("transport closed during handshake"),
                Err(_) => return self.fail_handshake("handshake timed out"),
            };
            match event {
                TransportEvent::Error(kind, message) => {
                    self.last_error = Some(message.clone());
                    let _ = self.events.send(FrameEvent::TransportError(kind, message));
                    self.transition(ClientState::Error);
                    return Err(Error::Disconnected);
                }
                TransportEvent::Data(bytes) => {
                    self.decoder.append(&bytes);
                    for result in self.decoder.drain_frames() {
                        match result {
                            Ok(frame) if frame.frame_type == frame_type::HELLO_ACK && frame.seq == seq => {
                                self.tracker.complete(seq);
                                return self.complete_handshake(frame).await;
                            }
                            Ok(_) => debug!("ignoring non-HelloAck frame during handshake"),
                            Err(e) => {
                                let _ = self.events.send(FrameEvent::DecodeError(e));
                            }
                        }
                    }
                }
            }
        }
    }

    fn fail_handshake(&mut self, reason: &str) -> Result<()> {
        self.last_error = Some(reason.to_string());
        self.transition(ClientState::Error);
        Err(Error::Timeout)
    }

    async fn complete_handshake(&mut self, frame: Frame) -> Result<()> {
        let Some(ack) = wire::parse_hello_ack(&frame.payload) else {
            return self.fail_handshake("malformed HelloAck payload");
        };
        let device_info = DeviceInfo {
            protocol_version: ack.protocol_version,
            max_frame_len: ack.max_frame_len,
            capabilities: Capabilities { mask: ack.capabilities_mask },
            model: ack.model,
            firmware: ack.firmware,
        };
        self.decoder.set_max_payload_len(device_info.max_frame_len as usize);
        self.device_info = Some(device_info.clone());
        self.transition(ClientState::Ready);
        let _ = self.events.send(FrameEvent::Ready { device_info: device_info.clone() });

        if device_info.capabilities.has(Capabilities::CAP_SET_TIME) {
            self.send_set_time().await;
        }
        Ok(())
    }

    async fn send_set_time(&mut self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let seq = self.tracker.next_seq();
        let frame = Frame::new(frame_type::CMD_SET_TIME, seq, wire::encode_set_time(now_ms));
        match codec::encode(&frame, self.max_frame_len()) {
            Ok(encoded) => {
                self.tracker
                    .register_at(seq, self.ack_timeout(), self.options.max_retries, encoded.clone(), Instant::now());
                if let Err(e) = self.write(&encoded).await {
                    warn!("failed to send SetTime: {e}");
                }
            }
            Err(e) => warn!("failed to encode SetTime: {e}"),
        }
    }

    async fn serve(&mut self) {
        let mut ticker = tokio::time::interval(TIMEOUT_TICK);
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::SendMessage { to, channel, text, respond }) => {
                            self.handle_send_message(to, channel, text, respond).await;
                        }
                        Some(Command::SendTeamText { text, channel, conversation_key, respond }) => {
                            self.handle_send_team_text(text, channel, conversation_key, respond).await;
                        }
                        Some(Command::Snapshot { respond }) => {
                            let _ = respond.send(ClientSnapshot {
                                state: self.state.clone(),
                                last_error: self.last_error.clone(),
                                device_info: self.device_info.clone(),
                                team_state: self.team_state.clone(),
                            });
                        }
                        Some(Command::Disconnect) | None => {
                            self.do_disconnect().await;
                            return;
                        }
                    }
                }
                event = recv_transport_event(&mut self.transport_events) => {
                    match event {
                        Some(TransportEvent::Data(bytes)) => self.on_data(bytes).await,
                        Some(TransportEvent::Error(kind, message)) => {
                            self.on_transport_error(kind, message);
                            return;
                        }
                        None => {
                            self.on_transport_error(
                                TransportErrorKind::Disconnected,
                                "transport channel closed".into(),
                            );
                            return;
                        }
                    }
                }
                _ = ticker.tick() => self.check_timeouts().await,
            }
        }
    }

    async fn on_data(&mut self, bytes: Vec<u8>) {
        self.decoder.append(&bytes);
        let results = self.decoder.drain_frames();
        for result in results {
            match result {
                Ok(frame) => self.dispatch_frame(frame).await,
                Err(e) => {
                    warn!("frame decode error: {e}");
                    let _ = self.events.send(FrameEvent::DecodeError(e));
                }
            }
        }
    }

    async fn dispatch_frame(&mut self, frame: Frame) {
        match frame.frame_type {
            frame_type::ACK => self.on_ack(frame),
            frame_type::EV_TX_RESULT => self.on_tx_result(frame),
            frame_type::EV_STATUS => {
                let _ = self.events.send(FrameEvent::Status(frame.payload));
            }
            frame_type::EV_DEVICE => {
                let _ = self.events.send(FrameEvent::Device(frame.payload));
            }
            frame_type::EV_GPS => {
                let _ = self.events.send(FrameEvent::Gps(frame.payload));
            }
            frame_type::EV_POSITION => {
                let _ = self.events.send(FrameEvent::Position(frame.payload));
            }
            frame_type::EV_NODE_INFO => {
                let _ = self.events.send(FrameEvent::NodeInfo(frame.payload));
            }
            frame_type::EV_TEAM_STATE => self.on_team_state(frame),
            frame_type::EV_TACTICAL => self.on_tactical(frame),
            frame_type::EV_RX_MSG => self.on_rx_msg(frame),
            frame_type::EV_APP_DATA => self.on_app_data(frame),
            other => {
                debug!("unknown frame type {other}, ignoring");
                let _ = self.events.send(FrameEvent::Unknown { frame_type: other });
            }
        }
    }

    fn on_ack(&mut self, frame: Frame) {
        let code = *frame.payload.first().unwrap_or(&ack_code::INTERNAL);
        self.tracker.handle_ack(frame.seq, code);
        match self.messages.get_mut(&frame.seq) {
            Some(entry) => {
                if entry.status == MessageStatus::Pending {
                    entry.status = if code == ack_code::OK {
                        MessageStatus::Acked
                    } else {
                        MessageStatus::Failed
                    };
                }
            }
            None => {
                // No MessageEntry means this ack belongs to a request that
                // never expects a correlated tx-result (e.g. CmdSetTime);
                // its ack is the only completion it will ever get, so retire
                // the tracker bookkeeping now instead of leaking it forever.
                self.tracker.complete(frame.seq);
            }
        }
    }

    fn on_tx_result(&mut self, frame: Frame) {
        let Some((_msg_id, success)) = wire::parse_tx_result(&frame.payload) else {
            warn!("malformed EvTxResult frame, ignoring");
            return;
        };
        let outcome = TxOutcome { success };
        self.tracker.handle_result(outcome);
        while let Some(seq) = self.pending_results.pop_front() {
            if let Some(entry) = self.messages.get_mut(&seq) {
                entry.status = if success { MessageStatus::Succeeded } else { MessageStatus::Failed };
                self.tracker.complete(seq);
                break;
            }
        }
        let _ = self.events.send(FrameEvent::TxResult { outcome });
    }

    fn on_team_state(&mut self, frame: Frame) {
        match wire::parse_team_state(&frame.payload) {
            Some(state) => {
                self.team_state = Some(state.clone());
                let _ = self.events.send(FrameEvent::TeamState(state));
            }
            None => warn!("malformed EvTeamState frame, ignoring"),
        }
    }

    fn on_tactical(&mut self, frame: Frame) {
        let parsed = ports::decode_tactical(&frame.payload);
        let _ = self.events.send(FrameEvent::Tactical { parsed, raw: frame.payload });
    }

    fn on_rx_msg(&mut self, frame: Frame) {
        let Some((from, channel, msg_id, text)) = wire::parse_rx_msg(&frame.payload) else {
            warn!("malformed EvRxMsg frame, ignoring");
            return;
        };
        let entry = MessageEntry {
            direction: Direction::Incoming,
            seq: Some(frame.seq),
            msg_id: Some(msg_id),
            from,
            to: LOCAL_NODE_ID,
            channel,
            text,
            status: MessageStatus::Succeeded,
            radio: RadioMetadata::default(),
            lat: None,
            lon: None,
            is_team_chat: false,
            team_conversation_key: None,
        };
        let _ = self.events.send(FrameEvent::IncomingMessage(entry));
    }

    fn on_app_data(&mut self, frame: Frame) {
        let Some(event) = wire::parse_app_data(&frame.payload) else {
            warn!("malformed EvAppData frame, ignoring");
            return;
        };
        if let Some(packet) = self.reassembler.on_event(event, Instant::now()) {
            let decoded = ports::decode(&packet);
            let _ = self.events.send(FrameEvent::AppData { packet, decoded });
        }
    }

    async fn check_timeouts(&mut self) {
        let now = Instant::now();
        for seq in self.tracker.time_out(now) {
            match self.tracker.retry_or_expire(seq, now) {
                Some(crate::tracker::RetryOutcome::Resend(bytes)) => {
                    if let Err(e) = self.write(&bytes).await {
                        warn!("retry send failed: {e}");
                    }
                }
                Some(crate::tracker::RetryOutcome::Expired) => {
                    if let Some(entry) = self.messages.get_mut(&seq) {
                        entry.status = MessageStatus::Timeout;
                    }
                    self.tracker.complete(seq);
                }
                None => {}
            }
        }
        self.reassembler.expire(now);
    }

    fn on_transport_error(&mut self, kind: TransportErrorKind, message: String) {
        self.last_error = Some(message.clone());
        let _ = self.events.send(FrameEvent::TransportError(kind, message));
        if self.options.auto_reconnect && !self.shutting_down {
            self.transition(ClientState::Reconnecting);
        } else {
            self.transition(ClientState::Error);
        }
    }

    async fn do_disconnect(&mut self) {
        self.shutting_down = true;
        self.tracker.cancel_all();
        for entry in self.messages.values_mut() {
            if matches!(entry.status, MessageStatus::Pending | MessageStatus::Acked) {
                entry.status = MessageStatus::Canceled;
            }
        }
        self.pending_results.clear();
        if let Some(transport) = self.transport.as_mut() {
            transport.close().await;
        }
        self.transport = None;
        self.transport_events = None;
        self.reassembler = Reassembler::default();
        self.team_chat.reset();
        self.transition(ClientState::Disconnected);
    }

    fn next_msg_id(&mut self) -> u32 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }

    async fn handle_send_message(
        &mut self,
        to: u32,
        channel: u8,
        text: String,
        respond: oneshot::Sender<Result<()>>,
    ) {
        let msg_id = self.next_msg_id();
        let seq = self.tracker.next_seq();
        let payload = wire::encode_tx_msg(to, channel, msg_id, &text);
        let frame = Frame::new(frame_type::CMD_TX_MSG, seq, payload);
        let encoded = match codec::encode(&frame, self.max_frame_len()) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = respond.send(Err(Error::Decode(e)));
                return;
            }
        };

        let (_, handle) = self.tracker.register_at(
            seq,
            self.ack_timeout(),
            self.options.max_retries,
            encoded.clone(),
            Instant::now(),
        );
        self.messages.insert(
            seq,
            MessageEntry {
                direction: Direction::Outgoing,
                seq: Some(seq),
                msg_id: Some(msg_id),
                from: LOCAL_NODE_ID,
                to,
                channel,
                text,
                status: MessageStatus::Pending,
                radio: RadioMetadata::default(),
                lat: None,
                lon: None,
                is_team_chat: false,
                team_conversation_key: None,
            },
        );
        self.pending_results.push_back(seq);

        if let Err(e) = self.write(&encoded).await {
            self.messages.remove(&seq);
            let _ = respond.send(Err(e));
            return;
        }

        tokio::spawn(async move {
            let result = match handle.acked.await {
                Ok(Ok(code)) if code == ack_code::OK => Ok(()),
                Ok(Ok(code)) => Err(Error::protocol(format!("send rejected, code {code}"))),
                Ok(Err(Terminal::TimedOut)) => Err(Error::Timeout),
                Ok(Err(Terminal::Canceled)) => Err(Error::Canceled),
                Err(_) => Err(Error::Disconnected),
            };
            let _ = respond.send(result);
        });
    }

    async fn handle_send_team_text(
        &mut self,
        text: String,
        channel: u8,
        conversation_key: Option<String>,
        respond: oneshot::Sender<Result<()>>,
    ) {
        if self.transport.is_none() {
            let _ = respond.send(Err(Error::Disconnected));
            return;
        }
        let msg_id = self.next_msg_id();
        let team_state = self.team_state.clone();
        let ctx = TeamChatContext {
            from: LOCAL_NODE_ID,
            to: BROADCAST_NODE_ID,
            channel,
            msg_id,
            text: &text,
            team_state: team_state.as_ref(),
            team_conversation_key: conversation_key.as_deref(),
        };

        let tracker = &mut self.tracker;
        let messages = &mut self.messages;
        let pending_results = &mut self.pending_results;
        let transport = self.transport.as_ref().expect("checked above");
        let ack_timeout = self.options.ack_timeout_ms;
        let max_retries = self.options.max_retries;
        let max_len = self.options.max_frame_len;
        let events = &self.events;
        let entry_text = text.clone();
        let entry_conversation_key = conversation_key.clone();

        let result = self
            .team_chat
            .send(ctx, move |payload| {
                let tracker = &mut *tracker;
                let messages = &mut *messages;
                let pending_results = &mut *pending_results;
                let entry_text = entry_text.clone();
                let entry_conversation_key = entry_conversation_key.clone();
                async move {
                    let seq = tracker.next_seq();
                    let frame = Frame::new(frame_type::CMD_TX_APP_DATA, seq, payload);
                    let encoded = codec::encode(&frame, max_len)?;
                    let (_, handle) = tracker.register_at(
                        seq,
                        Duration::from_millis(ack_timeout),
                        max_retries,
                        encoded.clone(),
                        Instant::now(),
                    );
                    // Tracked the same way handle_send_message tracks a plain
                    // send, so a team-chat send's lifecycle is observable via
                    // ClientSnapshot rather than only through the aggregate
                    // TxResult event below.
                    messages.insert(
                        seq,
                        MessageEntry {
                            direction: Direction::Outgoing,
                            seq: Some(seq),
                            msg_id: Some(msg_id),
                            from: LOCAL_NODE_ID,
                            to: BROADCAST_NODE_ID,
                            channel,
                            text: entry_text,
                            status: MessageStatus::Pending,
                            radio: RadioMetadata::default(),
                            lat: None,
                            lon: None,
                            is_team_chat: true,
                            team_conversation_key: entry_conversation_key,
                        },
                    );
                    pending_results.push_back(seq);

                    transport.write(&encoded).await.map_err(Error::Io)?;
                    let acked = handle.acked.await;
                    // Team-chat doesn't wait on a correlated tx-result the
                    // way a plain send's spawned completion task does, so
                    // every probe attempt retires its tracker record as soon
                    // as its ack resolves instead of leaking it forever.
                    tracker.complete(seq);
                    match acked {
                        Ok(Ok(code)) => Ok(code),
                        Ok(Err(Terminal::TimedOut)) => Err(Error::Timeout),
                        Ok(Err(Terminal::Canceled)) => Err(Error::Canceled),
                        Err(_) => Err(Error::Disconnected),
                    }
                }
            })
            .await;

        if result.is_ok() {
            info!("team-chat message delivered on msg_id {msg_id}");
        }
        let _ = events.send(FrameEvent::TxResult {
            outcome: TxOutcome { success: result.is_ok() },
        });
        let _ = respond.send(result);
    }
}

/// Awaits the next transport event, or pends forever if the transport isn't
/// open (used as a `tokio::select!` branch that must stay inert until
/// `connect_once` installs a receiver).
async fn recv_transport_event(
    rx: &mut Option<mpsc::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEndpoint;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex as SyncMutex, OnceLock};
    use tokio::sync::Mutex as AsyncMutex;

    /// In-memory transport pairing an inbound byte feed with an outbound
    /// write sink, driven directly by tests (spec §8 end-to-end scenarios).
    /// Keyed by `port_name` in the endpoint so concurrently-running tests
    /// each get their own channel and write log instead of sharing one.
    struct MockTransport {
        sent: Arc<AsyncMutex<Vec<Vec<u8>>>>,
    }

    struct Rig {
        inbound: mpsc::Sender<TransportEvent>,
        sent: Arc<AsyncMutex<Vec<Vec<u8>>>>,
    }

    static REGISTRY: OnceLock<SyncMutex<HashMap<String, Rig>>> = OnceLock::new();
    static OPEN_COUNTS: OnceLock<SyncMutex<HashMap<String, u32>>> = OnceLock::new();
    static TRACING: OnceLock<()> = OnceLock::new();

    /// Installs a fmt subscriber once so state-transition/retry logs are
    /// visible under `cargo test -- --nocapture` when a scenario test fails.
    fn init_tracing() {
        TRACING.get_or_init(|| {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        });
    }

    fn registry() -> &'static SyncMutex<HashMap<String, Rig>> {
        REGISTRY.get_or_init(|| SyncMutex::new(HashMap::new()))
    }

    fn open_counts() -> &'static SyncMutex<HashMap<String, u32>> {
        OPEN_COUNTS.get_or_init(|| SyncMutex::new(HashMap::new()))
    }

    fn open_count(port_name: &str) -> u32 {
        *open_counts().lock().unwrap().get(port_name).unwrap_or(&0)
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(
            endpoint: &TransportEndpoint,
        ) -> std::io::Result<(Self, mpsc::Receiver<TransportEvent>)> {
            let TransportEndpoint::Serial { port_name, .. } = endpoint else {
                panic!("MockTransport only understands Serial endpoints");
            };
            let (tx, rx) = mpsc::channel(64);
            let sent = Arc::new(AsyncMutex::new(Vec::new()));
            registry().lock().unwrap().insert(
                port_name.clone(),
                Rig {
                    inbound: tx,
                    sent: sent.clone(),
                },
            );
            *open_counts().lock().unwrap().entry(port_name.clone()).or_insert(0) += 1;
            Ok((Self { sent }, rx))
        }

        async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
            self.sent.lock().await.push(bytes.to_vec());
            Ok(())
        }

        async fn close(&mut self) {}
    }

    async fn inject(port_name: &str, bytes: Vec<u8>) {
        let inbound = registry().lock().unwrap().get(port_name).unwrap().inbound.clone();
        inbound.send(TransportEvent::Data(bytes)).await.unwrap();
    }

    async fn sent_frames(port_name: &str) -> Vec<Vec<u8>> {
        let sent = registry().lock().unwrap().get(port_name).unwrap().sent.clone();
        sent.lock().await.clone()
    }

    async fn inject_error(port_name: &str, kind: TransportErrorKind, message: &str) {
        let inbound = registry().lock().unwrap().get(port_name).unwrap().inbound.clone();
        inbound.send(TransportEvent::Error(kind, message.to_string())).await.unwrap();
    }

    fn hello_ack_frame(seq: u16, caps: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend(1u16.to_le_bytes());
        payload.extend(512u16.to_le_bytes());
        payload.extend(caps.to_le_bytes());
        payload.push(b"TrailMate".len() as u8);
        payload.extend_from_slice(b"TrailMate");
        payload.push(b"dev".len() as u8);
        payload.extend_from_slice(b"dev");
        codec::encode(&Frame::new(frame_type::HELLO_ACK, seq, payload), 512).unwrap()
    }

    fn decode_sent(bytes: &[u8]) -> Frame {
        let mut dec = Decoder::new(4096);
        dec.append(bytes);
        dec.drain_frames().remove(0).unwrap()
    }

    async fn wait_for_state(rx: &mut broadcast::Receiver<FrameEvent>, target: ClientState) {
        loop {
            if let Ok(FrameEvent::StateChanged { state, .. }) = rx.recv().await {
                if state == target {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn handshake_without_set_time_reaches_ready() {
        let port = "mock-handshake-no-set-time";
        let options = ConnectOptions {
            endpoint: TransportEndpoint::Serial { port_name: port.into(), baud_rate: 9600 },
            ..ConnectOptions::default()
        };
        let handle = spawn::<MockTransport>(options);
        let mut events = handle.subscribe();

        wait_for_state(&mut events, ClientState::Handshaking).await;
        let hello = decode_sent(&sent_frames(port).await[0]);
        inject(
            port,
            hello_ack_frame(
                hello.seq,
                Capabilities::CAP_TX_MSG | Capabilities::CAP_CONFIG | Capabilities::CAP_STATUS,
            ),
        )
        .await;

        loop {
            match events.recv().await.unwrap() {
                FrameEvent::Ready { device_info } => {
                    assert_eq!(device_info.model, "TrailMate");
                    break;
                }
                _ => continue,
            }
        }
        // No SetTime should follow: only the Hello frame was written.
        assert_eq!(sent_frames(port).await.len(), 1);
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn handshake_with_cap_set_time_sends_set_time() {
        let port = "mock-handshake-set-time";
        let options = ConnectOptions {
            endpoint: TransportEndpoint::Serial { port_name: port.into(), baud_rate: 9600 },
            ..ConnectOptions::default()
        };
        let handle = spawn::<MockTransport>(options);
        let mut events = handle.subscribe();

        wait_for_state(&mut events, ClientState::Handshaking).await;
        let hello = decode_sent(&sent_frames(port).await[0]);
        inject(port, hello_ack_frame(hello.seq, Capabilities::CAP_SET_TIME)).await;
        wait_for_state(&mut events, ClientState::Ready).await;

        // Give the actor a beat to write the follow-up SetTime frame.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let frames = sent_frames(port).await;
        assert!(frames.iter().any(|f| decode_sent(f).frame_type == frame_type::CMD_SET_TIME));
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn send_message_transitions_through_ack_then_tx_result() {
        let port = "mock-send-message";
        let options = ConnectOptions {
            endpoint: TransportEndpoint::Serial { port_name: port.into(), baud_rate: 9600 },
            ack_timeout_ms: 5_000,
            ..ConnectOptions::default()
        };
        let handle = spawn::<MockTransport>(options);
        let mut events = handle.subscribe();

        wait_for_state(&mut events, ClientState::Handshaking).await;
        let hello = decode_sent(&sent_frames(port).await[0]);
        inject(port, hello_ack_frame(hello.seq, 0)).await;
        wait_for_state(&mut events, ClientState::Ready).await;

        let handle2 = handle.clone();
        let send_task = tokio::spawn(async move {
            handle2.send_message(0x0102_0304, 1, "Hello").await
        });

        // Wait for the CmdTxMsg frame to hit the transport, then ack it.
        let seq = loop {
            let frames = sent_frames(port).await;
            if let Some(f) = frames.iter().map(|b| decode_sent(b)).find(|f| f.frame_type == frame_type::CMD_TX_MSG) {
                break f.seq;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let ack = codec::encode(&Frame::new(frame_type::ACK, seq, vec![ack_code::OK]), 512).unwrap();
        inject(port, ack).await;

        assert!(send_task.await.unwrap().is_ok());

        let mut tx_result = Vec::new();
        tx_result.extend(1234u32.to_le_bytes());
        tx_result.push(1);
        let ev = codec::encode(&Frame::new(frame_type::EV_TX_RESULT, 0, tx_result), 512).unwrap();
        inject(port, ev).await;

        loop {
            if let FrameEvent::TxResult { outcome } = events.recv().await.unwrap() {
                assert!(outcome.success);
                break;
            }
        }
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn crc_error_does_not_prevent_later_frames_from_parsing() {
        let port = "mock-crc-error";
        let options = ConnectOptions {
            endpoint: TransportEndpoint::Serial { port_name: port.into(), baud_rate: 9600 },
            ..ConnectOptions::default()
        };
        let handle = spawn::<MockTransport>(options);
        let mut events = handle.subscribe();

        wait_for_state(&mut events, ClientState::Handshaking).await;
        let hello = decode_sent(&sent_frames(port).await[0]);
        inject(port, hello_ack_frame(hello.seq, 0)).await;
        wait_for_state(&mut events, ClientState::Ready).await;

        let mut bad = codec::encode(&Frame::new(frame_type::EV_STATUS, 0, b"x".to_vec()), 512).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        inject(port, bad).await;

        let mut saw_decode_error = false;
        loop {
            match events.recv().await.unwrap() {
                FrameEvent::DecodeError(_) => {
                    saw_decode_error = true;
                    break;
                }
                _ => continue,
            }
        }
        assert!(saw_decode_error);

        let good = codec::encode(&Frame::new(frame_type::EV_STATUS, 0, b"ok".to_vec()), 512).unwrap();
        inject(port, good).await;
        loop {
            if let FrameEvent::Status(payload) = events.recv().await.unwrap() {
                assert_eq!(payload, b"ok");
                break;
            }
        }
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn snapshot_reflects_device_info_after_handshake() {
        let port = "mock-snapshot";
        let options = ConnectOptions {
            endpoint: TransportEndpoint::Serial { port_name: port.into(), baud_rate: 9600 },
            ..ConnectOptions::default()
        };
        let handle = spawn::<MockTransport>(options);
        let mut events = handle.subscribe();

        let before = handle.snapshot().await;
        assert_eq!(before.device_info, None);

        wait_for_state(&mut events, ClientState::Handshaking).await;
        let hello = decode_sent(&sent_frames(port).await[0]);
        inject(port, hello_ack_frame(hello.seq, 0)).await;
        wait_for_state(&mut events, ClientState::Ready).await;

        let after = handle.snapshot().await;
        assert_eq!(after.state, ClientState::Ready);
        assert_eq!(after.device_info.unwrap().model, "TrailMate");
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_while_ready_reopens_transport_within_tolerance() {
        init_tracing();
        let port = "mock-reconnect";
        let options = ConnectOptions {
            endpoint: TransportEndpoint::Serial { port_name: port.into(), baud_rate: 9600 },
            reconnect_delay_ms: 100,
            auto_reconnect: true,
            ..ConnectOptions::default()
        };
        let handle = spawn::<MockTransport>(options);
        let mut events = handle.subscribe();

        wait_for_state(&mut events, ClientState::Handshaking).await;
        let hello = decode_sent(&sent_frames(port).await[0]);
        inject(port, hello_ack_frame(hello.seq, 0)).await;
        wait_for_state(&mut events, ClientState::Ready).await;
        assert_eq!(open_count(port), 1);

        inject_error(port, TransportErrorKind::Disconnected, "cable unplugged").await;
        wait_for_state(&mut events, ClientState::Reconnecting).await;

        let deadline = Instant::now() + Duration::from_millis(400);
        loop {
            if open_count(port) >= 2 {
                break;
            }
            assert!(Instant::now() < deadline, "transport was not reopened within tolerance");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.disconnect().await;
    }
}
