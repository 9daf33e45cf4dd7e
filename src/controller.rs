use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    config::Config,
    error::Error,
    modes::{corrections, Correction, Direction, LineMode},
    protocol::{CommandCodec, Line, Reply},
    uart::{self, UartHandle},
};

/// How long the device may take to answer a command before the
/// whole connection is considered dead.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Idle time after which an empty ping command is sent.
/// Reset by every line the device sends.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// How long a pulsed line is held in its flipped state.
const PULSE_HOLD: Duration = Duration::from_millis(300);

/// A deadline far enough away to stand in for "no deadline".
/// Keeps disabled `select!` timer branches constructible.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

/// A change of a cached digital line state, as fanned out to
/// subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEvent {
    /// 1-indexed line number.
    pub line: usize,

    /// The new logical state.
    pub state: bool,
}

type ReplySender = oneshot::Sender<Result<Reply, Error>>;

/// What to do once a command's terminal reply arrives.
///
/// The source of truth for every multi-step sequence (handshake,
/// mode corrections, pulses): each step is an explicit variant, not
/// a closure.
enum OnReply {
    /// Nothing.
    Discard,

    /// Hand the reply to a waiting caller.
    Respond(ReplySender),

    /// The passphrase exchange finished; open the UART tunnel if it
    /// succeeded.
    UartGate,

    /// Replace the direction cache from an `IO,GET,ALL` snapshot.
    Directions,

    /// Replace the state cache from a `RID,ALL` snapshot.
    States,

    /// A `WR` write finished; record it if acknowledged.
    WroteState {
        line: usize,
        state: bool,
        reply: Option<ReplySender>,
    },

    /// An `IO,SET` write finished; record it if acknowledged.
    WroteDirection {
        line: usize,
        direction: Direction,
        reply: Option<ReplySender>,
    },

    /// The first half of a pulse finished; if acknowledged, hold and
    /// then flip the line back.
    PulseFlipped {
        line: usize,
        state: bool,
        reply: ReplySender,
    },
}

/// A queued command.
struct Command {
    body: String,
    on_reply: OnReply,
}

impl Command {
    fn new(body: impl Into<String>, on_reply: OnReply) -> Self {
        Self {
            body: body.into(),
            on_reply,
        }
    }
}

/// The command currently awaiting its terminal reply.
struct InFlight {
    command: Command,
    deadline: Instant,
}

enum ControllerMessage {
    SetLineState {
        line: usize,
        state: bool,
        reply: ReplySender,
    },
    ToggleLine {
        line: usize,
        reply: ReplySender,
    },
    PulseLine {
        line: usize,
        reply: ReplySender,
    },
    SetLineDir {
        line: usize,
        direction: Direction,
        reply: ReplySender,
    },
    SetLineMode {
        line: usize,
        mode: LineMode,
    },
    LineState {
        line: usize,
        reply: oneshot::Sender<Option<bool>>,
    },
    Connected {
        reply: oneshot::Sender<bool>,
    },
    UartSend {
        payload: Vec<u8>,
    },
    /// The pulse hold expired; flip the line back.
    PulseRestore {
        line: usize,
        reply: ReplySender,
    },
}

/// What ended a served connection.
enum Served {
    /// The connection died; reconnect.
    Disconnected,

    /// Every handle is gone; exit the task.
    Shutdown,
}

/// A cloneable handle to a device controller.
///
/// Creating one spawns the controller task, which connects to the
/// device and keeps reconnecting for as long as the process lives.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    messages: mpsc::UnboundedSender<ControllerMessage>,
    connection_tx: broadcast::Sender<bool>,
    line_tx: broadcast::Sender<LineEvent>,
    uart_data_tx: broadcast::Sender<Vec<u8>>,
}

impl ControllerHandle {
    /// Spawn a controller for the device in the given config.
    pub fn new(config: Config) -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (connection_tx, _) = broadcast::channel(16);
        let (line_tx, _) = broadcast::channel(256);
        let (uart_data_tx, _) = broadcast::channel(256);

        let span = info_span!("controller", host = %config.host);

        let controller = Controller {
            config,
            messages: messages_rx,
            loopback: messages_tx.clone(),
            connection_tx: connection_tx.clone(),
            line_tx: line_tx.clone(),
            uart_data_tx: uart_data_tx.clone(),
            connected: false,
            line_states: vec![],
            line_directions: vec![],
            line_modes: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: None,
            uart: None,
        };

        tokio::spawn(async move { controller.run().await }.instrument(span));

        Self {
            messages: messages_tx,
            connection_tx,
            line_tx,
            uart_data_tx,
        }
    }

    /// Subscribe to connection transitions.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<bool> {
        self.connection_tx.subscribe()
    }

    /// Subscribe to cached line state changes.
    pub fn subscribe_lines(&self) -> broadcast::Receiver<LineEvent> {
        self.line_tx.subscribe()
    }

    /// Subscribe to raw data arriving on the UART tunnel.
    /// Null bytes have already been filtered out.
    pub fn subscribe_uart(&self) -> broadcast::Receiver<Vec<u8>> {
        self.uart_data_tx.subscribe()
    }

    async fn request(
        &self,
        make: impl FnOnce(ReplySender) -> ControllerMessage,
    ) -> Result<Reply, Error> {
        let (tx, rx) = oneshot::channel();

        self.messages.send(make(tx)).map_err(|_| Error::Shutdown)?;

        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Write a line state. Resolves with the device's reply.
    pub async fn set_line_state(&self, line: usize, state: bool) -> Result<Reply, Error> {
        self.request(|reply| ControllerMessage::SetLineState { line, state, reply })
            .await
    }

    /// Write the opposite of a line's cached state.
    /// An unknown cached state toggles to high.
    pub async fn toggle_line(&self, line: usize) -> Result<Reply, Error> {
        self.request(|reply| ControllerMessage::ToggleLine { line, reply })
            .await
    }

    /// Flip a line, hold for 0.3 s, flip it back.
    ///
    /// Each half only runs if the previous write was acknowledged;
    /// a rejected write aborts the pulse and resolves with that
    /// reply.
    pub async fn pulse_line(&self, line: usize) -> Result<Reply, Error> {
        self.request(|reply| ControllerMessage::PulseLine { line, reply })
            .await
    }

    /// Write a line direction. Resolves with the device's reply.
    pub async fn set_line_dir(&self, line: usize, direction: Direction) -> Result<Reply, Error> {
        self.request(|reply| ControllerMessage::SetLineDir {
            line,
            direction,
            reply,
        })
        .await
    }

    /// Put a line in a declarative mode and re-check it right away.
    pub fn set_line_mode(&self, line: usize, mode: LineMode) -> Result<(), Error> {
        self.messages
            .send(ControllerMessage::SetLineMode { line, mode })
            .map_err(|_| Error::Shutdown)
    }

    /// Read a line's cached state. `None` until the device has
    /// reported it.
    pub async fn line_state(&self, line: usize) -> Result<Option<bool>, Error> {
        let (tx, rx) = oneshot::channel();

        self.messages
            .send(ControllerMessage::LineState { line, reply: tx })
            .map_err(|_| Error::Shutdown)?;

        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Whether the device connection is currently up.
    ///
    /// Subscribe to [`ControllerHandle::subscribe_connection`] for
    /// transitions; this answers for the moment in between.
    pub async fn connected(&self) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();

        self.messages
            .send(ControllerMessage::Connected { reply: tx })
            .map_err(|_| Error::Shutdown)?;

        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Write raw bytes to the UART tunnel.
    /// Dropped silently while the tunnel is down.
    pub fn uart_send(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.messages
            .send(ControllerMessage::UartSend { payload })
            .map_err(|_| Error::Shutdown)
    }

    /// Queue a line write without waiting for the acknowledgement.
    ///
    /// Queued synchronously, so consecutive calls keep their order
    /// relative to each other and to [`ControllerHandle::uart_send`].
    pub(crate) fn write_line_detached(&self, line: usize, state: bool) -> Result<(), Error> {
        let (reply, _dropped) = oneshot::channel();

        self.messages
            .send(ControllerMessage::SetLineState { line, state, reply })
            .map_err(|_| Error::Shutdown)
    }
}

struct Controller {
    config: Config,
    messages: mpsc::UnboundedReceiver<ControllerMessage>,

    // For timer tasks (pulse holds) to report back in.
    loopback: mpsc::UnboundedSender<ControllerMessage>,

    connection_tx: broadcast::Sender<bool>,
    line_tx: broadcast::Sender<LineEvent>,
    uart_data_tx: broadcast::Sender<Vec<u8>>,

    connected: bool,

    // 1-indexed; index 0 is never used. Rebuilt wholesale from
    // device snapshots.
    line_states: Vec<Option<bool>>,
    line_directions: Vec<Option<Direction>>,

    line_modes: HashMap<usize, LineMode>,

    queue: VecDeque<Command>,
    in_flight: Option<InFlight>,

    uart: Option<UartHandle>,
}

type DeviceConnection = Framed<TcpStream, CommandCodec>;

impl Controller {
    async fn run(mut self) {
        loop {
            let Some(stream) = self.establish().await else {
                debug!("All handles dropped while disconnected");
                return;
            };

            let mut connection = Framed::new(stream, CommandCodec::default());

            match self.serve(&mut connection).await {
                Served::Disconnected => {
                    self.on_disconnect();
                    // Loop around: reconnect immediately.
                }
                Served::Shutdown => {
                    self.on_disconnect();
                    debug!("All handles dropped, controller exiting");
                    return;
                }
            }
        }
    }

    /// Connect, retrying immediately and indefinitely.
    /// Keeps serving handle messages meanwhile.
    /// `None` when every handle is gone.
    async fn establish(&mut self) -> Option<TcpStream> {
        loop {
            let connect = TcpStream::connect((self.config.host.clone(), self.config.command_port));

            tokio::select! {
                result = connect => match result {
                    Ok(stream) => {
                        info!("Connection made");
                        return Some(stream);
                    }
                    Err(e) => {
                        // Retried right away: no backoff, no limit.
                        warn!(%e, "Error connecting, retrying");
                    }
                },
                message = self.messages.recv() => match message {
                    Some(message) => self.handle_message_disconnected(message),
                    None => return None,
                },
            }
        }
    }

    /// Serve one established connection until it dies.
    async fn serve(&mut self, connection: &mut DeviceConnection) -> Served {
        self.handshake();

        if self.maybe_send(connection).await.is_err() {
            return Served::Disconnected;
        }

        self.set_connected(true);

        let mut keepalive_at = Instant::now() + KEEPALIVE_INTERVAL;

        loop {
            let response_deadline = self.in_flight.as_ref().map(|in_flight| in_flight.deadline);

            tokio::select! {
                line = connection.next() => match line {
                    Some(Ok(line)) => {
                        keepalive_at = Instant::now() + KEEPALIVE_INTERVAL;

                        if self.handle_line(connection, line).await.is_err() {
                            return Served::Disconnected;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(%e, "Read error");
                        return Served::Disconnected;
                    }
                    None => {
                        warn!("Connection lost");
                        return Served::Disconnected;
                    }
                },
                message = self.messages.recv() => match message {
                    Some(message) => {
                        if self.handle_message(connection, message).await.is_err() {
                            return Served::Disconnected;
                        }
                    }
                    None => return Served::Shutdown,
                },
                _ = sleep_until(response_deadline.unwrap_or_else(far_future)),
                    if response_deadline.is_some() =>
                {
                    let body = self
                        .in_flight
                        .as_ref()
                        .map(|in_flight| in_flight.command.body.clone())
                        .unwrap_or_default();
                    error!(command = %body, "Response timeout, dropping connection");
                    return Served::Disconnected;
                },
                _ = sleep_until(keepalive_at) => {
                    trace!("Keepalive ping");
                    self.submit(Command::new("", OnReply::Discard));

                    if self.maybe_send(connection).await.is_err() {
                        return Served::Disconnected;
                    }

                    keepalive_at = Instant::now() + KEEPALIVE_INTERVAL;
                },
            }
        }
    }

    /// Queue the connection handshake.
    ///
    /// The passphrase reply gates the UART tunnel; the two snapshot
    /// replies rebuild the caches, sweep the configured modes and
    /// fan the fresh states out to subscribers.
    fn handshake(&mut self) {
        // Anything left over belongs to a previous connection.
        for command in self.queue.drain(..) {
            fail(command.on_reply);
        }
        if let Some(in_flight) = self.in_flight.take() {
            fail(in_flight.command.on_reply);
        }

        self.submit(Command::new("", OnReply::Discard));
        self.submit(Command::new(
            format!("PSW,SET,{}", self.config.passphrase),
            OnReply::UartGate,
        ));
        self.submit(Command::new("EVT,ON", OnReply::Discard));
        self.submit(Command::new("IO,GET,ALL", OnReply::Directions));
        self.submit(Command::new("RID,ALL", OnReply::States));
    }

    fn submit(&mut self, command: Command) {
        self.queue.push_back(command);
    }

    /// Send the next queued command if nothing is in flight.
    async fn maybe_send(&mut self, connection: &mut DeviceConnection) -> Result<(), Error> {
        if self.in_flight.is_some() {
            return Ok(());
        }

        let Some(command) = self.queue.pop_front() else {
            return Ok(());
        };

        trace!(command = %command.body, "Sending");
        connection.send(command.body.clone()).await?;

        self.in_flight = Some(InFlight {
            command,
            deadline: Instant::now() + RESPONSE_TIMEOUT,
        });

        Ok(())
    }

    async fn handle_line(
        &mut self,
        connection: &mut DeviceConnection,
        line: Line,
    ) -> Result<(), Error> {
        match line {
            Line::Info => {}
            Line::Event { line, state } => {
                trace!(line, ?state, "Event");
                if let Some(state) = state {
                    self.save_line_state(line, state);
                }
            }
            Line::Terminal(payload) => {
                let Some(in_flight) = self.in_flight.take() else {
                    debug!(%payload, "Terminal reply with nothing in flight");
                    return Ok(());
                };

                // The error log keys on the exact payload; prefixed
                // variants are still delivered as rejections below.
                if payload == "ERR" {
                    error!(command = %in_flight.command.body, "Error in response");
                }

                let reply = Reply::parse(&payload);

                // Keep the queue moving before completing the
                // finished command, so anything the completion
                // enqueues lands behind the popped command.
                self.maybe_send(connection).await?;

                self.complete(in_flight.command.on_reply, reply);

                // The completion may have enqueued corrections.
                self.maybe_send(connection).await?;
            }
        }

        Ok(())
    }

    /// Run a finished command's continuation.
    fn complete(&mut self, on_reply: OnReply, reply: Reply) {
        match on_reply {
            OnReply::Discard => {}
            OnReply::Respond(tx) => {
                let _ = tx.send(Ok(reply));
            }
            OnReply::UartGate => self.open_uart(reply),
            OnReply::Directions => self.load_directions(reply),
            OnReply::States => self.load_states(reply),
            OnReply::WroteState { line, state, reply: tx } => {
                if reply.is_ok() {
                    self.save_line_state(line, state);
                }
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(reply));
                }
            }
            OnReply::WroteDirection {
                line,
                direction,
                reply: tx,
            } => {
                if reply.is_ok() {
                    self.save_line_direction(line, direction);
                    self.check_line_mode(line);
                }
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(reply));
                }
            }
            OnReply::PulseFlipped { line, state, reply: tx } => {
                if reply.is_ok() {
                    self.save_line_state(line, state);

                    let loopback = self.loopback.clone();
                    tokio::spawn(async move {
                        sleep(PULSE_HOLD).await;
                        let _ = loopback.send(ControllerMessage::PulseRestore { line, reply: tx });
                    });
                } else {
                    // The pulse aborts; surface the rejection.
                    let _ = tx.send(Ok(reply));
                }
            }
        }
    }

    fn open_uart(&mut self, reply: Reply) {
        if !reply.is_ok() {
            error!(?reply, "Passphrase exchange failed, UART stays closed");
            return;
        }

        if !self.config.uart || self.uart.is_some() {
            return;
        }

        let repeat_interval = self
            .config
            .uart_repeat_interval_ms
            .map(Duration::from_millis);

        self.uart = Some(uart::spawn(
            self.config.host.clone(),
            self.config.uart_port,
            repeat_interval,
            self.uart_data_tx.clone(),
        ));
    }

    fn load_directions(&mut self, reply: Reply) {
        let Reply::Value(snapshot) = reply else {
            warn!(?reply, "Unusable direction snapshot");
            return;
        };

        self.line_directions = std::iter::once(None)
            .chain(snapshot.chars().map(Direction::from_wire_digit))
            .collect();

        debug!(lines = self.line_directions.len() - 1, "Directions loaded");

        let lines: Vec<usize> = self.line_modes.keys().copied().collect();
        for line in lines {
            self.check_line_mode(line);
        }
    }

    fn load_states(&mut self, reply: Reply) {
        let Reply::Value(snapshot) = reply else {
            warn!(?reply, "Unusable state snapshot");
            return;
        };

        self.line_states = std::iter::once(None)
            .chain(snapshot.chars().map(|ch| Some(ch == '1')))
            .collect();

        debug!(lines = self.line_states.len() - 1, "States loaded");

        // Pulse-mode lines must rest low; sweep them once per
        // snapshot.
        let pulse_lines: Vec<usize> = self
            .line_modes
            .iter()
            .filter(|(_, &mode)| mode == LineMode::Pulse)
            .map(|(&line, _)| line)
            .collect();
        for line in pulse_lines {
            self.check_line_mode(line);
        }

        // Everyone gets the freshly loaded states.
        for (line, state) in self.line_states.iter().enumerate().skip(1) {
            if let Some(state) = *state {
                let _ = self.line_tx.send(LineEvent { line, state });
            }
        }
    }

    fn cached_state(&self, line: usize) -> Option<bool> {
        self.line_states.get(line).copied().flatten()
    }

    fn cached_direction(&self, line: usize) -> Option<Direction> {
        self.line_directions.get(line).copied().flatten()
    }

    /// Update the cached state of one line, notifying subscribers on
    /// change. Ignored until the first snapshot sized the cache.
    fn save_line_state(&mut self, line: usize, state: bool) {
        let Some(slot) = self.line_states.get_mut(line) else {
            return;
        };

        if *slot != Some(state) {
            *slot = Some(state);
            let _ = self.line_tx.send(LineEvent { line, state });
        }
    }

    fn save_line_direction(&mut self, line: usize, direction: Direction) {
        if let Some(slot) = self.line_directions.get_mut(line) {
            *slot = Some(direction);
        }
    }

    /// Enqueue whatever writes the line's mode currently requires.
    fn check_line_mode(&mut self, line: usize) {
        let Some(&mode) = self.line_modes.get(&line) else {
            return;
        };

        for correction in corrections(mode, self.cached_direction(line), self.cached_state(line)) {
            debug!(line, ?correction, "Mode correction");
            match correction {
                Correction::SetDirection(direction) => {
                    self.submit_direction_write(line, direction, None);
                }
                Correction::ClearState => self.submit_state_write(line, false, None),
            }
        }
    }

    fn submit_state_write(&mut self, line: usize, state: bool, reply: Option<ReplySender>) {
        let digit = if state { '1' } else { '0' };
        self.submit(Command::new(
            format!("WR,{line},{digit}"),
            OnReply::WroteState { line, state, reply },
        ));
    }

    fn submit_direction_write(
        &mut self,
        line: usize,
        direction: Direction,
        reply: Option<ReplySender>,
    ) {
        self.submit(Command::new(
            format!("IO,SET,{line},{}", direction.wire_digit()),
            OnReply::WroteDirection {
                line,
                direction,
                reply,
            },
        ));
    }

    async fn handle_message(
        &mut self,
        connection: &mut DeviceConnection,
        message: ControllerMessage,
    ) -> Result<(), Error> {
        match message {
            ControllerMessage::SetLineState { line, state, reply } => {
                self.submit_state_write(line, state, Some(reply));
            }
            ControllerMessage::ToggleLine { line, reply } => {
                let target = !self.cached_state(line).unwrap_or(false);
                self.submit_state_write(line, target, Some(reply));
            }
            ControllerMessage::PulseLine { line, reply } => {
                let state = !self.cached_state(line).unwrap_or(false);
                self.submit(Command::new(
                    format!("WR,{line},{}", if state { '1' } else { '0' }),
                    OnReply::PulseFlipped { line, state, reply },
                ));
            }
            ControllerMessage::PulseRestore { line, reply } => {
                let target = !self.cached_state(line).unwrap_or(false);
                self.submit_state_write(line, target, Some(reply));
            }
            ControllerMessage::SetLineDir {
                line,
                direction,
                reply,
            } => {
                self.submit_direction_write(line, direction, Some(reply));
            }
            ControllerMessage::SetLineMode { line, mode } => {
                self.line_modes.insert(line, mode);
                self.check_line_mode(line);
            }
            ControllerMessage::LineState { line, reply } => {
                let _ = reply.send(self.cached_state(line));
            }
            ControllerMessage::Connected { reply } => {
                let _ = reply.send(self.connected);
            }
            ControllerMessage::UartSend { payload } => match &self.uart {
                Some(uart) => uart.send(payload),
                None => debug!("UART payload dropped, tunnel not open"),
            },
        }

        self.maybe_send(connection).await
    }

    /// While disconnected, mutations fail fast and only the caches
    /// and mode registry are served.
    fn handle_message_disconnected(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::SetLineState { reply, .. }
            | ControllerMessage::ToggleLine { reply, .. }
            | ControllerMessage::PulseLine { reply, .. }
            | ControllerMessage::PulseRestore { reply, .. }
            | ControllerMessage::SetLineDir { reply, .. } => {
                let _ = reply.send(Err(Error::NotConnected));
            }
            ControllerMessage::SetLineMode { line, mode } => {
                self.line_modes.insert(line, mode);
            }
            ControllerMessage::LineState { line, reply } => {
                let _ = reply.send(self.cached_state(line));
            }
            ControllerMessage::Connected { reply } => {
                let _ = reply.send(false);
            }
            ControllerMessage::UartSend { .. } => {
                debug!("UART payload dropped, not connected");
            }
        }
    }

    /// Set the connected flag and notify subscribers, as one step.
    fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        info!(connected, "Connection state");
        let _ = self.connection_tx.send(connected);
    }

    /// Tear down everything tied to the dead connection.
    ///
    /// Queued and in-flight commands are abandoned, not retried: the
    /// reconnect handshake rebuilds all device state from scratch.
    fn on_disconnect(&mut self) {
        if self.connected {
            self.set_connected(false);
        }

        if let Some(uart) = self.uart.take() {
            uart.shutdown();
        }

        if let Some(in_flight) = self.in_flight.take() {
            fail(in_flight.command.on_reply);
        }

        for command in self.queue.drain(..) {
            fail(command.on_reply);
        }
    }
}

/// Tell whoever is waiting on a command that the connection is gone.
fn fail(on_reply: OnReply) {
    match on_reply {
        OnReply::Respond(tx) | OnReply::PulseFlipped { reply: tx, .. } => {
            let _ = tx.send(Err(Error::ConnectionLost));
        }
        OnReply::WroteState {
            reply: Some(tx), ..
        }
        | OnReply::WroteDirection {
            reply: Some(tx), ..
        } => {
            let _ = tx.send(Err(Error::ConnectionLost));
        }
        _ => {}
    }
}
