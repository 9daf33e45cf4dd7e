use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{config::PollingConfig, controller::ControllerHandle, error::Error};

/// The sentinel value for a channel whose position is unknown,
/// because it has not been read yet or stopped answering.
pub const UNKNOWN: i32 = -1;

/// Decoded values at or above this cannot come from a 10-bit
/// encoder and are ignored.
const PLAUSIBLE_LIMIT: i32 = 1024;

/// A deadline far enough away to stand in for "no deadline".
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

/// A decoded encoder position, as fanned out to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderReading {
    /// The encoder channel id.
    pub channel: u8,

    /// The decoded position, or [`UNKNOWN`].
    pub value: i32,
}

/// One encoder channel in the polling ring.
#[derive(Debug)]
struct Channel {
    id: u8,

    // The bytes of a reading in progress. A high byte waits here for
    // the low byte that follows it.
    raw_high: Option<u8>,
    raw_low: Option<u8>,

    decoded: i32,
    last_report_ok: bool,
}

impl Channel {
    fn new(id: u8) -> Self {
        Self {
            id,
            raw_high: None,
            raw_low: None,
            decoded: UNKNOWN,
            last_report_ok: true,
        }
    }

    fn clear_raw(&mut self) {
        self.raw_high = None;
        self.raw_low = None;
    }

    /// Feed one raw byte. Yields the Gray value once two
    /// consecutive bytes form a valid high/low pair: the high byte
    /// carries bit 7 plus the five upper Gray bits, the low byte
    /// bit 6 plus the five lower ones.
    fn feed(&mut self, byte: u8) -> Option<u16> {
        if byte >= 0x80 {
            self.raw_high = Some(byte);
            self.raw_low = None;
        } else if (0x40..0x80).contains(&byte) {
            if let Some(high) = self.raw_high.take() {
                self.raw_low = Some(byte);

                let high = (u16::from(high) - 0x80) << 5;
                let low = u16::from(byte) - 0x40;
                return Some(high + low);
            }
            // A low byte with no high byte to pair with.
        } else {
            // Out of range; breaks any pair in progress.
            self.clear_raw();
        }

        None
    }
}

/// Convert reflected Gray code to binary.
fn gray_to_binary(gray: u16) -> u16 {
    let mut value = gray;
    let mut mask = value >> 1;

    while mask != 0 {
        value ^= mask;
        mask >>= 1;
    }

    value
}

/// Where the poller is in a cycle.
///
/// A timer is armed iff a cycle is running; every transition is
/// driven by a timer or by UART data, never by a blocking wait.
#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Not polling (disconnected, or no channels).
    Idle,

    /// The trigger line was raised; the query goes out at
    /// `query_at`.
    Triggered {
        query_at: Instant,
    },

    /// The query went out. The trigger drops at `lower_at`; the
    /// channel gives up at `deadline`.
    Awaiting {
        lower_at: Option<Instant>,
        deadline: Instant,
    },
}

enum PollerMessage {
    SetChannels(Vec<u8>),
}

/// A handle to the encoder polling task.
///
/// Creating one spawns the task; it starts polling whenever the
/// controller reports its connection up, and stops when it goes
/// down.
#[derive(Debug, Clone)]
pub struct PollerHandle {
    messages: mpsc::UnboundedSender<PollerMessage>,
    readings_tx: broadcast::Sender<EncoderReading>,
}

impl PollerHandle {
    /// Spawn a poller over the given controller.
    pub fn new(controller: &ControllerHandle, config: PollingConfig) -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (readings_tx, _) = broadcast::channel(256);

        let span = info_span!("poller");

        let poller = Poller {
            connection_events: controller.subscribe_connection(),
            uart_data: controller.subscribe_uart(),
            controller: controller.clone(),
            trigger_line: config.trigger_line,
            trigger_delay: Duration::from_millis(config.trigger_delay_ms),
            answer_timeout: Duration::from_millis(config.answer_timeout_ms),
            ring: config.channels.into_iter().map(Channel::new).collect(),
            active: 0,
            phase: Phase::Idle,
            pending_ring: None,
            connected: false,
            readings_tx: readings_tx.clone(),
            messages: messages_rx,
        };

        tokio::spawn(async move { poller.run().await }.instrument(span));

        Self {
            messages: messages_tx,
            readings_tx,
        }
    }

    /// Subscribe to decoded readings. A value of [`UNKNOWN`] means
    /// the channel timed out.
    pub fn subscribe_readings(&self) -> broadcast::Receiver<EncoderReading> {
        self.readings_tx.subscribe()
    }

    /// Replace the polled channels.
    ///
    /// If a cycle is in flight it finishes first; polling then
    /// restarts at the first channel of the new ring.
    pub fn set_channels(&self, channels: Vec<u8>) -> Result<(), Error> {
        self.messages
            .send(PollerMessage::SetChannels(channels))
            .map_err(|_| Error::Shutdown)
    }
}

struct Poller {
    controller: ControllerHandle,
    connection_events: broadcast::Receiver<bool>,
    uart_data: broadcast::Receiver<Vec<u8>>,

    trigger_line: usize,
    trigger_delay: Duration,
    answer_timeout: Duration,

    ring: Vec<Channel>,
    active: usize,
    phase: Phase,

    // A reconfiguration waiting for the in-flight cycle to finish.
    pending_ring: Option<Vec<u8>>,

    connected: bool,

    readings_tx: broadcast::Sender<EncoderReading>,
    messages: mpsc::UnboundedReceiver<PollerMessage>,
}

impl Poller {
    async fn run(mut self) {
        // The connection may already be up by the time we were
        // spawned; transitions from here on arrive as events.
        if self.controller.connected().await.unwrap_or(false) {
            self.connected = true;
            self.start();
        }

        loop {
            let (query_at, lower_at, deadline) = match self.phase {
                Phase::Idle => (None, None, None),
                Phase::Triggered { query_at } => (Some(query_at), None, None),
                Phase::Awaiting { lower_at, deadline } => (None, lower_at, Some(deadline)),
            };

            tokio::select! {
                event = self.connection_events.recv() => match event {
                    // The guard dedupes the startup race between the
                    // initial query and the broadcast transition.
                    Ok(true) if !self.connected => {
                        self.connected = true;
                        self.start();
                    }
                    Ok(true) => {}
                    Ok(false) => self.stop(),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Lagged behind connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                chunk = self.uart_data.recv() => match chunk {
                    Ok(chunk) => self.on_uart(&chunk),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Lagged behind UART data");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                message = self.messages.recv() => match message {
                    Some(PollerMessage::SetChannels(channels)) => self.reconfigure(channels),
                    None => return,
                },
                _ = sleep_until(query_at.unwrap_or_else(far_future)), if query_at.is_some() => {
                    self.send_query();
                },
                _ = sleep_until(lower_at.unwrap_or_else(far_future)), if lower_at.is_some() => {
                    self.lower_trigger();
                },
                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.on_timeout();
                },
            }
        }
    }

    /// Begin polling from the first channel.
    fn start(&mut self) {
        if let Some(channels) = self.pending_ring.take() {
            self.install_ring(channels);
        }

        if self.ring.is_empty() {
            debug!("No encoder channels, polling stays idle");
            self.phase = Phase::Idle;
            return;
        }

        self.active = 0;
        for channel in &mut self.ring {
            channel.clear_raw();
        }

        info!(channels = self.ring.len(), "Polling starts");
        self.begin_cycle();
    }

    fn stop(&mut self) {
        self.connected = false;

        if !matches!(self.phase, Phase::Idle) {
            info!("Polling stops");
        }

        self.phase = Phase::Idle;
    }

    fn install_ring(&mut self, channels: Vec<u8>) {
        self.ring = channels.into_iter().map(Channel::new).collect();
    }

    fn reconfigure(&mut self, channels: Vec<u8>) {
        match self.phase {
            Phase::Idle => {
                self.install_ring(channels);
                if self.connected {
                    self.start();
                }
            }
            // A cycle is in flight; let it finish first.
            _ => self.pending_ring = Some(channels),
        }
    }

    /// Raise the trigger and schedule the query.
    fn begin_cycle(&mut self) {
        let channel = &mut self.ring[self.active];
        channel.clear_raw();
        trace!(channel = channel.id, "Trigger high");

        self.write_trigger(true);
        self.phase = Phase::Triggered {
            query_at: Instant::now() + self.trigger_delay,
        };
    }

    /// Ask the active channel for a reading and arm the timeout.
    fn send_query(&mut self) {
        let id = self.ring[self.active].id;
        trace!(channel = id, "Query");

        if self.controller.uart_send(vec![id]).is_err() {
            warn!("Controller gone, cannot query");
        }

        let now = Instant::now();
        self.phase = Phase::Awaiting {
            lower_at: Some(now + self.trigger_delay),
            deadline: now + self.answer_timeout,
        };
    }

    fn lower_trigger(&mut self) {
        self.write_trigger(false);

        if let Phase::Awaiting { lower_at, .. } = &mut self.phase {
            *lower_at = None;
        }
    }

    /// Write the trigger line without holding up the state machine.
    fn write_trigger(&self, state: bool) {
        if self
            .controller
            .write_line_detached(self.trigger_line, state)
            .is_err()
        {
            warn!("Controller gone, cannot drive the trigger");
        }
    }

    fn on_uart(&mut self, chunk: &[u8]) {
        if !matches!(self.phase, Phase::Awaiting { .. }) {
            trace!(bytes = chunk.len(), "UART data outside a poll cycle");
            return;
        }

        let mut sample = None;
        let channel = &mut self.ring[self.active];
        for &byte in chunk {
            if let Some(gray) = channel.feed(byte) {
                sample = Some(gray);
                break;
            }
        }

        let Some(gray) = sample else { return };

        self.record(i32::from(gray_to_binary(gray)));
        self.complete_cycle();
    }

    /// Store and report a decoded value, unless it is implausible
    /// or unchanged.
    fn record(&mut self, value: i32) {
        let channel = &mut self.ring[self.active];

        if value >= PLAUSIBLE_LIMIT {
            trace!(channel = channel.id, value, "Implausible value ignored");
            return;
        }

        channel.last_report_ok = true;

        if value != channel.decoded {
            channel.decoded = value;
            debug!(channel = channel.id, value, "Reading");

            let reading = EncoderReading {
                channel: channel.id,
                value,
            };
            let _ = self.readings_tx.send(reading);
        }
    }

    fn on_timeout(&mut self) {
        let channel = &mut self.ring[self.active];
        debug!(channel = channel.id, "No reading before timeout");

        channel.decoded = UNKNOWN;

        // Report the transition to unknown once, not every round.
        if channel.last_report_ok {
            channel.last_report_ok = false;

            let reading = EncoderReading {
                channel: channel.id,
                value: UNKNOWN,
            };
            let _ = self.readings_tx.send(reading);
        }

        self.complete_cycle();
    }

    /// Advance to the next channel, or restart if a reconfiguration
    /// was waiting.
    fn complete_cycle(&mut self) {
        // The trigger must rest low before the next cycle raises it.
        if let Phase::Awaiting {
            lower_at: Some(_), ..
        } = self.phase
        {
            self.write_trigger(false);
        }

        self.phase = Phase::Idle;

        if self.pending_ring.is_some() {
            self.start();
            return;
        }

        self.active = (self.active + 1) % self.ring.len();
        self.begin_cycle();
    }
}
