use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// The prefix every request carries.
const REQUEST_PREFIX: &str = "$KE";

/// A received line, classified.
///
/// The device interleaves three kinds of lines on the command
/// connection: banner/diagnostic chatter, unsolicited line-state
/// events, and the terminal reply to the command in flight.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Line {
    /// `SLINF`/`FLAGS`/`JConfig` chatter. Discarded.
    Info,

    /// An unsolicited `EVT,<line>,<state>` notification.
    ///
    /// The state is `None` when the device sent something other than
    /// `0`/`1`; such events are delivered but must not touch the
    /// state cache.
    Event {
        /// 1-indexed line number.
        line: usize,
        /// The reported logical state, if it was binary.
        state: Option<bool>,
    },

    /// The terminal reply to the in-flight command, with `#` and
    /// line endings already stripped.
    Terminal(String),
}

impl Line {
    /// Classify one cleaned-up line.
    pub fn classify(data: &str) -> Self {
        if data.starts_with("SLINF") || data.starts_with("FLAGS") || data.starts_with("JConfig") {
            return Line::Info;
        }

        // `EVT,OK` is the terminal reply to `EVT,ON`, not an event.
        if data.starts_with("EVT") && data != "EVT,OK" {
            let mut fields = data.rsplit(',');
            let state = fields.next();
            let line = fields.next().and_then(|field| field.parse::<usize>().ok());

            return match (line, state) {
                (Some(line), Some(state)) => Line::Event {
                    line,
                    state: match state {
                        "1" => Some(true),
                        "0" => Some(false),
                        _ => None,
                    },
                },
                // Nothing useful to extract. Treat as chatter.
                _ => Line::Info,
            };
        }

        Line::Terminal(data.to_owned())
    }
}

/// A parsed terminal reply.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Reply {
    /// The device acknowledged the command.
    Ok,

    /// The device rejected the command.
    Err,

    /// Any other reply, stripped to its last comma-field.
    ///
    /// E.g. `RID,ALL,101010` yields `101010`.
    Value(String),
}

impl Reply {
    /// Parse a terminal payload.
    ///
    /// The device prefixes most replies with the command it is
    /// answering (`WR,OK`, `PSW,SET,OK`), so classification happens
    /// after stripping to the last comma-field.
    pub fn parse(payload: &str) -> Self {
        match payload.rsplit(',').next().unwrap_or(payload) {
            "OK" => Reply::Ok,
            "ERR" => Reply::Err,
            value => Reply::Value(value.to_owned()),
        }
    }

    /// Whether this is an acknowledgement.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok)
    }
}

/// Codec for the device's command connection.
///
/// Decoding yields classified [`Line`]s: the raw stream is split on
/// newlines, `#` characters are dropped and the trailing `\r` is
/// trimmed. Encoding frames a command body as
/// `$KE[,<body>]\r\n`; an empty body is the keepalive ping.
#[derive(Debug, Default)]
pub struct CommandCodec {
    /// How far we have looked for a newline into the buffer.
    cursor: usize,
}

impl Decoder for CommandCodec {
    type Item = Line;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();

        let look_at = &src[self.cursor..read_to];

        if let Some(position) = look_at.iter().position(|&byte| byte == b'\n') {
            // Since we might "start late" in the buffer (from the cursor),
            // the "global" position within the buffer has to be calculated.
            let actual_position = self.cursor + position;

            // Next time we need to start over.
            self.cursor = 0;

            let line = src.split_to(actual_position);

            // Discard the newline by advancing the source buffer beyond it.
            src.advance(1);

            let cleaned: String = String::from_utf8_lossy(&line)
                .chars()
                .filter(|&ch| ch != '#' && ch != '\r')
                .collect();

            Ok(Some(Line::classify(&cleaned)))
        } else {
            // No full line yet; remember how far we looked.
            self.cursor = read_to;

            Ok(None)
        }
    }
}

impl Encoder<String> for CommandCodec {
    type Error = Error;

    fn encode(&mut self, body: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(REQUEST_PREFIX.as_bytes());

        if !body.is_empty() {
            dst.extend_from_slice(b",");
            dst.extend_from_slice(body.as_bytes());
        }

        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}
