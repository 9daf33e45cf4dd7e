use std::path::Path;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{error::Error, modes::LineMode};

fn default_command_port() -> u16 {
    2424
}

fn default_uart_port() -> u16 {
    2525
}

fn default_passphrase() -> String {
    "Jerome".into()
}

fn default_trigger_delay_ms() -> u64 {
    20
}

fn default_answer_timeout_ms() -> u64 {
    250
}

/// A declarative mode for one digital line, applied at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLineMode {
    /// 1-indexed line number.
    pub line: usize,

    /// The mode to enforce.
    pub mode: LineMode,
}

/// Which encoder channels to poll, and how fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// The digital line pulsed to latch a reading.
    pub trigger_line: usize,

    /// Encoder channel ids, polled round-robin in this order.
    pub channels: Vec<u8>,

    /// Delay between raising the trigger, requesting the reading and
    /// lowering the trigger again.
    #[serde(default = "default_trigger_delay_ms")]
    pub trigger_delay_ms: u64,

    /// How long to wait for a reading before giving up on the
    /// channel for this round.
    #[serde(default = "default_answer_timeout_ms")]
    pub answer_timeout_ms: u64,
}

/// The configuration used for running the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of the device.
    pub host: String,

    /// TCP port of the command connection.
    #[serde(default = "default_command_port")]
    pub command_port: u16,

    /// TCP port of the UART tunnel.
    #[serde(default = "default_uart_port")]
    pub uart_port: u16,

    /// Passphrase sent during the connection handshake.
    #[serde(default = "default_passphrase")]
    pub passphrase: String,

    /// Whether to open the UART tunnel after the passphrase exchange.
    pub uart: bool,

    /// If set, the last UART payload is rewritten at this interval.
    #[serde(default)]
    pub uart_repeat_interval_ms: Option<u64>,

    /// Modes to enforce on digital lines.
    #[serde(default)]
    pub line_modes: Vec<ConfigLineMode>,

    /// Encoder polling, if any.
    #[serde(default)]
    pub polling: Option<PollingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self::example()
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Panics if the input is not valid .ron.
    pub fn deserialize(input: &str) -> Self {
        Self::ron().from_str::<Config>(input).unwrap()
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            host: "192.168.0.101".into(),
            command_port: default_command_port(),
            uart_port: default_uart_port(),
            passphrase: default_passphrase(),
            uart: true,
            uart_repeat_interval_ms: None,
            line_modes: vec![ConfigLineMode {
                line: 13,
                mode: LineMode::Out,
            }],
            polling: Some(PollingConfig {
                trigger_line: 13,
                channels: vec![1],
                trigger_delay_ms: default_trigger_delay_ms(),
                answer_timeout_ms: default_answer_timeout_ms(),
            }),
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap()
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Self {
        let s = std::fs::read_to_string(p).unwrap();

        Self::deserialize(&s)
    }

    fn check_host(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::BadConfig("The device host must be set.".into()));
        }

        Ok(())
    }

    fn check_line_numbers(&self) -> Result<(), Error> {
        // Lines are 1-indexed on the device.
        for config_mode in &self.line_modes {
            if config_mode.line == 0 {
                return Err(Error::BadConfig(
                    "Line numbers are 1-indexed; line 0 does not exist.".into(),
                ));
            }
        }

        if let Some(polling) = &self.polling {
            if polling.trigger_line == 0 {
                return Err(Error::BadConfig(
                    "Line numbers are 1-indexed; trigger line 0 does not exist.".into(),
                ));
            }
        }

        Ok(())
    }

    fn check_duplicate_line_modes(&self) -> Result<(), Error> {
        let duplicates = self
            .line_modes
            .iter()
            .map(|config_mode| config_mode.line)
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "A line can only be in one mode. Duplicates: {duplicates:?}"
            )))
        }
    }

    fn check_polling(&self) -> Result<(), Error> {
        let Some(polling) = &self.polling else {
            return Ok(());
        };

        if polling.channels.is_empty() {
            return Err(Error::BadConfig(
                "Polling is enabled but no encoder channels are listed.".into(),
            ));
        }

        let duplicates = polling.channels.iter().duplicates().collect::<Vec<_>>();
        if !duplicates.is_empty() {
            return Err(Error::BadConfig(format!(
                "Encoder channels must be unique. Duplicates: {duplicates:?}"
            )));
        }

        Ok(())
    }

    /// Check the configuration for inconsistencies.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_host()?;
        self.check_line_numbers()?;
        self.check_duplicate_line_modes()?;
        self.check_polling()?;

        Ok(())
    }
}
