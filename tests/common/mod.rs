#![allow(dead_code)]

use std::time::Duration;

use color_eyre::Result;
use jerome_gateway::config::Config;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// Long enough for anything that should happen to happen.
pub const LONG: Duration = Duration::from_secs(5);

/// Long enough for anything that should not happen to show itself.
pub const SHORT: Duration = Duration::from_millis(100);

/// A loopback listener playing the device's role, for either the
/// command port or the UART port.
pub struct MockDevice {
    listener: TcpListener,
}

impl MockDevice {
    pub async fn bind() -> Result<Self> {
        Self::bind_to(0).await
    }

    /// Bind a specific port, e.g. one learned from an earlier bind.
    pub async fn bind_to(port: u16) -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(("127.0.0.1", port)).await?,
        })
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Wait for the gateway to connect.
    pub async fn accept(&self) -> Result<DeviceConnection> {
        let (stream, _) = timeout(LONG, self.listener.accept()).await??;
        let (read, write) = stream.into_split();

        Ok(DeviceConnection {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    /// Assert that the gateway does not connect within [`SHORT`].
    pub async fn expect_no_connection(&self) {
        let accepted = timeout(SHORT, self.listener.accept()).await;
        assert!(accepted.is_err(), "Expected no connection attempt");
    }
}

/// One accepted connection, driven by the test.
pub struct DeviceConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DeviceConnection {
    /// Read one `$KE` request, returning its body (`""` for a ping).
    pub async fn read_command(&mut self) -> Result<String> {
        let mut line = String::new();
        timeout(LONG, self.reader.read_line(&mut line)).await??;

        if line.is_empty() {
            return Err(color_eyre::eyre::eyre!("Connection closed"));
        }

        let line = line.trim_end_matches(['\r', '\n']);

        let body = line
            .strip_prefix("$KE")
            .ok_or_else(|| color_eyre::eyre::eyre!("Not a request: {line}"))?;

        Ok(body.strip_prefix(',').unwrap_or(body).to_owned())
    }

    /// Assert that no command arrives within the given window.
    pub async fn expect_silence_for(&mut self, window: Duration) {
        let mut byte = [0u8; 1];
        let read = timeout(window, self.reader.read(&mut byte)).await;
        assert!(read.is_err(), "Expected silence, got data");
    }

    /// Assert that no command arrives within [`SHORT`].
    pub async fn expect_silence(&mut self) {
        self.expect_silence_for(SHORT).await;
    }

    /// Read whatever raw bytes arrive next. Empty on a closed
    /// connection.
    pub async fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let mut buffer = [0u8; 64];
        let n = timeout(LONG, self.reader.read(&mut buffer)).await??;

        Ok(buffer[..n].to_vec())
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;

        Ok(())
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await?;

        Ok(())
    }

    pub async fn reply_ok(&mut self) -> Result<()> {
        self.send_line("#OK").await
    }

    pub async fn reply_err(&mut self) -> Result<()> {
        self.send_line("#ERR").await
    }

    /// Serve the connection handshake, asserting the command order.
    ///
    /// `EVT,ON` is answered with `#EVT,OK`, which the gateway must
    /// treat as a terminal reply, not an event; the handshake would
    /// stall on a response timeout otherwise.
    pub async fn handshake(&mut self, directions: &str, states: &str) -> Result<()> {
        assert_eq!(self.read_command().await?, "");
        self.reply_ok().await?;

        assert_eq!(self.read_command().await?, "PSW,SET,Jerome");
        self.send_line("#PSW,SET,OK").await?;

        assert_eq!(self.read_command().await?, "EVT,ON");
        self.send_line("#EVT,OK").await?;

        assert_eq!(self.read_command().await?, "IO,GET,ALL");
        self.send_line(&format!("#IO,GET,ALL,{directions}"))
            .await?;

        assert_eq!(self.read_command().await?, "RID,ALL");
        self.send_line(&format!("#RID,ALL,{states}")).await?;

        Ok(())
    }

    /// Turn the connection into a task which acknowledges every
    /// command and forwards the received bodies for inspection.
    ///
    /// Sending on the returned kill switch (or dropping it) closes
    /// the connection.
    pub fn autorespond(self) -> (mpsc::UnboundedReceiver<String>, oneshot::Sender<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let mut connection = self;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut kill_rx => break,
                    read = connection.read_command() => {
                        let Ok(body) = read else { break };

                        let reply = match body.as_str() {
                            "IO,GET,ALL" => "#IO,GET,ALL,0000000000000000".to_owned(),
                            "RID,ALL" => "#RID,ALL,0000000000000000".to_owned(),
                            "EVT,ON" => "#EVT,OK".to_owned(),
                            _ => "#OK".to_owned(),
                        };

                        if connection.send_line(&reply).await.is_err() {
                            break;
                        }

                        let _ = commands_tx.send(body);
                    }
                }
            }
        });

        (commands_rx, kill_tx)
    }
}

/// A config pointing at loopback mocks instead of a real device.
pub fn test_config(command_port: u16) -> Config {
    let mut config = Config::example();
    config.host = "127.0.0.1".into();
    config.command_port = command_port;
    config.uart = false;
    config.line_modes = vec![];
    config.polling = None;

    config
}

/// Encode a 10-bit value the way the encoder hardware does:
/// reflected Gray code split into a high byte (bit 7 set, upper
/// five Gray bits) and a low byte (bit 6 set, lower five).
pub fn encode_reading(value: u16) -> [u8; 2] {
    assert!(value < 1024);
    let gray = value ^ (value >> 1);

    [0x80 | (gray >> 5) as u8, 0x40 | (gray & 0x1f) as u8]
}
