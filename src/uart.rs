use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// A deadline far enough away to stand in for "no deadline".
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

/// A handle to a running UART tunnel task.
///
/// Dropping the handle does not stop the task; call
/// [`UartHandle::shutdown`]. The controller does so whenever its own
/// connection dies, which is what keeps the tunnel's lifecycle
/// slaved to the command connection.
pub(crate) struct UartHandle {
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl UartHandle {
    /// Write raw bytes to the tunnel.
    /// Dropped silently while the tunnel is between connections.
    pub(crate) fn send(&self, payload: Vec<u8>) {
        let _ = self.outbox.send(payload);
    }

    /// Stop the tunnel task and close its connection.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Spawn a tunnel task. It connects to the device's UART port,
/// retrying indefinitely until shut down, and broadcasts whatever
/// arrives (minus null bytes) on `data_tx`.
pub(crate) fn spawn(
    host: String,
    port: u16,
    repeat_interval: Option<Duration>,
    data_tx: broadcast::Sender<Vec<u8>>,
) -> UartHandle {
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let span = info_span!("uart", %host);

    let tunnel = UartTunnel {
        host,
        port,
        repeat_interval,
        data_tx,
        outbox: outbox_rx,
        cancel: cancel.clone(),
        last_payload: vec![],
    };

    tokio::spawn(async move { tunnel.run().await }.instrument(span));

    UartHandle {
        outbox: outbox_tx,
        cancel,
    }
}

enum Served {
    Disconnected,
    Cancelled,
}

struct UartTunnel {
    host: String,
    port: u16,

    /// If set, the last payload is rewritten at this interval.
    repeat_interval: Option<Duration>,

    data_tx: broadcast::Sender<Vec<u8>>,
    outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,

    last_payload: Vec<u8>,
}

impl UartTunnel {
    async fn run(mut self) {
        loop {
            let Some(mut stream) = self.establish().await else {
                debug!("UART tunnel shut down");
                return;
            };

            info!("UART connected");

            match self.serve(&mut stream).await {
                Served::Disconnected => {
                    warn!("UART connection lost");
                    // Loop around and reconnect; the controller
                    // cancels us if its own connection is gone.
                }
                Served::Cancelled => {
                    debug!("UART tunnel shut down");
                    return;
                }
            }
        }
    }

    async fn establish(&mut self) -> Option<TcpStream> {
        loop {
            let connect = TcpStream::connect((self.host.clone(), self.port));

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = connect => match result {
                    Ok(stream) => return Some(stream),
                    Err(e) => warn!(%e, "Error connecting UART, retrying"),
                },
                // Writes have nowhere to go without a session.
                Some(payload) = self.outbox.recv() => {
                    debug!(bytes = payload.len(), "UART payload dropped, no session");
                },
            }
        }
    }

    async fn serve(&mut self, stream: &mut TcpStream) -> Served {
        let mut buffer = [0u8; 1024];
        let mut repeat_at = self.repeat_interval.map(|interval| Instant::now() + interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Served::Cancelled,
                read = stream.read(&mut buffer) => match read {
                    Ok(0) => return Served::Disconnected,
                    Ok(n) => self.deliver(&buffer[..n]),
                    Err(e) => {
                        warn!(%e, "UART read error");
                        return Served::Disconnected;
                    }
                },
                Some(payload) = self.outbox.recv() => {
                    trace!(bytes = payload.len(), "UART write");

                    if stream.write_all(&payload).await.is_err() {
                        return Served::Disconnected;
                    }

                    self.last_payload = payload;

                    if let Some(interval) = self.repeat_interval {
                        repeat_at = Some(Instant::now() + interval);
                    }
                },
                _ = sleep_until(repeat_at.unwrap_or_else(far_future)), if repeat_at.is_some() => {
                    if !self.last_payload.is_empty() {
                        trace!("UART repeat");

                        if stream.write_all(&self.last_payload).await.is_err() {
                            return Served::Disconnected;
                        }
                    }

                    if let Some(interval) = self.repeat_interval {
                        repeat_at = Some(Instant::now() + interval);
                    }
                },
            }
        }
    }

    /// Drop null bytes and fan the rest out. Empty leftovers are not
    /// delivered.
    fn deliver(&self, bytes: &[u8]) {
        let filtered: Vec<u8> = bytes.iter().copied().filter(|&byte| byte != 0).collect();

        if filtered.is_empty() {
            return;
        }

        trace!(bytes = filtered.len(), "UART data");

        // No subscribers is fine.
        let _ = self.data_tx.send(filtered);
    }
}
