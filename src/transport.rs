//! Transport Abstraction (spec §4.2): a byte stream with push-style reads and
//! asynchronous writes, opaque to frame content. Two variants: a real serial
//! port (`SerialTransport`, via `tokio-serial`) and a prerecorded capture
//! replay (`ReplayTransport`) used for offline testing and demos.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, warn};

/// Opaque endpoint selector (spec §3 `TransportEndpoint`). The core never
/// interprets the fields beyond what's needed to open the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportEndpoint {
    Serial { port_name: String, baud_rate: u32 },
    Replay { capture_path: PathBuf, speed: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Disconnected,
    IoError,
    Timeout,
}

/// Events pushed from the transport's background task to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Data(Vec<u8>),
    Error(TransportErrorKind, String),
}

/// A byte-stream transport. The core owns exactly one instance exclusively
/// (spec §5): only the client task calls `write`/`close`, and only the client
/// task drains the event channel returned by `open`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(endpoint: &TransportEndpoint) -> std::io::Result<(Self, mpsc::Receiver<TransportEvent>)>
    where
        Self: Sized;

    async fn write(&self, bytes: &[u8]) -> std::io::Result<()>;

    async fn close(&mut self);
}

/// Real serial-port transport.
pub struct SerialTransport {
    writer: tokio::sync::Mutex<Box<dyn tokio_serial::SerialPort>>,
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(
        endpoint: &TransportEndpoint,
    ) -> std::io::Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let (port_name, baud_rate) = match endpoint {
            TransportEndpoint::Serial {
                port_name,
                baud_rate,
            } => (port_name.clone(), *baud_rate),
            TransportEndpoint::Replay { .. } => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "SerialTransport cannot open a Replay endpoint",
                ))
            }
        };

        let mut port = tokio_serial::new(&port_name, baud_rate).open_native_async()?;
        let read_half = port.try_clone_native()?.open_native_async()?;
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let mut port = read_half;
            let mut buf = [0u8; 1024];
            loop {
                match port.read(&mut buf).await {
                    Ok(0) => {
                        let _ = tx
                            .send(TransportEvent::Error(
                                TransportErrorKind::Disconnected,
                                "serial port closed".into(),
                            ))
                            .await;
                        break;
                    }
                    Ok(n) => {
                        if tx.send(TransportEvent::Data(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("serial read error: {e}");
                        let _ = tx
                            .send(TransportEvent::Error(TransportErrorKind::IoError, e.to_string()))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                writer: tokio::sync::Mutex::new(Box::new(port)),
            },
            rx,
        ))
    }

    async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(bytes)
    }

    async fn close(&mut self) {
        // Dropping the boxed `SerialPort` closes the underlying fd/handle.
    }
}

/// Replays a prerecorded capture file's inbound bytes at `speed`x real time.
/// Writes are accepted and discarded, matching spec §4.2.
pub struct ReplayTransport {
    stop: tokio::sync::watch::Sender<bool>,
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn open(
        endpoint: &TransportEndpoint,
    ) -> std::io::Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let (capture_path, speed) = match endpoint {
            TransportEndpoint::Replay {
                capture_path,
                speed,
            } => (capture_path.clone(), speed.max(0.001)),
            TransportEndpoint::Serial { .. } => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "ReplayTransport cannot open a Serial endpoint",
                ))
            }
        };

        let data = tokio::fs::read(&capture_path).await?;
        let (tx, rx) = mpsc::channel(256);
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            // Replay in small chunks so downstream decoders see the same kind
            // of arbitrary-boundary traffic a real serial port produces.
            const CHUNK: usize = 64;
            let inter_chunk_delay = Duration::from_millis((10.0 / speed) as u64);
            for chunk in data.chunks(CHUNK) {
                if *stop_rx.borrow() {
                    return;
                }
                if tx.send(TransportEvent::Data(chunk.to_vec())).await.is_err() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(inter_chunk_delay) => {}
                    _ = stop_rx.changed() => return,
                }
            }
            warn!("replay capture exhausted");
            let _ = tx
                .send(TransportEvent::Error(
                    TransportErrorKind::Disconnected,
                    "replay capture exhausted".into(),
                ))
                .await;
        });

        Ok((Self { stop: stop_tx }, rx))
    }

    async fn write(&self, _bytes: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.stop.send(true);
    }
}
