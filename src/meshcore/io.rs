//! Byte pumps between OS transports and a [`CompanionLink`], and the
//! production [`Connector`].

use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::bluetooth;
use super::link::{CompanionLink, LinkOptions};
use super::{CompanionTarget, Connection, Connector, TransportKind};
use crate::error::TransportError;

pub(crate) const PUMP_DEPTH: usize = 64;

pub type BytePipe = (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>);

/// Pump any async byte stream (TCP socket, in-memory duplex) through channels.
pub fn spawn_stream_pump<S>(stream: S, cancel: CancellationToken) -> BytePipe
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(PUMP_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(PUMP_DEPTH);

    let read_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let n = tokio::select! {
                _ = read_cancel.cancelled() => break,
                n = reader.read(&mut buf) => n,
            };
            match n {
                Ok(0) => {
                    debug!("Companion stream reached EOF");
                    break;
                }
                Ok(n) => {
                    if in_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Companion stream read error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let bytes = tokio::select! {
                _ = cancel.cancelled() => break,
                bytes = out_rx.recv() => bytes,
            };
            let Some(bytes) = bytes else { break };
            if let Err(e) = writer.write_all(&bytes).await {
                warn!("Companion stream write error: {}", e);
                break;
            }
            let _ = writer.flush().await;
        }
        let _ = writer.shutdown().await;
    });

    (out_tx, in_rx)
}

/// Open a serial device and pump it from blocking threads.
#[cfg(feature = "serial")]
pub fn open_serial(
    path: &str,
    baud_rate: u32,
    cancel: CancellationToken,
) -> Result<BytePipe, TransportError> {
    use std::io::{Read, Write};

    let mut builder = serialport::new(path, baud_rate).timeout(Duration::from_millis(100));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder
        .open()
        .map_err(|e| TransportError::Unreachable(format!("failed to open {}: {}", path, e)))?;
    let _ = port.write_data_terminal_ready(true);
    let mut writer = port
        .try_clone()
        .map_err(|e| TransportError::Unreachable(format!("failed to clone {}: {}", path, e)))?;

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(PUMP_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(PUMP_DEPTH);

    let name = path.to_string();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 1024];
        while !cancel.is_cancelled() {
            match port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    if in_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Serial read error on {}: {}", name, e);
                    break;
                }
            }
        }
        debug!("Serial reader for {} stopped", name);
    });

    // Exits once the link drops its sender.
    tokio::task::spawn_blocking(move || {
        while let Some(bytes) = out_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
                warn!("Serial write error: {}", e);
                break;
            }
        }
    });

    Ok((out_tx, in_rx))
}

#[cfg(not(feature = "serial"))]
pub fn open_serial(
    path: &str,
    _baud_rate: u32,
    _cancel: CancellationToken,
) -> Result<BytePipe, TransportError> {
    Err(TransportError::Unreachable(format!(
        "serial support not compiled in; cannot open {}",
        path
    )))
}

#[cfg(feature = "ble")]
async fn open_ble(target: &CompanionTarget, cancel: CancellationToken) -> Result<BytePipe, TransportError> {
    super::ble::open(target, cancel).await
}

#[cfg(not(feature = "ble"))]
async fn open_ble(target: &CompanionTarget, _cancel: CancellationToken) -> Result<BytePipe, TransportError> {
    Err(TransportError::Unreachable(format!(
        "Bluetooth LE support not built for {} (rebuild with --features ble, or bind an rfcomm bridge and set 'device')",
        target
    )))
}

/// Opens real companion links over TCP, serial, Bluetooth LE, or an RFCOMM bridge.
#[derive(Debug, Clone, Default)]
pub struct DeviceConnector {
    options: LinkOptions,
}

impl DeviceConnector {
    pub fn new(options: LinkOptions) -> Self {
        Self { options }
    }

    async fn open_pipe(
        &self,
        target: &CompanionTarget,
        cancel: CancellationToken,
    ) -> Result<BytePipe, TransportError> {
        match target.kind {
            TransportKind::Tcp => {
                let (host, port) = target.tcp_address()?;
                let stream = timeout(
                    self.options.command_timeout,
                    TcpStream::connect((host.as_str(), port)),
                )
                .await
                .map_err(|_| TransportError::Timeout(format!("TCP connect to {}:{}", host, port)))??;
                let _ = stream.set_nodelay(true);
                Ok(spawn_stream_pump(stream, cancel))
            }
            TransportKind::Serial => {
                let path = target.serial_path().ok_or_else(|| {
                    TransportError::Unreachable(
                        "serial transport requires 'device' or 'endpoint'".into(),
                    )
                })?;
                open_serial(path, target.baud_rate, cancel)
            }
            TransportKind::Bluetooth => {
                let bridges = bluetooth::rfcomm_candidates(target);
                let mut last_error = None;
                for path in bridges {
                    match open_serial(&path, target.baud_rate, cancel.clone()) {
                        Ok(pipe) => {
                            info!("Using Bluetooth serial bridge {}", path);
                            return Ok(pipe);
                        }
                        Err(e) => {
                            warn!("Bluetooth bridge {} failed: {}", path, e);
                            last_error = Some(e);
                        }
                    }
                }
                match last_error {
                    Some(e) => Err(e),
                    None => open_ble(target, cancel).await,
                }
            }
            TransportKind::Fake => Err(TransportError::Unreachable(
                "fake transport has no radio link".into(),
            )),
        }
    }
}

#[async_trait]
impl Connector for DeviceConnector {
    async fn connect(&self, target: &CompanionTarget) -> Result<Connection, TransportError> {
        let cancel = CancellationToken::new();
        let (outbound, inbound) = self.open_pipe(target, cancel.clone()).await?;
        let (link, events) = CompanionLink::spawn(outbound, inbound, self.options.clone(), cancel);
        match link.handshake().await {
            Ok(self_info) => {
                info!("Companion {} identifies as {}", target, self_info.name);
                Ok(Connection {
                    link,
                    events,
                    self_info: Some(self_info),
                })
            }
            Err(e) => {
                use super::RadioLink;
                link.disconnect().await;
                Err(e)
            }
        }
    }

    async fn release(&self, target: &CompanionTarget) {
        if target.kind != TransportKind::Bluetooth {
            return;
        }
        for address in target.bluetooth_addresses() {
            bluetooth::disconnect_device(&address, bluetooth::DEFAULT_ADAPTER, Duration::from_secs(5))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshcore::framer::{encode_frame, CompanionFramer, APP_TO_RADIO, RADIO_TO_APP};
    use crate::meshcore::packets::fixtures::self_info_frame;
    use crate::meshcore::RadioLink;

    #[tokio::test]
    async fn stream_pump_carries_bytes_both_ways() {
        let (app_side, mut radio_side) = tokio::io::duplex(256);
        let (tx, mut rx) = spawn_stream_pump(app_side, CancellationToken::new());

        tx.send(b"<\x01\x00\x05".to_vec()).await.unwrap();
        let mut buf = [0u8; 4];
        radio_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"<\x01\x00\x05");

        radio_side.write_all(b">\x01\x00\x00").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b">\x01\x00\x00".to_vec());

        drop(radio_side);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn tcp_connector_handshakes_with_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut framer = CompanionFramer::new(APP_TO_RADIO);
            let mut buf = [0u8; 256];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                framer.push(&buf[..n]);
                while let Some(cmd) = framer.next_frame() {
                    let reply = match cmd[0] {
                        1 => self_info_frame("TCP Node"),
                        _ => vec![0],
                    };
                    sock.write_all(&encode_frame(RADIO_TO_APP, &reply)).await.unwrap();
                }
            }
        });

        let target = CompanionTarget {
            kind: TransportKind::Tcp,
            endpoint: format!("127.0.0.1:{}", port),
            device: "auto".into(),
            baud_rate: 115200,
        };
        let connection = DeviceConnector::default().connect(&target).await.unwrap();
        assert_eq!(connection.self_info.unwrap().name, "TCP Node");
        connection.link.ping().await.unwrap();
        connection.link.disconnect().await;
    }

    #[cfg(not(feature = "ble"))]
    #[tokio::test]
    async fn fake_and_unbridged_bluetooth_are_unreachable() {
        let connector = DeviceConnector::default();
        let fake = CompanionTarget {
            kind: TransportKind::Fake,
            endpoint: String::new(),
            device: "auto".into(),
            baud_rate: 115200,
        };
        assert!(matches!(
            connector.connect(&fake).await.err(),
            Some(TransportError::Unreachable(_))
        ));
        let ble = CompanionTarget {
            kind: TransportKind::Bluetooth,
            endpoint: "C0:FF:EE:00:11:22".into(),
            device: "auto".into(),
            baud_rate: 115200,
        };
        match connector.connect(&ble).await.err() {
            Some(TransportError::Unreachable(message)) => assert!(message.contains("--features ble")),
            other => panic!("expected unreachable, got {:?}", other),
        }
    }
}
