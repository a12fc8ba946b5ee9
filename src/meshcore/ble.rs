//! Bluetooth LE companion link over the Nordic UART service.
//!
//! The radio exchanges bare companion payloads, one per GATT write or
//! notification. The pumps add and strip the serial frame header so the same
//! [`CompanionLink`](super::link::CompanionLink) runs on top.

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::bluetooth;
use super::framer::{encode_frame, frame_payload, APP_TO_RADIO, RADIO_TO_APP};
use super::io::{BytePipe, PUMP_DEPTH};
use super::CompanionTarget;
use crate::error::TransportError;

pub const NUS_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Written by the app.
pub const NUS_RX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Notified by the radio.
pub const NUS_TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

const SCAN_WINDOW: Duration = Duration::from_secs(10);
const SCAN_POLL: Duration = Duration::from_millis(500);

/// Scan for the companion `target` names, connect, and pump its UART.
pub async fn open(target: &CompanionTarget, cancel: CancellationToken) -> Result<BytePipe, TransportError> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::Unreachable("no Bluetooth adapter".into()))?;

    let peripheral = find_companion(&adapter, target, &cancel).await?;
    peripheral.connect().await?;
    if let Err(e) = peripheral.discover_services().await {
        let _ = peripheral.disconnect().await;
        return Err(e.into());
    }

    let characteristics = peripheral.characteristics();
    let rx = characteristics.iter().find(|c| c.service_uuid == NUS_SERVICE && c.uuid == NUS_RX).cloned();
    let tx = characteristics.iter().find(|c| c.service_uuid == NUS_SERVICE && c.uuid == NUS_TX).cloned();
    let (Some(rx), Some(tx)) = (rx, tx) else {
        let _ = peripheral.disconnect().await;
        return Err(TransportError::Unreachable(format!(
            "{} has no Nordic UART service",
            target
        )));
    };
    peripheral.subscribe(&tx).await?;
    let mut notifications = peripheral.notifications().await?;

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(PUMP_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(PUMP_DEPTH);

    let read_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let notification = tokio::select! {
                _ = read_cancel.cancelled() => break,
                n = notifications.next() => n,
            };
            let Some(notification) = notification else {
                debug!("Bluetooth notification stream ended");
                break;
            };
            if notification.uuid != NUS_TX || notification.value.is_empty() {
                continue;
            }
            if in_tx
                .send(encode_frame(RADIO_TO_APP, &notification.value))
                .await
                .is_err()
            {
                break;
            }
        }
        // A dead notification stream means the link is gone.
        read_cancel.cancel();
    });

    tokio::spawn(async move {
        loop {
            let bytes = tokio::select! {
                _ = cancel.cancelled() => break,
                bytes = out_rx.recv() => bytes,
            };
            let Some(bytes) = bytes else { break };
            let Some(payload) = frame_payload(APP_TO_RADIO, &bytes) else {
                warn!("Dropping malformed outbound frame ({} bytes)", bytes.len());
                continue;
            };
            if let Err(e) = peripheral.write(&rx, payload, WriteType::WithResponse).await {
                warn!("Bluetooth write error: {}", e);
                break;
            }
        }
        cancel.cancel();
        if let Err(e) = peripheral.disconnect().await {
            debug!("Bluetooth disconnect: {}", e);
        }
    });

    Ok((out_tx, in_rx))
}

async fn find_companion(
    adapter: &Adapter,
    target: &CompanionTarget,
    cancel: &CancellationToken,
) -> Result<Peripheral, TransportError> {
    adapter.start_scan(ScanFilter::default()).await?;
    let deadline = Instant::now() + SCAN_WINDOW;
    let found = loop {
        if let Some(peripheral) = scan_once(adapter, target).await? {
            break Some(peripheral);
        }
        if Instant::now() >= deadline {
            break None;
        }
        tokio::select! {
            _ = cancel.cancelled() => break None,
            _ = sleep(SCAN_POLL) => {}
        }
    };
    let _ = adapter.stop_scan().await;
    found.ok_or_else(|| TransportError::Unreachable(format!("no advertising companion for {}", target)))
}

async fn scan_once(adapter: &Adapter, target: &CompanionTarget) -> Result<Option<Peripheral>, TransportError> {
    for peripheral in adapter.peripherals().await? {
        let Some(properties) = peripheral.properties().await? else {
            continue;
        };
        let address = properties.address.to_string();
        if bluetooth::ble_candidate_matches(target, &address, properties.local_name.as_deref()) {
            info!(
                "Found Bluetooth companion {} ({})",
                properties.local_name.as_deref().unwrap_or("unnamed"),
                address
            );
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}
