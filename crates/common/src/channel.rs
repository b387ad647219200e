//! Async channel bridge between the Tokio runtime and the USB worker thread
//!
//! The worker thread owns the native context and every open device handle.
//! Async code never touches those directly: it sends a [`UsbCommand`] and
//! awaits the oneshot reply, and it receives hotplug notices as [`UsbEvent`]s.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::{ControlSetup, DeviceInfo, DeviceKey, TransferStatus, UsbError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

/// Identifies a device handle opened by the worker on behalf of a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A transfer to run on an open session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferCommand {
    ControlIn {
        setup: ControlSetup,
        timeout_ms: u64,
    },
    ControlOut {
        setup: ControlSetup,
        data: Vec<u8>,
        timeout_ms: u64,
    },
    BulkIn {
        endpoint: u8,
        length: usize,
        timeout_ms: u64,
    },
    BulkOut {
        endpoint: u8,
        data: Vec<u8>,
        timeout_ms: u64,
    },
    InterruptIn {
        endpoint: u8,
        length: usize,
        timeout_ms: u64,
    },
    InterruptOut {
        endpoint: u8,
        data: Vec<u8>,
        timeout_ms: u64,
    },
}

/// Result of a [`TransferCommand`]
///
/// `actual_length` is reported for every status, including timeouts that
/// moved part of the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReply {
    pub status: TransferStatus,
    pub actual_length: usize,
    /// Received bytes for IN transfers, empty for OUT transfers
    pub data: Vec<u8>,
}

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// Enumerate connected devices
    ListDevices {
        response: oneshot::Sender<Result<Vec<DeviceInfo>, UsbError>>,
    },

    /// Open the device identified by `key`
    Open {
        key: DeviceKey,
        response: oneshot::Sender<Result<SessionId, UsbError>>,
    },

    /// Close a previously opened session
    Close {
        session: SessionId,
        response: oneshot::Sender<Result<(), UsbError>>,
    },

    /// Run a transfer on an open session
    Transfer {
        session: SessionId,
        transfer: TransferCommand,
        response: oneshot::Sender<Result<TransferReply, UsbError>>,
    },

    /// Close every session, dispose the context and stop the thread
    Shutdown,
}

/// Hotplug notifications from the USB thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    /// Device connected
    DeviceArrived { device: DeviceInfo },

    /// Device removed, with the sessions that were invalidated
    DeviceLeft {
        key: DeviceKey,
        closed_sessions: Vec<SessionId>,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    pub async fn list_devices(&self) -> crate::Result<Vec<DeviceInfo>> {
        let (response, rx) = oneshot::channel();
        self.send_command(UsbCommand::ListDevices { response }).await?;
        Ok(Self::reply(rx).await??)
    }

    pub async fn open(&self, key: DeviceKey) -> crate::Result<SessionId> {
        let (response, rx) = oneshot::channel();
        self.send_command(UsbCommand::Open { key, response }).await?;
        Ok(Self::reply(rx).await??)
    }

    pub async fn close(&self, session: SessionId) -> crate::Result<()> {
        let (response, rx) = oneshot::channel();
        self.send_command(UsbCommand::Close { session, response }).await?;
        Ok(Self::reply(rx).await??)
    }

    pub async fn transfer(
        &self,
        session: SessionId,
        transfer: TransferCommand,
    ) -> crate::Result<TransferReply> {
        let (response, rx) = oneshot::channel();
        self.send_command(UsbCommand::Transfer {
            session,
            transfer,
            response,
        })
        .await?;
        Ok(Self::reply(rx).await??)
    }

    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send_command(UsbCommand::Shutdown).await
    }

    async fn reply<T>(rx: oneshot::Receiver<T>) -> crate::Result<T> {
        rx.await
            .map_err(|_| crate::Error::Worker("USB worker dropped the reply".to_string()))
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    cmd_rx: Receiver<UsbCommand>,
    event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// True once every [`UsbBridge`] clone has been dropped
    pub fn is_closed(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Sender usable from native callback threads, which must never block
    pub fn event_sender(&self) -> EventSender {
        EventSender {
            tx: self.event_tx.clone(),
        }
    }
}

/// Non-blocking event sender handed to hotplug callbacks
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<UsbEvent>,
}

impl EventSender {
    /// Queue an event; a full or closed channel drops it with a warning
    pub fn notify(&self, event: UsbEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Event channel closed");
            }
        }
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_usb_bridge();

        // Spawn a thread to simulate USB worker
        let handle = std::thread::spawn(move || match worker.recv_command().unwrap() {
            UsbCommand::ListDevices { response } => {
                response.send(Ok(Vec::new())).unwrap();
                true
            }
            _ => false,
        });

        let devices = bridge.list_devices().await.unwrap();
        assert!(devices.is_empty());
        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_dropped_reply_is_worker_error() {
        let (bridge, worker) = create_usb_bridge();

        let handle = std::thread::spawn(move || {
            // Drop the command, and with it the reply sender
            let _ = worker.recv_command().unwrap();
        });

        let err = bridge.open(DeviceKey::new(1, 2, 3, 4)).await.unwrap_err();
        assert!(matches!(err, crate::Error::Worker(_)));
        handle.join().unwrap();
    }

    #[test]
    fn test_event_sender_never_blocks() {
        let (_bridge, worker) = create_usb_bridge();
        let sender = worker.event_sender();

        for address in 0..300u16 {
            sender.notify(UsbEvent::DeviceLeft {
                key: DeviceKey::new(1, 2, 1, (address % 128) as u8),
                closed_sessions: Vec::new(),
            });
        }
    }

    #[test]
    fn test_session_display() {
        assert_eq!(SessionId(7).to_string(), "session-7");
    }
}
