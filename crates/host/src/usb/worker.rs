//! USB worker thread
//!
//! Dedicated thread that owns the [`Context`] and every device handle opened
//! on behalf of async callers. Commands arrive over the [`UsbWorker`] end of
//! the channel bridge; hotplug callbacks only queue events for this thread,
//! which turns them into [`UsbEvent`]s.

use super::context::Context;
use super::handle::DeviceHandle;
use super::hotplug::{HotplugEvent, HotplugRegistration};
use super::manager::{EnumerationPolicy, describe, enumerate, find_device, open_by_key};
use super::transfers::TransferRequest;
use crate::native::{HotplugEventKind, HotplugFilter};
use common::{EventSender, SessionId, TransferCommand, TransferReply, UsbCommand, UsbEvent, UsbWorker};
use protocol::{DeviceKey, Result, UsbError};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long the loop waits for a hotplug event before polling commands again
const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct Session {
    key: DeviceKey,
    handle: DeviceHandle,
}

/// USB worker thread state
pub struct UsbWorkerThread {
    context: Context,
    policy: EnumerationPolicy,
    worker: UsbWorker,
    events: EventSender,
    sessions: HashMap<SessionId, Session>,
    next_session: u32,
    hotplug_rx: Receiver<HotplugEvent>,
    hotplug: Option<HotplugRegistration>,
}

impl UsbWorkerThread {
    /// Take ownership of `context` and subscribe to its hotplug events
    ///
    /// Platforms without hotplug support still get a working worker; device
    /// changes are simply not reported.
    pub fn new(worker: UsbWorker, context: Context, policy: EnumerationPolicy) -> Result<Self> {
        let (hotplug_tx, hotplug_rx) = mpsc::channel();
        let hotplug = match context.register_hotplug(HotplugFilter::default(), move |event| {
            // The worker may already be gone during shutdown
            let _ = hotplug_tx.send(event);
        }) {
            Ok(registration) => Some(registration),
            Err(UsbError::NotSupported) => {
                info!("Hotplug is not supported here; device changes will not be reported");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            context,
            policy,
            events: worker.event_sender(),
            worker,
            sessions: HashMap::new(),
            next_session: 1,
            hotplug_rx,
            hotplug,
        })
    }

    /// Serve commands until `Shutdown` arrives or every bridge is dropped
    pub fn run(mut self) {
        info!("USB worker thread started");

        loop {
            let closed = self.worker.is_closed();
            let mut shutdown = false;
            while let Some(cmd) = self.worker.try_recv_command() {
                if matches!(cmd, UsbCommand::Shutdown) {
                    shutdown = true;
                    break;
                }
                self.handle_command(cmd);
            }
            if shutdown {
                info!("USB worker shutting down");
                break;
            }
            if closed {
                info!("USB bridge dropped, worker shutting down");
                break;
            }

            match self.hotplug_rx.recv_timeout(POLL_INTERVAL) {
                Ok(event) => self.handle_hotplug(event),
                Err(RecvTimeoutError::Timeout) => {}
                // No hotplug registration
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(POLL_INTERVAL),
            }
        }

        self.shutdown();
        info!("USB worker thread stopped");
    }

    fn shutdown(&mut self) {
        for (session, entry) in self.sessions.drain() {
            debug!("Closing {} ({})", session, entry.key);
            entry.handle.dispose();
        }
        if let Some(registration) = self.hotplug.take()
            && let Err(e) = self.context.deregister_hotplug(&registration)
        {
            warn!("Failed to deregister hotplug callback: {}", e);
        }
        self.context.dispose();
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: UsbCommand) {
        // Wrap in catch_unwind to prevent panics from crashing the USB thread
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let result = enumerate(&self.context, &self.policy);
                if let Ok(devices) = &result {
                    debug!("Listing {} devices", devices.len());
                }
                let _ = response.send(result);
            }

            UsbCommand::Open { key, response } => {
                debug!("Opening device {}", key);
                let result = open_by_key(&self.context, &key).map(|handle| {
                    let session = self.next_session();
                    self.sessions.insert(session, Session { key, handle });
                    info!("Opened {} as {}", key, session);
                    session
                });
                let _ = response.send(result);
            }

            UsbCommand::Close { session, response } => {
                let result = match self.sessions.remove(&session) {
                    Some(entry) => {
                        entry.handle.dispose();
                        info!("Closed {} ({})", session, entry.key);
                        Ok(())
                    }
                    None => Err(UsbError::NotFound),
                };
                let _ = response.send(result);
            }

            UsbCommand::Transfer {
                session,
                transfer,
                response,
            } => {
                let result = match self.sessions.get(&session) {
                    Some(entry) => run_transfer(&entry.handle, transfer),
                    None => {
                        warn!("Transfer for unknown {}", session);
                        Err(UsbError::NotFound)
                    }
                };
                let _ = response.send(result);
            }

            // Handled by the run loop before dispatch
            UsbCommand::Shutdown => {}
        }
    }

    fn handle_hotplug(&mut self, event: HotplugEvent) {
        match event.kind {
            HotplugEventKind::Arrived => {
                let (Some(descriptor), Some(key)) = (event.descriptor, event.key()) else {
                    return;
                };
                if !self.policy.allows(&descriptor) {
                    debug!("Ignoring arrival of {}", key);
                    return;
                }
                match self.describe_key(&key) {
                    Ok(Some(device)) => self.events.notify(UsbEvent::DeviceArrived { device }),
                    Ok(None) => debug!("{} left before it could be described", key),
                    Err(e) => warn!("Failed to describe arrived device {}: {}", key, e),
                }
            }
            HotplugEventKind::Left => {
                // Bus and address are enough; the descriptor may be gone
                let mut closed: Vec<(SessionId, DeviceKey)> = self
                    .sessions
                    .iter()
                    .filter(|(_, entry)| event.concerns(&entry.key))
                    .map(|(session, entry)| (*session, entry.key))
                    .collect();
                closed.sort_by_key(|(session, _)| session.0);

                for (session, key) in &closed {
                    if let Some(entry) = self.sessions.remove(session) {
                        entry.handle.dispose();
                        info!("Closed {} after {} left", session, key);
                    }
                }

                let key = event.key().or_else(|| closed.first().map(|(_, key)| *key));
                let Some(key) = key else {
                    debug!(
                        "Unidentified device left bus {} address {}",
                        event.bus_number, event.address
                    );
                    return;
                };
                let allowed = event.descriptor.is_some_and(|d| self.policy.allows(&d));
                if allowed || !closed.is_empty() {
                    self.events.notify(UsbEvent::DeviceLeft {
                        key,
                        closed_sessions: closed.into_iter().map(|(session, _)| session).collect(),
                    });
                }
            }
        }
    }

    fn describe_key(&self, key: &DeviceKey) -> Result<Option<protocol::DeviceInfo>> {
        let list = self.context.devices()?;
        let result = match find_device(&list, key)? {
            Some(device) => describe(&device, self.policy.read_strings).map(Some),
            None => Ok(None),
        };
        list.dispose();
        result
    }

    fn next_session(&mut self) -> SessionId {
        let session = SessionId(self.next_session);
        self.next_session = self.next_session.wrapping_add(1).max(1);
        session
    }
}

fn run_transfer(handle: &DeviceHandle, transfer: TransferCommand) -> Result<TransferReply> {
    let timeout = |ms: u64| {
        if ms == 0 {
            handle.default_timeout()
        } else {
            Duration::from_millis(ms)
        }
    };

    let request = match transfer {
        TransferCommand::ControlIn { setup, timeout_ms } => {
            TransferRequest::control_in(setup, timeout(timeout_ms))?
        }
        TransferCommand::ControlOut {
            setup,
            data,
            timeout_ms,
        } => TransferRequest::control_out(setup, &data, timeout(timeout_ms))?,
        TransferCommand::BulkIn {
            endpoint,
            length,
            timeout_ms,
        } => TransferRequest::bulk_in(endpoint, length, timeout(timeout_ms))?,
        TransferCommand::BulkOut {
            endpoint,
            data,
            timeout_ms,
        } => TransferRequest::bulk_out(endpoint, &data, timeout(timeout_ms))?,
        TransferCommand::InterruptIn {
            endpoint,
            length,
            timeout_ms,
        } => TransferRequest::interrupt_in(endpoint, length, timeout(timeout_ms))?,
        TransferCommand::InterruptOut {
            endpoint,
            data,
            timeout_ms,
        } => TransferRequest::interrupt_out(endpoint, &data, timeout(timeout_ms))?,
    };

    let outcome = handle.transfer(request)?;
    Ok(TransferReply {
        status: outcome.status,
        actual_length: outcome.actual_length,
        data: outcome.data,
    })
}

/// Spawn the USB worker thread
///
/// The thread owns `context` and runs until a Shutdown command arrives or
/// every [`UsbBridge`](common::UsbBridge) clone is dropped.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    context: Context,
    policy: EnumerationPolicy,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || match UsbWorkerThread::new(worker, context, policy) {
            Ok(thread) => thread.run(),
            Err(e) => error!("Failed to start USB worker: {}", e),
        })
}
