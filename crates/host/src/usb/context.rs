//! Native driver session
//!
//! A [`Context`] owns its native context, every [`DeviceList`] taken from it
//! and every hotplug registration made on it. Device handles keep the shared
//! state alive on their own so they can outlive the context wrapper.
//!
//! # Locking
//!
//! `state` is a reader/writer lock: enumeration, descriptor queries and
//! transfers take the read side; open, close and every dispose take the
//! write side. Lock order is context state, then list state, then handle
//! state.
//!
//! # Teardown
//!
//! Disposal flips the flag first, so every later operation fails with
//! `AlreadyDisposed`. Lists and hotplug registrations are released next.
//! Native exit follows immediately when no handle is open; otherwise it is
//! deferred until the last handle closes.

use super::device::{DeviceList, ListShared};
use super::hotplug::HotplugSlot;
use crate::native::{LibusbBackend, NativeContext, NativeHotplug, NativeOption, UsbBackend};
use common::{HostConfig, TransferMode};
use protocol::{Result, UsbError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-context settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    /// Forwarded to the native layer when non-zero (0..=4)
    pub native_log_level: u8,
    /// Used by callers that do not pick a timeout themselves
    pub default_timeout: Duration,
    /// How the convenience transfer methods reach the device
    pub transfer_mode: TransferMode,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            native_log_level: 0,
            default_timeout: Duration::from_secs(5),
            transfer_mode: TransferMode::Bridge,
        }
    }
}

impl ContextOptions {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            native_log_level: config.usb.native_log_level,
            default_timeout: config.default_timeout(),
            transfer_mode: config.transfers.mode,
        }
    }
}

pub(crate) struct CtxState {
    /// `None` once native exit has run (or been claimed by whoever runs it)
    native: Option<NativeContext>,
    disposed: bool,
    /// Set while dispose releases children outside the write lock
    tearing_down: bool,
    open_handles: usize,
}

impl CtxState {
    /// The native context, if operations may still use it
    pub(crate) fn live(&self) -> Result<NativeContext> {
        if self.disposed {
            return Err(UsbError::disposed("context"));
        }
        self.native.ok_or_else(|| UsbError::disposed("context"))
    }

    /// The native context while it has not exited, disposed or not
    pub(crate) fn native(&self) -> Option<NativeContext> {
        self.native
    }

    pub(crate) fn handle_opened(&mut self) {
        self.open_handles += 1;
    }

    /// Returns the native context when this was the last handle keeping a
    /// disposed context alive; the caller must then run native exit
    pub(crate) fn handle_closed(&mut self) -> Option<NativeContext> {
        self.open_handles = self.open_handles.saturating_sub(1);
        if self.disposed && !self.tearing_down && self.open_handles == 0 {
            self.native.take()
        } else {
            None
        }
    }
}

pub(crate) struct ContextShared {
    pub(crate) backend: Arc<dyn UsbBackend>,
    pub(crate) options: ContextOptions,
    state: RwLock<CtxState>,
    lists: Mutex<Vec<Weak<ListShared>>>,
    hotplugs: Mutex<Vec<(NativeHotplug, Arc<HotplugSlot>)>>,
}

impl ContextShared {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, CtxState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, CtxState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn lists(&self) -> MutexGuard<'_, Vec<Weak<ListShared>>> {
        self.lists.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn hotplugs(&self) -> MutexGuard<'_, Vec<(NativeHotplug, Arc<HotplugSlot>)>> {
        self.hotplugs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run native exit and surface anything the native layer still held
    pub(crate) fn finish_exit(&self, native: NativeContext) {
        let report = self.backend.exit(native);
        if report.is_clean() {
            debug!("Native context exited cleanly");
        } else {
            warn!(
                "Native context exited with {} device reference(s) and {} open handle(s) outstanding",
                report.referenced_devices, report.open_handles
            );
        }
    }
}

/// One session with the native USB driver
///
/// Dropping the context disposes it.
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    pub fn new(backend: Arc<dyn UsbBackend>, options: ContextOptions) -> Result<Self> {
        let native = backend.init()?;
        if options.native_log_level > 0
            && let Err(e) =
                backend.set_option(native, NativeOption::LogLevel(options.native_log_level))
        {
            warn!("Failed to set native log level: {}", e);
        }
        debug!("USB context initialised");

        Ok(Self {
            shared: Arc::new(ContextShared {
                backend,
                options,
                state: RwLock::new(CtxState {
                    native: Some(native),
                    disposed: false,
                    tearing_down: false,
                    open_handles: 0,
                }),
                lists: Mutex::new(Vec::new()),
                hotplugs: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Context backed by the system libusb
    pub fn libusb(options: ContextOptions) -> Result<Self> {
        Self::new(Arc::new(LibusbBackend::new()), options)
    }

    pub fn options(&self) -> &ContextOptions {
        &self.shared.options
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    /// Snapshot the devices currently connected
    pub fn devices(&self) -> Result<DeviceList> {
        let state = self.shared.read();
        let native = state.live()?;
        let list = DeviceList::capture(&self.shared, native)?;

        let mut lists = self.shared.lists();
        lists.retain(|l| l.strong_count() > 0);
        lists.push(list.downgrade());
        Ok(list)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.read().disposed
    }

    /// Human readable description of `error` from the native layer
    pub fn strerror(&self, error: &UsbError) -> String {
        self.shared.backend.strerror(error)
    }

    /// Tear the context down; idempotent
    pub fn dispose(&self) {
        let (native, hotplugs) = {
            let mut state = self.shared.write();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.tearing_down = true;

            let lists = std::mem::take(&mut *self.shared.lists());
            for list in lists.iter().filter_map(Weak::upgrade) {
                list.release();
            }
            (state.native, std::mem::take(&mut *self.shared.hotplugs()))
        };

        // Hotplug callbacks may be running on the native event thread, so
        // deregistration happens without the state lock.
        if let Some(native) = native {
            for (hotplug, _slot) in &hotplugs {
                self.shared.backend.deregister_hotplug(native, *hotplug);
            }
        }
        drop(hotplugs);

        let exit = {
            let mut state = self.shared.write();
            state.tearing_down = false;
            if state.open_handles == 0 {
                state.native.take()
            } else {
                warn!(
                    "USB context disposed with {} open device handle(s); native exit deferred",
                    state.open_handles
                );
                None
            }
        };

        if let Some(native) = exit {
            self.shared.finish_exit(native);
        }
        info!("USB context disposed");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.dispose();
    }
}
