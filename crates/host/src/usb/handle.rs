//! Open device sessions

use super::context::ContextShared;
use super::transfers::{TransferOutcome, TransferRequest, run_bridged, run_direct};
use crate::native::{NativeHandle, UsbBackend};
use common::TransferMode;
use protocol::strings::{MAX_STRING_DESCRIPTOR_LEN, ascii_from_raw};
use protocol::{
    ControlSetup, Direction, Result, UsbError, decode_language_ids, decode_string_descriptor,
};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

struct HandleState {
    native: Option<NativeHandle>,
    claimed: BTreeSet<u8>,
    /// Interfaces whose kernel driver we detached and must give back
    detached: BTreeSet<u8>,
}

/// An open native session to one device
///
/// The handle keeps the context's shared state alive, so it can outlive the
/// [`Device`](super::Device) it came from, that device's list and even the
/// [`Context`](super::Context) wrapper. Once the context is disposed every
/// operation fails with `AlreadyDisposed`; [`dispose`](Self::dispose) still
/// closes the native session.
pub struct DeviceHandle {
    ctx: Arc<ContextShared>,
    state: Mutex<HandleState>,
    bus_number: u8,
    address: u8,
}

impl DeviceHandle {
    pub(crate) fn new(
        ctx: Arc<ContextShared>,
        native: NativeHandle,
        bus_number: u8,
        address: u8,
    ) -> Self {
        Self {
            ctx,
            state: Mutex::new(HandleState {
                native: Some(native),
                claimed: BTreeSet::new(),
                detached: BTreeSet::new(),
            }),
            bus_number,
            address,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `op` with the context read lock and the handle state held
    fn with_native<T>(
        &self,
        op: impl FnOnce(&dyn UsbBackend, NativeHandle, &mut HandleState) -> Result<T>,
    ) -> Result<T> {
        let ctx = self.ctx.read();
        ctx.live()?;
        let mut state = self.lock();
        let native = state
            .native
            .ok_or_else(|| UsbError::disposed("device handle"))?;
        op(self.ctx.backend.as_ref(), native, &mut state)
    }

    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Timeout configured on the owning context
    pub fn default_timeout(&self) -> Duration {
        self.ctx.options.default_timeout
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().native.is_none()
    }

    // ========================================================================
    // Interfaces and kernel drivers
    // ========================================================================

    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        self.with_native(|backend, native, state| {
            backend.claim_interface(native, interface)?;
            state.claimed.insert(interface);
            debug!("Claimed interface {} on {}", interface, self.location());
            Ok(())
        })
    }

    pub fn release_interface(&self, interface: u8) -> Result<()> {
        self.with_native(|backend, native, state| {
            backend.release_interface(native, interface)?;
            state.claimed.remove(&interface);
            Ok(())
        })
    }

    pub fn set_alternate_setting(&self, interface: u8, alt_setting: u8) -> Result<()> {
        self.with_native(|backend, native, _| {
            backend.set_interface_alt_setting(native, interface, alt_setting)
        })
    }

    pub fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        self.with_native(|backend, native, _| backend.kernel_driver_active(native, interface))
    }

    /// Detach the kernel driver; it is reattached when the handle is disposed
    pub fn detach_kernel_driver(&self, interface: u8) -> Result<()> {
        self.with_native(|backend, native, state| {
            backend.detach_kernel_driver(native, interface)?;
            state.detached.insert(interface);
            debug!(
                "Detached kernel driver from interface {} on {}",
                interface,
                self.location()
            );
            Ok(())
        })
    }

    pub fn attach_kernel_driver(&self, interface: u8) -> Result<()> {
        self.with_native(|backend, native, state| {
            backend.attach_kernel_driver(native, interface)?;
            state.detached.remove(&interface);
            Ok(())
        })
    }

    /// Reset the device; claimed interfaces must be claimed again afterwards
    pub fn reset(&self) -> Result<()> {
        self.with_native(|backend, native, state| {
            backend.reset_device(native)?;
            state.claimed.clear();
            Ok(())
        })
    }

    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.with_native(|backend, native, _| backend.clear_halt(native, endpoint))
    }

    // ========================================================================
    // String descriptors
    // ========================================================================

    /// String `index` in the device's first language, narrowed to ASCII
    pub fn read_string_descriptor_ascii(&self, index: u8) -> Result<String> {
        if index == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let mut buf = [0u8; MAX_STRING_DESCRIPTOR_LEN];
        let count = self.with_native(|backend, native, _| {
            backend.get_string_descriptor_ascii(native, index, &mut buf)
        })?;
        Ok(ascii_from_raw(&buf, count))
    }

    pub fn read_string_descriptor(&self, index: u8, language: u16) -> Result<String> {
        if index == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let raw = self.read_raw_string(index, language)?;
        Ok(decode_string_descriptor(&raw)?)
    }

    /// Language ids from string descriptor zero
    pub fn read_languages(&self) -> Result<Vec<u16>> {
        let raw = self.read_raw_string(0, 0)?;
        Ok(decode_language_ids(&raw)?)
    }

    fn read_raw_string(&self, index: u8, language: u16) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_STRING_DESCRIPTOR_LEN];
        let count = self.with_native(|backend, native, _| {
            backend.get_string_descriptor(native, index, language, &mut buf)
        })?;
        buf.truncate(count);
        Ok(buf)
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Run `request` through the asynchronous bridge
    ///
    /// Non-completed outcomes are returned as `Ok` so callers can inspect
    /// partial data; use [`TransferOutcome::into_result`] to turn them into
    /// errors.
    pub fn submit(&self, request: TransferRequest) -> Result<TransferOutcome> {
        self.run(request, TransferMode::Bridge)
    }

    /// Run `request` the way the context's transfer mode says
    pub fn transfer(&self, request: TransferRequest) -> Result<TransferOutcome> {
        self.run(request, self.ctx.options.transfer_mode)
    }

    fn run(&self, request: TransferRequest, mode: TransferMode) -> Result<TransferOutcome> {
        // The read lock is held for the whole transfer so nothing can close
        // the handle or exit the context underneath it.
        let ctx = self.ctx.read();
        ctx.live()?;
        let native = self
            .lock()
            .native
            .ok_or_else(|| UsbError::disposed("device handle"))?;

        let backend = self.ctx.backend.as_ref();
        match mode {
            TransferMode::Bridge => run_bridged(backend, native, request),
            TransferMode::Direct => run_direct(backend, native, request),
        }
    }

    /// Device-to-host control request returning the bytes received
    pub fn read_control(&self, setup: ControlSetup, timeout: Duration) -> Result<Vec<u8>> {
        let request = TransferRequest::control_in(setup, timeout)?;
        Ok(self.transfer(request)?.into_result()?.data)
    }

    /// Host-to-device control request; `setup.length` must match `data`
    pub fn write_control(&self, setup: ControlSetup, data: &[u8], timeout: Duration) -> Result<usize> {
        let request = TransferRequest::control_out(setup, data, timeout)?;
        Ok(self.transfer(request)?.into_result()?.actual_length)
    }

    /// Control request in either direction, with `buf` as the data stage
    ///
    /// `setup.length` must equal `buf.len()`. IN data is copied into `buf`.
    pub fn control_transfer(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        if usize::from(setup.length) != buf.len() {
            return Err(UsbError::InvalidParameter);
        }
        match setup.direction() {
            Direction::In => {
                let data = self.read_control(setup, timeout)?;
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Direction::Out => self.write_control(setup, buf, timeout),
        }
    }

    pub fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let request = TransferRequest::bulk_in(endpoint, buf.len(), timeout)?;
        let outcome = self.transfer(request)?.into_result()?;
        buf[..outcome.data.len()].copy_from_slice(&outcome.data);
        Ok(outcome.actual_length)
    }

    pub fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        let request = TransferRequest::bulk_out(endpoint, data, timeout)?;
        Ok(self.transfer(request)?.into_result()?.actual_length)
    }

    pub fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let request = TransferRequest::interrupt_in(endpoint, buf.len(), timeout)?;
        let outcome = self.transfer(request)?.into_result()?;
        buf[..outcome.data.len()].copy_from_slice(&outcome.data);
        Ok(outcome.actual_length)
    }

    pub fn write_interrupt(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        let request = TransferRequest::interrupt_out(endpoint, data, timeout)?;
        Ok(self.transfer(request)?.into_result()?.actual_length)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close the native session; idempotent and valid after the context is
    /// disposed
    ///
    /// Claimed interfaces are released and detached kernel drivers are
    /// reattached first so the device returns to normal kernel control.
    pub fn dispose(&self) {
        let exit = {
            let mut ctx = self.ctx.write();
            let mut state = self.lock();
            let Some(native) = state.native.take() else {
                return;
            };
            let backend = &self.ctx.backend;

            for interface in std::mem::take(&mut state.claimed) {
                if let Err(e) = backend.release_interface(native, interface) {
                    warn!("Failed to release interface {}: {}", interface, e);
                }
            }
            for interface in std::mem::take(&mut state.detached) {
                match backend.attach_kernel_driver(native, interface) {
                    Ok(()) => debug!(
                        "Reattached kernel driver to interface {} on {}",
                        interface,
                        self.location()
                    ),
                    Err(e) => warn!(
                        "Could not reattach kernel driver to interface {}: {}",
                        interface, e
                    ),
                }
            }
            backend.close(native);
            drop(state);

            debug!("Closed device handle on {}", self.location());
            ctx.handle_closed()
        };

        if let Some(native) = exit {
            debug!("Last handle closed; running deferred native exit");
            self.ctx.finish_exit(native);
        }
    }

    fn location(&self) -> String {
        format!("bus {} address {}", self.bus_number, self.address)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("bus_number", &self.bus_number)
            .field("address", &self.address)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{FakeDeviceSpec, FakeUsb};
    use crate::usb::{Context, ContextOptions};
    use common::test_utils::device_descriptor_bytes;
    use protocol::LANGUAGE_EN_US;

    fn open_handle(spec: FakeDeviceSpec) -> (Arc<FakeUsb>, Context, DeviceHandle) {
        let fake = Arc::new(FakeUsb::with_devices([spec]));
        let ctx = Context::new(fake.clone(), ContextOptions::default()).unwrap();
        let handle = {
            let list = ctx.devices().unwrap();
            list.get(0).unwrap().open().unwrap()
        };
        (fake, ctx, handle)
    }

    fn spec() -> FakeDeviceSpec {
        FakeDeviceSpec::new(1, 4, &device_descriptor_bytes(0x1234, 0x5678, 0x0200))
    }

    #[test]
    fn test_dispose_releases_and_reattaches() {
        let (fake, _ctx, handle) = open_handle(spec().with_kernel_driver(0));

        assert!(matches!(handle.claim_interface(0), Err(UsbError::ResourceBusy)));
        assert!(handle.kernel_driver_active(0).unwrap());
        handle.detach_kernel_driver(0).unwrap();
        handle.claim_interface(0).unwrap();
        assert!(fake.is_claimed(0));
        assert!(fake.is_detached(0));

        handle.dispose();
        assert!(!fake.is_claimed(0));
        assert!(!fake.is_detached(0));
        assert_eq!(fake.open_handles(), 0);

        handle.dispose();
        assert_eq!(fake.counters().misuse(), 0);
    }

    #[test]
    fn test_operations_fail_after_dispose() {
        let (_fake, _ctx, handle) = open_handle(spec());
        handle.dispose();

        assert!(handle.is_disposed());
        assert!(matches!(
            handle.claim_interface(0),
            Err(UsbError::AlreadyDisposed(_))
        ));
        let mut buf = [0u8; 8];
        assert!(matches!(
            handle.read_bulk(0x81, &mut buf, Duration::from_millis(10)),
            Err(UsbError::AlreadyDisposed(_))
        ));
    }

    #[test]
    fn test_string_descriptors() {
        let (_fake, _ctx, handle) = open_handle(
            spec()
                .with_string(1, "Acme")
                .with_string(2, "Caméra"),
        );

        assert_eq!(handle.read_languages().unwrap(), vec![LANGUAGE_EN_US]);
        assert_eq!(handle.read_string_descriptor_ascii(1).unwrap(), "Acme");
        assert_eq!(handle.read_string_descriptor_ascii(2).unwrap(), "Cam?ra");
        assert_eq!(
            handle.read_string_descriptor(2, LANGUAGE_EN_US).unwrap(),
            "Caméra"
        );
        assert!(matches!(
            handle.read_string_descriptor_ascii(0),
            Err(UsbError::InvalidParameter)
        ));
        assert!(matches!(
            handle.read_string_descriptor_ascii(9),
            Err(UsbError::Pipe)
        ));
    }

    #[test]
    fn test_control_transfer_length_must_match_buffer() {
        let (_fake, _ctx, handle) = open_handle(spec());
        let setup = ControlSetup::get_configuration();
        let mut buf = [0u8; 4];
        assert!(matches!(
            handle.control_transfer(setup, &mut buf, Duration::from_millis(10)),
            Err(UsbError::InvalidParameter)
        ));
    }
}
