//! libusb backend
//!
//! Device enumeration, handles and blocking transfers go through rusb.
//! Asynchronous transfers, raw descriptor bytes and interface management use
//! the raw libusb bindings rusb re-exports, since rusb exposes none of them
//! in a form that keeps the native ids opaque.
//!
//! Each context gets a dedicated "usb-events" thread that pumps
//! `handle_events` until the context exits; transfer and hotplug callbacks
//! run on that thread.

use super::{
    CompletionCallback, ExitReport, HotplugCallback, HotplugEventKind, HotplugFilter,
    HotplugNotice, NativeContext, NativeDevice, NativeHandle, NativeHotplug, NativeOption,
    NativeTransfer, TransferCompletion, TransferKind, TransferSetup, UsbBackend,
};
use protocol::{ControlSetup, DeviceSpeed, Result, TransferStatus, UsbError};
use rusb::ffi::{self, constants::*};
use rusb::{Context, UsbContext};
use std::collections::HashMap;
use std::ffi::{CStr, c_int, c_uint, c_void};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::{ptr, slice};
use tracing::{debug, info, warn};

/// How long one `handle_events` call may block before the stop flag is rechecked
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for string descriptor reads
const STRING_TIMEOUT: Duration = Duration::from_secs(1);

type RusbDevice = rusb::Device<Context>;
type RusbHandle = rusb::DeviceHandle<Context>;

/// Event pump for one context
struct EventThread {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl EventThread {
    fn spawn(context: Context) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let join = thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || {
                debug!("USB event thread started");
                while !flag.load(Ordering::Acquire) {
                    match context.handle_events(Some(EVENT_POLL_INTERVAL)) {
                        Ok(()) => {}
                        Err(rusb::Error::Interrupted) => {
                            debug!("USB event handling interrupted");
                        }
                        Err(e) => {
                            warn!("Error handling USB events: {}", e);
                            thread::sleep(EVENT_POLL_INTERVAL);
                        }
                    }
                }
                debug!("USB event thread stopped");
            })
            .map_err(|e| UsbError::Other(format!("failed to spawn event thread: {}", e)))?;

        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            warn!("USB event thread panicked");
        }
    }
}

/// Owned `libusb_transfer` pointer
struct RawTransfer(*mut ffi::libusb_transfer);

// SAFETY: the pointer is only dereferenced by this backend, under the
// submit/cancel/free protocol; libusb transfers are not tied to a thread.
unsafe impl Send for RawTransfer {}

/// Data attached to an in-flight transfer through `user_data`
struct PendingTransfer {
    buffer: Vec<u8>,
    on_complete: CompletionCallback,
    busy: Arc<AtomicBool>,
}

struct ContextRecord {
    context: Context,
    events: Option<EventThread>,
}

struct DeviceRecord {
    ctx: u64,
    device: RusbDevice,
    refs: usize,
}

struct HandleRecord {
    ctx: u64,
    handle: Arc<RusbHandle>,
}

struct TransferRecord {
    raw: RawTransfer,
    busy: Arc<AtomicBool>,
    /// Keeps the native handle open while the transfer is populated
    handle: Option<Arc<RusbHandle>>,
}

struct HotplugRecord {
    ctx: u64,
    registration: rusb::Registration<Context>,
}

#[derive(Default)]
struct LibusbState {
    next_id: u64,
    contexts: HashMap<u64, ContextRecord>,
    devices: HashMap<u64, DeviceRecord>,
    handles: HashMap<u64, HandleRecord>,
    transfers: HashMap<u64, TransferRecord>,
    hotplugs: HashMap<u64, HotplugRecord>,
}

impl LibusbState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Backend driving real hardware through libusb
#[derive(Default)]
pub struct LibusbBackend {
    state: Mutex<LibusbState>,
}

impl LibusbBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LibusbState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn context(&self, ctx: NativeContext) -> Result<Context> {
        self.lock()
            .contexts
            .get(&ctx.0)
            .map(|c| c.context.clone())
            .ok_or(UsbError::NotFound)
    }

    fn device(&self, device: NativeDevice) -> Result<RusbDevice> {
        self.lock()
            .devices
            .get(&device.0)
            .map(|d| d.device.clone())
            .ok_or(UsbError::NotFound)
    }

    fn handle(&self, handle: NativeHandle) -> Result<Arc<RusbHandle>> {
        self.lock()
            .handles
            .get(&handle.0)
            .map(|h| h.handle.clone())
            .ok_or(UsbError::NotFound)
    }

    fn config_with<F>(&self, device: NativeDevice, get: F) -> Result<Vec<u8>>
    where
        F: FnOnce(*mut ffi::libusb_device, *mut *const ffi::libusb_config_descriptor) -> c_int,
    {
        let device = self.device(device)?;
        let mut config = MaybeUninit::<*const ffi::libusb_config_descriptor>::uninit();
        check(get(device.as_raw(), config.as_mut_ptr()))?;

        // SAFETY: libusb returned success, so the pointer is initialised and
        // valid until it is handed back to libusb_free_config_descriptor.
        unsafe {
            let config = config.assume_init();
            let bytes = flatten_config(&*config);
            ffi::libusb_free_config_descriptor(config);
            Ok(bytes)
        }
    }
}

impl Drop for LibusbBackend {
    fn drop(&mut self) {
        let state = std::mem::take(&mut *self.lock());
        drop(state.hotplugs);
        for (_, mut record) in state.contexts {
            if let Some(events) = record.events.take() {
                events.stop();
            }
        }
    }
}

// ============================================================================
// Error mapping
// ============================================================================

/// Map rusb::Error onto the shared error taxonomy
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParameter,
        rusb::Error::Access => UsbError::AccessDenied,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::ResourceBusy,
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::Interrupted => UsbError::Interrupted,
        rusb::Error::NoMem => UsbError::InsufficientMemory,
        rusb::Error::NotSupported => UsbError::NotSupported,
        _ => UsbError::Other(err.to_string()),
    }
}

/// Map a raw libusb return code
pub fn from_libusb_code(code: c_int) -> UsbError {
    match code {
        LIBUSB_ERROR_IO => UsbError::Io,
        LIBUSB_ERROR_INVALID_PARAM => UsbError::InvalidParameter,
        LIBUSB_ERROR_ACCESS => UsbError::AccessDenied,
        LIBUSB_ERROR_NO_DEVICE => UsbError::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => UsbError::NotFound,
        LIBUSB_ERROR_BUSY => UsbError::ResourceBusy,
        LIBUSB_ERROR_TIMEOUT => UsbError::Timeout,
        LIBUSB_ERROR_OVERFLOW => UsbError::Overflow,
        LIBUSB_ERROR_PIPE => UsbError::Pipe,
        LIBUSB_ERROR_INTERRUPTED => UsbError::Interrupted,
        LIBUSB_ERROR_NO_MEM => UsbError::InsufficientMemory,
        LIBUSB_ERROR_NOT_SUPPORTED => UsbError::NotSupported,
        other => UsbError::Other(format!("libusb error {}", other)),
    }
}

fn to_libusb_code(err: &UsbError) -> Option<c_int> {
    Some(match err {
        UsbError::Io => LIBUSB_ERROR_IO,
        UsbError::InvalidParameter => LIBUSB_ERROR_INVALID_PARAM,
        UsbError::AccessDenied => LIBUSB_ERROR_ACCESS,
        UsbError::NoDevice => LIBUSB_ERROR_NO_DEVICE,
        UsbError::NotFound => LIBUSB_ERROR_NOT_FOUND,
        UsbError::ResourceBusy => LIBUSB_ERROR_BUSY,
        UsbError::Timeout => LIBUSB_ERROR_TIMEOUT,
        UsbError::Overflow => LIBUSB_ERROR_OVERFLOW,
        UsbError::Pipe => LIBUSB_ERROR_PIPE,
        UsbError::Interrupted => LIBUSB_ERROR_INTERRUPTED,
        UsbError::InsufficientMemory => LIBUSB_ERROR_NO_MEM,
        UsbError::NotSupported => LIBUSB_ERROR_NOT_SUPPORTED,
        _ => return None,
    })
}

fn check(code: c_int) -> Result<()> {
    if code < 0 {
        Err(from_libusb_code(code))
    } else {
        Ok(())
    }
}

/// Outcome of a blocking libusb transfer; errors that say how the transfer
/// ended become a status, the rest mean it never ran
fn blocking_status(rc: c_int, transferred: c_int) -> Result<(TransferStatus, usize)> {
    let transferred = usize::try_from(transferred).unwrap_or(0);
    if rc >= 0 {
        return Ok((TransferStatus::Completed, transferred));
    }
    let error = from_libusb_code(rc);
    match TransferStatus::from_error(&error) {
        Some(status) => Ok((status, transferred)),
        None => Err(error),
    }
}

fn map_transfer_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

fn timeout_ms(timeout: Duration) -> c_uint {
    timeout.as_millis().min(u128::from(c_uint::MAX)) as c_uint
}

// ============================================================================
// Raw descriptors
// ============================================================================

fn raw_device_descriptor(device: &RusbDevice) -> Result<[u8; 18]> {
    let mut desc = MaybeUninit::<ffi::libusb_device_descriptor>::uninit();
    // SAFETY: `device` holds a reference to a live libusb_device.
    check(unsafe { ffi::libusb_get_device_descriptor(device.as_raw(), desc.as_mut_ptr()) })?;
    // SAFETY: filled in by libusb on success.
    let d = unsafe { desc.assume_init() };

    let mut out = [0u8; 18];
    out[0] = 18;
    out[1] = d.bDescriptorType;
    out[2..4].copy_from_slice(&d.bcdUSB.to_le_bytes());
    out[4] = d.bDeviceClass;
    out[5] = d.bDeviceSubClass;
    out[6] = d.bDeviceProtocol;
    out[7] = d.bMaxPacketSize0;
    out[8..10].copy_from_slice(&d.idVendor.to_le_bytes());
    out[10..12].copy_from_slice(&d.idProduct.to_le_bytes());
    out[12..14].copy_from_slice(&d.bcdDevice.to_le_bytes());
    out[14] = d.iManufacturer;
    out[15] = d.iProduct;
    out[16] = d.iSerialNumber;
    out[17] = d.bNumConfigurations;
    Ok(out)
}

/// View a libusb `extra` block
///
/// # Safety
/// `ptr` must be null or point to `len` readable bytes outliving `'a`.
unsafe fn extra_bytes<'a>(ptr: *const u8, len: c_int) -> &'a [u8] {
    if ptr.is_null() || len <= 0 {
        &[]
    } else {
        // SAFETY: guaranteed by the caller.
        unsafe { slice::from_raw_parts(ptr, len as usize) }
    }
}

/// Re-serialise a parsed configuration into wire order
///
/// libusb parses the configuration up front and keeps class-specific
/// descriptors as `extra` blocks; walking the tree in order yields the
/// original byte stream. `wTotalLength` is recomputed.
fn flatten_config(config: &ffi::libusb_config_descriptor) -> Vec<u8> {
    let mut out = vec![
        9,
        0x02,
        0,
        0,
        config.bNumInterfaces,
        config.bConfigurationValue,
        config.iConfiguration,
        config.bmAttributes,
        config.bMaxPower,
    ];
    // SAFETY: every pointer below comes from a descriptor libusb has not
    // freed yet, with the counts libusb reported alongside it.
    unsafe {
        out.extend_from_slice(extra_bytes(config.extra, config.extra_length));

        for i in 0..usize::from(config.bNumInterfaces) {
            let interface = &*config.interface.add(i);
            for a in 0..interface.num_altsetting.max(0) as usize {
                let alt = &*interface.altsetting.add(a);
                out.extend_from_slice(&[
                    9,
                    0x04,
                    alt.bInterfaceNumber,
                    alt.bAlternateSetting,
                    alt.bNumEndpoints,
                    alt.bInterfaceClass,
                    alt.bInterfaceSubClass,
                    alt.bInterfaceProtocol,
                    alt.iInterface,
                ]);
                out.extend_from_slice(extra_bytes(alt.extra, alt.extra_length));

                for e in 0..usize::from(alt.bNumEndpoints) {
                    let ep = &*alt.endpoint.add(e);
                    let audio = ep.bLength >= 9;
                    out.push(if audio { 9 } else { 7 });
                    out.push(0x05);
                    out.push(ep.bEndpointAddress);
                    out.push(ep.bmAttributes);
                    out.extend_from_slice(&ep.wMaxPacketSize.to_le_bytes());
                    out.push(ep.bInterval);
                    if audio {
                        out.push(ep.bRefresh);
                        out.push(ep.bSynchAddress);
                    }
                    out.extend_from_slice(extra_bytes(ep.extra, ep.extra_length));
                }
            }
        }
    }

    let total = out.len().min(usize::from(u16::MAX)) as u16;
    out[2..4].copy_from_slice(&total.to_le_bytes());
    out
}

// ============================================================================
// Transfer callback
// ============================================================================

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb passes back the transfer submitted in submit_transfer,
    // whose user_data is a leaked Box<PendingTransfer> reclaimed exactly once
    // here.
    let (pending, status, actual_length) = unsafe {
        let pending = Box::from_raw((*transfer).user_data as *mut PendingTransfer);
        (*transfer).user_data = ptr::null_mut();
        (*transfer).buffer = ptr::null_mut();
        (pending, (*transfer).status, (*transfer).actual_length)
    };

    let PendingTransfer {
        buffer,
        on_complete,
        busy,
    } = *pending;
    busy.store(false, Ordering::Release);

    on_complete(TransferCompletion {
        status: map_transfer_status(status),
        actual_length: actual_length.max(0) as usize,
        buffer,
    });
}

// ============================================================================
// Hotplug
// ============================================================================

struct HotplugForwarder {
    callback: HotplugCallback,
}

impl HotplugForwarder {
    fn forward(&mut self, kind: HotplugEventKind, device: &RusbDevice) {
        // Departed devices often cannot be read any more; the notice still
        // goes out so bus and address can close what was open on it
        let descriptor = match raw_device_descriptor(device) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                debug!("Hot-plug descriptor unavailable: {}", e);
                None
            }
        };
        (self.callback)(HotplugNotice {
            kind,
            bus_number: device.bus_number(),
            address: device.address(),
            port_number: device.port_number(),
            descriptor,
        });
    }
}

impl rusb::Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: RusbDevice) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.forward(HotplugEventKind::Arrived, &device);
    }

    fn device_left(&mut self, device: RusbDevice) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.forward(HotplugEventKind::Left, &device);
    }
}

// ============================================================================
// Backend
// ============================================================================

impl UsbBackend for LibusbBackend {
    fn init(&self) -> Result<NativeContext> {
        let context = Context::new().map_err(map_rusb_error)?;
        let events = EventThread::spawn(context.clone())?;

        let mut st = self.lock();
        let id = st.alloc_id();
        st.contexts.insert(
            id,
            ContextRecord {
                context,
                events: Some(events),
            },
        );
        info!("libusb context {} initialised", id);
        Ok(NativeContext(id))
    }

    fn exit(&self, ctx: NativeContext) -> ExitReport {
        let (record, hotplugs, report) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let Some(record) = st.contexts.remove(&ctx.0) else {
                warn!("libusb context {} exited twice", ctx.0);
                return ExitReport::default();
            };
            let ids: Vec<u64> = st
                .hotplugs
                .iter()
                .filter(|(_, h)| h.ctx == ctx.0)
                .map(|(id, _)| *id)
                .collect();
            let hotplugs: Vec<HotplugRecord> = ids
                .into_iter()
                .filter_map(|id| st.hotplugs.remove(&id))
                .collect();
            let report = ExitReport {
                referenced_devices: st.devices.values().filter(|d| d.ctx == ctx.0).count(),
                open_handles: st.handles.values().filter(|h| h.ctx == ctx.0).count(),
            };
            (record, hotplugs, report)
        };

        drop(hotplugs);
        let ContextRecord {
            context,
            mut events,
        } = record;
        if let Some(events) = events.take() {
            events.stop();
        }
        drop(context);
        debug!("libusb context {} exited", ctx.0);
        report
    }

    fn set_option(&self, ctx: NativeContext, option: NativeOption) -> Result<()> {
        let mut context = self.context(ctx)?;
        let NativeOption::LogLevel(level) = option;
        let level = match level {
            0 => rusb::LogLevel::None,
            1 => rusb::LogLevel::Error,
            2 => rusb::LogLevel::Warning,
            3 => rusb::LogLevel::Info,
            4 => rusb::LogLevel::Debug,
            _ => return Err(UsbError::InvalidParameter),
        };
        context.set_log_level(level);
        Ok(())
    }

    fn get_device_list(&self, ctx: NativeContext) -> Result<Vec<NativeDevice>> {
        let context = self.context(ctx)?;
        let list = context.devices().map_err(map_rusb_error)?;

        let mut st = self.lock();
        Ok(list
            .iter()
            .map(|device| {
                let id = st.alloc_id();
                st.devices.insert(
                    id,
                    DeviceRecord {
                        ctx: ctx.0,
                        device,
                        refs: 1,
                    },
                );
                NativeDevice(id)
            })
            .collect())
    }

    fn ref_device(&self, device: NativeDevice) {
        if let Some(record) = self.lock().devices.get_mut(&device.0) {
            record.refs += 1;
        }
    }

    fn unref_device(&self, device: NativeDevice) {
        let released = {
            let mut st = self.lock();
            match st.devices.get(&device.0).map(|d| d.refs) {
                Some(refs) if refs > 1 => {
                    if let Some(record) = st.devices.get_mut(&device.0) {
                        record.refs -= 1;
                    }
                    None
                }
                Some(_) => st.devices.remove(&device.0),
                None => {
                    warn!("Device reference {} released twice", device.0);
                    None
                }
            }
        };
        drop(released);
    }

    fn device_descriptor(&self, device: NativeDevice) -> Result<[u8; 18]> {
        raw_device_descriptor(&self.device(device)?)
    }

    fn config_descriptor(&self, device: NativeDevice, index: u8) -> Result<Vec<u8>> {
        // SAFETY: both pointers are provided by config_with and valid for the call.
        self.config_with(device, |dev, out| unsafe {
            ffi::libusb_get_config_descriptor(dev, index, out)
        })
    }

    fn active_config_descriptor(&self, device: NativeDevice) -> Result<Vec<u8>> {
        // SAFETY: both pointers are provided by config_with and valid for the call.
        self.config_with(device, |dev, out| unsafe {
            ffi::libusb_get_active_config_descriptor(dev, out)
        })
    }

    fn bus_number(&self, device: NativeDevice) -> Result<u8> {
        Ok(self.device(device)?.bus_number())
    }

    fn device_address(&self, device: NativeDevice) -> Result<u8> {
        Ok(self.device(device)?.address())
    }

    fn port_number(&self, device: NativeDevice) -> Result<u8> {
        Ok(self.device(device)?.port_number())
    }

    fn port_numbers(&self, device: NativeDevice) -> Result<Vec<u8>> {
        self.device(device)?.port_numbers().map_err(map_rusb_error)
    }

    fn speed(&self, device: NativeDevice) -> Result<DeviceSpeed> {
        Ok(map_device_speed(self.device(device)?.speed()))
    }

    fn open(&self, device: NativeDevice) -> Result<NativeHandle> {
        let (ctx, rusb_device) = {
            let st = self.lock();
            let record = st.devices.get(&device.0).ok_or(UsbError::NotFound)?;
            (record.ctx, record.device.clone())
        };
        let handle = rusb_device.open().map_err(map_rusb_error)?;

        let mut st = self.lock();
        let id = st.alloc_id();
        st.handles.insert(
            id,
            HandleRecord {
                ctx,
                handle: Arc::new(handle),
            },
        );
        Ok(NativeHandle(id))
    }

    fn close(&self, handle: NativeHandle) {
        let record = self.lock().handles.remove(&handle.0);
        match record {
            Some(record) => drop(record),
            None => warn!("Handle {} closed twice", handle.0),
        }
    }

    fn claim_interface(&self, handle: NativeHandle, interface: u8) -> Result<()> {
        let handle = self.handle(handle)?;
        // SAFETY: the Arc keeps the native handle open for the call.
        check(unsafe { ffi::libusb_claim_interface(handle.as_raw(), c_int::from(interface)) })
    }

    fn release_interface(&self, handle: NativeHandle, interface: u8) -> Result<()> {
        let handle = self.handle(handle)?;
        // SAFETY: the Arc keeps the native handle open for the call.
        check(unsafe { ffi::libusb_release_interface(handle.as_raw(), c_int::from(interface)) })
    }

    fn set_interface_alt_setting(
        &self,
        handle: NativeHandle,
        interface: u8,
        alt_setting: u8,
    ) -> Result<()> {
        let handle = self.handle(handle)?;
        // SAFETY: the Arc keeps the native handle open for the call.
        check(unsafe {
            ffi::libusb_set_interface_alt_setting(
                handle.as_raw(),
                c_int::from(interface),
                c_int::from(alt_setting),
            )
        })
    }

    fn kernel_driver_active(&self, handle: NativeHandle, interface: u8) -> Result<bool> {
        self.handle(handle)?
            .kernel_driver_active(interface)
            .map_err(map_rusb_error)
    }

    fn detach_kernel_driver(&self, handle: NativeHandle, interface: u8) -> Result<()> {
        let handle = self.handle(handle)?;
        // SAFETY: the Arc keeps the native handle open for the call.
        check(unsafe { ffi::libusb_detach_kernel_driver(handle.as_raw(), c_int::from(interface)) })
    }

    fn attach_kernel_driver(&self, handle: NativeHandle, interface: u8) -> Result<()> {
        let handle = self.handle(handle)?;
        // SAFETY: the Arc keeps the native handle open for the call.
        check(unsafe { ffi::libusb_attach_kernel_driver(handle.as_raw(), c_int::from(interface)) })
    }

    fn reset_device(&self, handle: NativeHandle) -> Result<()> {
        let handle = self.handle(handle)?;
        // SAFETY: the Arc keeps the native handle open for the call.
        check(unsafe { ffi::libusb_reset_device(handle.as_raw()) })
    }

    fn clear_halt(&self, handle: NativeHandle, endpoint: u8) -> Result<()> {
        let handle = self.handle(handle)?;
        // SAFETY: the Arc keeps the native handle open for the call.
        check(unsafe { ffi::libusb_clear_halt(handle.as_raw(), endpoint) })
    }

    fn get_string_descriptor(
        &self,
        handle: NativeHandle,
        index: u8,
        language: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        let length = u16::try_from(buf.len()).unwrap_or(u16::MAX);
        let setup = ControlSetup::get_descriptor(0x03, index, language, length);
        self.handle(handle)?
            .read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                buf,
                STRING_TIMEOUT,
            )
            .map_err(map_rusb_error)
    }

    fn get_string_descriptor_ascii(
        &self,
        handle: NativeHandle,
        index: u8,
        buf: &mut [u8],
    ) -> Result<usize> {
        let handle = self.handle(handle)?;
        let len = c_int::try_from(buf.len()).unwrap_or(c_int::MAX);
        // SAFETY: `buf` is writable for `len` bytes and the Arc keeps the
        // native handle open for the call.
        let written = unsafe {
            ffi::libusb_get_string_descriptor_ascii(handle.as_raw(), index, buf.as_mut_ptr(), len)
        };
        check(written)?;
        Ok(written as usize)
    }

    fn control_transfer(
        &self,
        handle: NativeHandle,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(TransferStatus, usize)> {
        let handle = self.handle(handle)?;
        let length = usize::from(setup.length).min(data.len());
        // SAFETY: `data` outlives the blocking call and holds `length` bytes;
        // the Arc keeps the native handle open.
        let rc = unsafe {
            ffi::libusb_control_transfer(
                handle.as_raw(),
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data.as_mut_ptr(),
                length as u16,
                timeout_ms(timeout),
            )
        };
        // A control transfer returns its count in place of the error code
        blocking_status(rc, rc.max(0))
    }

    fn bulk_transfer(
        &self,
        handle: NativeHandle,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(TransferStatus, usize)> {
        let handle = self.handle(handle)?;
        let length = c_int::try_from(data.len()).map_err(|_| UsbError::InvalidParameter)?;
        let mut transferred: c_int = 0;
        // SAFETY: as for control transfers; libusb writes `transferred` even
        // when the call fails part way.
        let rc = unsafe {
            ffi::libusb_bulk_transfer(
                handle.as_raw(),
                endpoint,
                data.as_mut_ptr(),
                length,
                &mut transferred,
                timeout_ms(timeout),
            )
        };
        blocking_status(rc, transferred)
    }

    fn interrupt_transfer(
        &self,
        handle: NativeHandle,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(TransferStatus, usize)> {
        let handle = self.handle(handle)?;
        let length = c_int::try_from(data.len()).map_err(|_| UsbError::InvalidParameter)?;
        let mut transferred: c_int = 0;
        // SAFETY: see bulk_transfer.
        let rc = unsafe {
            ffi::libusb_interrupt_transfer(
                handle.as_raw(),
                endpoint,
                data.as_mut_ptr(),
                length,
                &mut transferred,
                timeout_ms(timeout),
            )
        };
        blocking_status(rc, transferred)
    }

    fn alloc_transfer(&self) -> Result<NativeTransfer> {
        // SAFETY: plain allocation; ownership is tracked in the transfer map.
        let raw = unsafe { ffi::libusb_alloc_transfer(0) };
        if raw.is_null() {
            return Err(UsbError::InsufficientMemory);
        }

        let mut st = self.lock();
        let id = st.alloc_id();
        st.transfers.insert(
            id,
            TransferRecord {
                raw: RawTransfer(raw),
                busy: Arc::new(AtomicBool::new(false)),
                handle: None,
            },
        );
        Ok(NativeTransfer(id))
    }

    fn submit_transfer(
        &self,
        transfer: NativeTransfer,
        setup: TransferSetup,
        buffer: Vec<u8>,
        on_complete: CompletionCallback,
    ) -> Result<()> {
        let length = c_int::try_from(buffer.len()).map_err(|_| UsbError::InvalidParameter)?;
        let transfer_type = match setup.kind {
            TransferKind::Control => LIBUSB_TRANSFER_TYPE_CONTROL,
            TransferKind::Bulk => LIBUSB_TRANSFER_TYPE_BULK,
            TransferKind::Interrupt => LIBUSB_TRANSFER_TYPE_INTERRUPT,
        };

        let mut st = self.lock();
        let handle = st
            .handles
            .get(&setup.handle.0)
            .map(|h| h.handle.clone())
            .ok_or(UsbError::NotFound)?;
        let record = st.transfers.get_mut(&transfer.0).ok_or(UsbError::NotFound)?;
        if record.busy.load(Ordering::Acquire) {
            return Err(UsbError::ResourceBusy);
        }

        let mut pending = Box::new(PendingTransfer {
            buffer,
            on_complete,
            busy: record.busy.clone(),
        });
        let data = pending.buffer.as_mut_ptr();
        let user_data = Box::into_raw(pending) as *mut c_void;
        record.busy.store(true, Ordering::Release);

        let raw = record.raw.0;
        // SAFETY: `raw` was allocated by libusb_alloc_transfer and is not in
        // flight; the buffer lives inside the boxed PendingTransfer until the
        // callback reclaims it.
        let rc = unsafe {
            (*raw).dev_handle = handle.as_raw();
            (*raw).endpoint = setup.endpoint;
            (*raw).transfer_type = transfer_type as _;
            (*raw).timeout = timeout_ms(setup.timeout);
            (*raw).length = length;
            (*raw).buffer = data;
            (*raw).user_data = user_data;
            (*raw).callback = transfer_callback;
            ffi::libusb_submit_transfer(raw)
        };

        if rc < 0 {
            record.busy.store(false, Ordering::Release);
            // SAFETY: submission failed, so libusb never saw user_data and
            // the callback will not run.
            unsafe {
                drop(Box::from_raw(user_data as *mut PendingTransfer));
                (*raw).user_data = ptr::null_mut();
                (*raw).buffer = ptr::null_mut();
            }
            return Err(from_libusb_code(rc));
        }

        record.handle = Some(handle);
        Ok(())
    }

    fn cancel_transfer(&self, transfer: NativeTransfer) -> Result<()> {
        let st = self.lock();
        let record = st.transfers.get(&transfer.0).ok_or(UsbError::NotFound)?;
        // SAFETY: the transfer stays allocated while its record exists.
        check(unsafe { ffi::libusb_cancel_transfer(record.raw.0) })
    }

    fn free_transfer(&self, transfer: NativeTransfer) {
        let Some(record) = self.lock().transfers.remove(&transfer.0) else {
            warn!("Transfer {} freed twice", transfer.0);
            return;
        };
        if record.busy.load(Ordering::Acquire) {
            warn!(
                "Transfer {} freed while in flight; leaking it",
                transfer.0
            );
            return;
        }
        // SAFETY: not in flight, and removed from the map so never used again.
        unsafe { ffi::libusb_free_transfer(record.raw.0) };
    }

    fn register_hotplug(
        &self,
        ctx: NativeContext,
        filter: HotplugFilter,
        callback: HotplugCallback,
    ) -> Result<NativeHotplug> {
        if !rusb::has_hotplug() {
            return Err(UsbError::NotSupported);
        }
        let context = self.context(ctx)?;

        let mut builder = rusb::HotplugBuilder::new();
        if let Some(vendor_id) = filter.vendor_id {
            builder.vendor_id(vendor_id);
        }
        if let Some(product_id) = filter.product_id {
            builder.product_id(product_id);
        }
        if let Some(class) = filter.class {
            builder.class(class);
        }
        builder.enumerate(filter.enumerate);
        let registration = builder
            .register(&context, Box::new(HotplugForwarder { callback }))
            .map_err(map_rusb_error)?;

        let mut st = self.lock();
        let id = st.alloc_id();
        st.hotplugs.insert(
            id,
            HotplugRecord {
                ctx: ctx.0,
                registration,
            },
        );
        debug!("Hot-plug callback {} registered", id);
        Ok(NativeHotplug(id))
    }

    fn deregister_hotplug(&self, _ctx: NativeContext, hotplug: NativeHotplug) {
        let record = self.lock().hotplugs.remove(&hotplug.0);
        match record {
            Some(record) => drop(record.registration),
            None => warn!("Hot-plug callback {} deregistered twice", hotplug.0),
        }
    }

    fn strerror(&self, error: &UsbError) -> String {
        match to_libusb_code(error) {
            Some(code) => {
                // SAFETY: libusb_strerror returns a static NUL-terminated string.
                let text = unsafe { CStr::from_ptr(ffi::libusb_strerror(code)) };
                text.to_string_lossy().into_owned()
            }
            None => error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), UsbError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Busy), UsbError::ResourceBusy);
        assert_eq!(map_rusb_error(rusb::Error::Access), UsbError::AccessDenied);
    }

    #[test]
    fn test_libusb_codes_round_trip() {
        for err in [
            UsbError::Io,
            UsbError::NoDevice,
            UsbError::Timeout,
            UsbError::Interrupted,
            UsbError::NotSupported,
        ] {
            let code = to_libusb_code(&err).unwrap();
            assert_eq!(from_libusb_code(code), err);
        }
        assert_eq!(to_libusb_code(&UsbError::disposed("context")), None);
    }

    #[test]
    fn test_transfer_status_mapping() {
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_CANCELLED),
            TransferStatus::Cancelled
        );
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_STALL),
            TransferStatus::Stall
        );
        assert_eq!(map_transfer_status(99), TransferStatus::Error);
    }

    #[test]
    fn test_blocking_status_keeps_partial_count() {
        assert_eq!(
            blocking_status(LIBUSB_ERROR_OVERFLOW, 8).unwrap(),
            (TransferStatus::Overflow, 8)
        );
        assert_eq!(
            blocking_status(LIBUSB_ERROR_TIMEOUT, 3).unwrap(),
            (TransferStatus::TimedOut, 3)
        );
        assert_eq!(
            blocking_status(0, 5).unwrap(),
            (TransferStatus::Completed, 5)
        );
        assert_eq!(
            blocking_status(LIBUSB_ERROR_ACCESS, 0),
            Err(UsbError::AccessDenied)
        );
    }

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(
            map_device_speed(rusb::Speed::SuperPlus),
            DeviceSpeed::SuperPlus
        );
        assert_eq!(map_device_speed(rusb::Speed::Unknown), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_context_lifecycle() {
        let backend = LibusbBackend::new();
        // May fail without USB access; only check a successful context exits cleanly
        match backend.init() {
            Ok(ctx) => {
                let devices = backend.get_device_list(ctx).unwrap_or_default();
                for device in &devices {
                    backend.unref_device(*device);
                }
                assert!(backend.exit(ctx).is_clean());
            }
            Err(e) => eprintln!("libusb init failed (expected without USB access): {}", e),
        }
    }
}
