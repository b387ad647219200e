//! Deterministic in-memory USB backend
//!
//! Models just enough of a host driver to exercise the ownership graph and
//! the transfer bridge without hardware: scripted devices, per-record
//! reference counts, controllable transfer completion and simulated hotplug.
//!
//! Misuse that would be undefined behaviour against a real driver (releasing
//! a reference twice, touching a context after exit, freeing a transfer that
//! is still in flight) is tolerated and counted in [`FakeCounters`] so tests
//! can assert it never happens.

use super::{
    CompletionCallback, ExitReport, HotplugCallback, HotplugEventKind, HotplugFilter,
    HotplugNotice, NativeContext, NativeDevice, NativeHandle, NativeHotplug, NativeOption,
    NativeTransfer, TransferCompletion, TransferKind, TransferSetup, UsbBackend,
};
use protocol::setup::{SETUP_PACKET_LEN, request};
use protocol::strings::encode_string_descriptor;
use protocol::{ControlSetup, DeviceSpeed, Direction, Result, TransferStatus, UsbError};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// How submitted transfers on an endpoint complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferBehavior {
    /// Complete immediately from queued IN data or by accepting OUT data
    #[default]
    Respond,
    /// Never complete on its own; only [`FakeUsb::complete_pending`] finishes it
    Hold,
    /// Stay pending until cancelled, then complete with `Cancelled`
    CompleteOnCancel,
    /// Complete immediately with the given status and no data
    Fail(TransferStatus),
}

/// Misuse and activity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeCounters {
    /// Release of a reference, handle, transfer or registration that was not held
    pub double_releases: usize,
    /// Any call naming a context that already exited
    pub use_after_exit: usize,
    /// Calls naming a device, handle or transfer id that does not exist
    pub stale_ids: usize,
    /// Transfers freed before their completion was delivered
    pub freed_in_flight: usize,
    pub submitted: usize,
    pub cancel_calls: usize,
}

impl FakeCounters {
    pub fn misuse(&self) -> usize {
        self.double_releases + self.use_after_exit + self.stale_ids + self.freed_in_flight
    }
}

/// A scripted device
#[derive(Debug, Clone)]
pub struct FakeDeviceSpec {
    pub bus_number: u8,
    pub address: u8,
    pub port_numbers: Vec<u8>,
    pub speed: DeviceSpeed,
    pub descriptor: [u8; 18],
    pub configs: Vec<Vec<u8>>,
    pub active_config: usize,
    pub strings: BTreeMap<u8, String>,
    pub languages: Vec<u16>,
    /// Interfaces bound to a kernel driver when the device is first opened
    pub kernel_drivers: BTreeSet<u8>,
    /// Reported by the bus and address queries instead of a value
    pub location_error: Option<UsbError>,
    /// Reported by descriptor reads, hotplug notices included
    pub descriptor_error: Option<UsbError>,
}

impl FakeDeviceSpec {
    /// `descriptor` is copied into the fixed 18-byte layout, zero padded
    pub fn new(bus_number: u8, address: u8, descriptor: &[u8]) -> Self {
        let mut fixed = [0u8; 18];
        let len = descriptor.len().min(fixed.len());
        fixed[..len].copy_from_slice(&descriptor[..len]);

        Self {
            bus_number,
            address,
            port_numbers: vec![1],
            speed: DeviceSpeed::High,
            descriptor: fixed,
            configs: Vec::new(),
            active_config: 0,
            strings: BTreeMap::new(),
            languages: vec![protocol::LANGUAGE_EN_US],
            kernel_drivers: BTreeSet::new(),
            location_error: None,
            descriptor_error: None,
        }
    }

    pub fn with_config(mut self, config: Vec<u8>) -> Self {
        self.configs.push(config);
        self
    }

    pub fn with_string(mut self, index: u8, text: &str) -> Self {
        self.strings.insert(index, text.to_string());
        self
    }

    pub fn with_port_path(mut self, path: Vec<u8>) -> Self {
        self.port_numbers = path;
        self
    }

    pub fn with_speed(mut self, speed: DeviceSpeed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_kernel_driver(mut self, interface: u8) -> Self {
        self.kernel_drivers.insert(interface);
        self
    }

    pub fn with_location_error(mut self, error: UsbError) -> Self {
        self.location_error = Some(error);
        self
    }

    pub fn with_descriptor_error(mut self, error: UsbError) -> Self {
        self.descriptor_error = Some(error);
        self
    }
}

struct AttachedDevice {
    slot: u64,
    spec: FakeDeviceSpec,
}

struct ContextRecord {
    alive: bool,
    log_level: u8,
}

struct DeviceRecord {
    ctx: u64,
    slot: u64,
    spec: FakeDeviceSpec,
    refs: usize,
}

struct HandleRecord {
    ctx: u64,
    device: u64,
    slot: u64,
    claimed: BTreeSet<u8>,
    detached: BTreeSet<u8>,
}

struct PendingTransfer {
    setup: TransferSetup,
    buffer: Vec<u8>,
    on_complete: CompletionCallback,
}

#[derive(Default)]
struct TransferRecord {
    pending: Option<PendingTransfer>,
}

struct HotplugRecord {
    ctx: u64,
    filter: HotplugFilter,
    callback: Arc<Mutex<HotplugCallback>>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    attached: Vec<AttachedDevice>,
    contexts: HashMap<u64, ContextRecord>,
    devices: HashMap<u64, DeviceRecord>,
    handles: HashMap<u64, HandleRecord>,
    transfers: HashMap<u64, TransferRecord>,
    hotplugs: HashMap<u64, HotplugRecord>,
    behaviors: HashMap<u8, TransferBehavior>,
    in_queues: HashMap<u8, VecDeque<Vec<u8>>>,
    written: HashMap<u8, Vec<Vec<u8>>>,
    control_log: Vec<ControlSetup>,
    resets: usize,
    counters: FakeCounters,
}

/// Deterministic stand-in for a host controller driver
#[derive(Default)]
pub struct FakeUsb {
    state: Mutex<FakeState>,
}

type Delivery = (CompletionCallback, TransferCompletion);

impl FakeUsb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a backend with `devices` already connected
    pub fn with_devices(devices: impl IntoIterator<Item = FakeDeviceSpec>) -> Self {
        let fake = Self::new();
        {
            let mut st = fake.lock();
            for spec in devices {
                let slot = st.alloc_id();
                st.attached.push(AttachedDevice { slot, spec });
            }
        }
        fake
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn counters(&self) -> FakeCounters {
        self.lock().counters
    }

    pub fn set_transfer_behavior(&self, endpoint: u8, behavior: TransferBehavior) {
        self.lock().behaviors.insert(endpoint, behavior);
    }

    /// Queue data the device returns on the next IN transfer from `endpoint`
    ///
    /// Control IN requests not answered from the device's descriptors read
    /// from endpoint `0x80`.
    pub fn queue_in(&self, endpoint: u8, data: &[u8]) {
        self.lock()
            .in_queues
            .entry(endpoint)
            .or_default()
            .push_back(data.to_vec());
    }

    /// Payloads the device accepted on an OUT endpoint (`0x00` for control)
    pub fn written(&self, endpoint: u8) -> Vec<Vec<u8>> {
        self.lock().written.get(&endpoint).cloned().unwrap_or_default()
    }

    /// Every control setup packet seen, in order
    pub fn control_requests(&self) -> Vec<ControlSetup> {
        self.lock().control_log.clone()
    }

    pub fn pending_transfers(&self) -> usize {
        self.lock()
            .transfers
            .values()
            .filter(|t| t.pending.is_some())
            .count()
    }

    /// Poll until at least `count` transfers are pending
    pub fn wait_for_pending(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.pending_transfers() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.pending_transfers() >= count
    }

    /// Complete every pending transfer with `status`
    ///
    /// IN transfers receive up to their capacity of `data`; OUT transfers
    /// report `data.len()` bytes (capped at their payload) as sent.
    /// Returns the number of transfers completed.
    pub fn complete_pending(&self, status: TransferStatus, data: &[u8]) -> usize {
        let deliveries: Vec<Delivery> = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let pending: Vec<PendingTransfer> = st
                .transfers
                .values_mut()
                .filter_map(|t| t.pending.take())
                .collect();
            pending
                .into_iter()
                .map(|p| finish_with(p, status, data))
                .collect()
        };
        deliver(deliveries)
    }

    pub fn live_devices(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.lock().contexts.values().filter(|c| c.alive).count()
    }

    pub fn hotplug_registrations(&self) -> usize {
        self.lock().hotplugs.len()
    }

    pub fn log_level(&self, ctx: NativeContext) -> Option<u8> {
        self.lock().contexts.get(&ctx.0).map(|c| c.log_level)
    }

    pub fn is_claimed(&self, interface: u8) -> bool {
        self.lock()
            .handles
            .values()
            .any(|h| h.claimed.contains(&interface))
    }

    pub fn is_detached(&self, interface: u8) -> bool {
        self.lock()
            .handles
            .values()
            .any(|h| h.detached.contains(&interface))
    }

    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    /// Connect a device and notify matching hotplug callbacks
    pub fn simulate_arrival(&self, spec: FakeDeviceSpec) {
        let notice = notice_for(HotplugEventKind::Arrived, &spec);
        let callbacks = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let slot = st.alloc_id();
            let callbacks = st.callbacks_for(&spec.descriptor);
            st.attached.push(AttachedDevice { slot, spec });
            callbacks
        };
        debug!(
            "Simulated arrival bus={} addr={}",
            notice.bus_number, notice.address
        );
        notify(callbacks, &notice);
    }

    /// Make an attached device's descriptor unreadable from now on
    pub fn break_descriptor(&self, bus_number: u8, address: u8) -> bool {
        let mut st = self.lock();
        match st
            .attached
            .iter_mut()
            .find(|a| a.spec.bus_number == bus_number && a.spec.address == address)
        {
            Some(attached) => {
                attached.spec.descriptor_error = Some(UsbError::Io);
                true
            }
            None => false,
        }
    }

    /// Disconnect a device; its in-flight transfers complete with `NoDevice`
    pub fn simulate_departure(&self, bus_number: u8, address: u8) -> bool {
        let (notice, callbacks, deliveries) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let Some(pos) = st
                .attached
                .iter()
                .position(|a| a.spec.bus_number == bus_number && a.spec.address == address)
            else {
                return false;
            };
            let gone = st.attached.remove(pos);
            let notice = notice_for(HotplugEventKind::Left, &gone.spec);
            let callbacks = st.callbacks_for(&gone.spec.descriptor);

            let handles: BTreeSet<u64> = st
                .handles
                .iter()
                .filter(|(_, h)| h.slot == gone.slot)
                .map(|(id, _)| *id)
                .collect();
            let mut deliveries = Vec::new();
            for record in st.transfers.values_mut() {
                let orphaned = record
                    .pending
                    .as_ref()
                    .is_some_and(|p| handles.contains(&p.setup.handle.0));
                if orphaned && let Some(p) = record.pending.take() {
                    deliveries.push(finish_with(p, TransferStatus::NoDevice, &[]));
                }
            }
            (notice, callbacks, deliveries)
        };
        deliver(deliveries);
        notify(callbacks, &notice);
        true
    }
}

impl FakeState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_ctx(&mut self, ctx: u64) -> Result<()> {
        match self.contexts.get(&ctx) {
            Some(c) if c.alive => Ok(()),
            Some(_) => {
                self.counters.use_after_exit += 1;
                Err(UsbError::NotFound)
            }
            None => {
                self.counters.stale_ids += 1;
                Err(UsbError::NotFound)
            }
        }
    }

    fn device(&mut self, device: NativeDevice) -> Result<&DeviceRecord> {
        let Some(ctx) = self.devices.get(&device.0).map(|d| d.ctx) else {
            self.counters.stale_ids += 1;
            return Err(UsbError::NotFound);
        };
        self.check_ctx(ctx)?;
        self.devices.get(&device.0).ok_or(UsbError::NotFound)
    }

    fn handle(&mut self, handle: NativeHandle) -> Result<&mut HandleRecord> {
        let Some((ctx, slot)) = self.handles.get(&handle.0).map(|h| (h.ctx, h.slot)) else {
            self.counters.stale_ids += 1;
            return Err(UsbError::NotFound);
        };
        self.check_ctx(ctx)?;
        if !self.is_connected(slot) {
            return Err(UsbError::NoDevice);
        }
        self.handles.get_mut(&handle.0).ok_or(UsbError::NotFound)
    }

    fn is_connected(&self, slot: u64) -> bool {
        self.attached.iter().any(|a| a.slot == slot)
    }

    fn spec_for_handle(&self, handle: NativeHandle) -> Option<&FakeDeviceSpec> {
        let h = self.handles.get(&handle.0)?;
        self.devices.get(&h.device).map(|d| &d.spec)
    }

    fn release_device_ref(&mut self, device: u64) {
        let Some(record) = self.devices.get_mut(&device) else {
            self.counters.double_releases += 1;
            return;
        };
        record.refs -= 1;
        let ctx = record.ctx;
        if record.refs == 0 {
            self.devices.remove(&device);
        }
        if !self.contexts.get(&ctx).is_some_and(|c| c.alive) {
            self.counters.use_after_exit += 1;
        }
    }

    fn callbacks_for(&self, descriptor: &[u8; 18]) -> Vec<Arc<Mutex<HotplugCallback>>> {
        self.hotplugs
            .values()
            .filter(|h| {
                self.contexts.get(&h.ctx).is_some_and(|c| c.alive) && h.filter.matches(descriptor)
            })
            .map(|h| h.callback.clone())
            .collect()
    }

    fn behavior(&self, endpoint: u8, kind: TransferKind) -> TransferBehavior {
        let key = if kind == TransferKind::Control {
            0
        } else {
            endpoint
        };
        self.behaviors.get(&key).copied().unwrap_or_default()
    }

    /// Device side of a transfer that completes immediately
    fn respond(
        &mut self,
        handle: NativeHandle,
        endpoint: u8,
        setup: Option<ControlSetup>,
        payload: &mut [u8],
    ) -> (TransferStatus, usize) {
        if let Some(setup) = setup {
            self.control_log.push(setup);
            if setup.direction() == Direction::In
                && let Some(answer) = self.standard_answer(handle, &setup)
            {
                let n = answer.len().min(payload.len());
                payload[..n].copy_from_slice(&answer[..n]);
                return (TransferStatus::Completed, n);
            }
        }

        let direction_in = match setup {
            Some(setup) => setup.direction() == Direction::In,
            None => endpoint & 0x80 != 0,
        };
        let queue_key = if setup.is_some() { 0x80 } else { endpoint };

        if direction_in {
            match self
                .in_queues
                .get_mut(&queue_key)
                .and_then(|q| q.pop_front())
            {
                Some(data) if data.len() > payload.len() && setup.is_none() => {
                    let n = payload.len();
                    payload.copy_from_slice(&data[..n]);
                    (TransferStatus::Overflow, n)
                }
                Some(data) => {
                    let n = data.len().min(payload.len());
                    payload[..n].copy_from_slice(&data[..n]);
                    (TransferStatus::Completed, n)
                }
                None => (TransferStatus::TimedOut, 0),
            }
        } else {
            let out_key = if setup.is_some() { 0x00 } else { endpoint };
            self.written
                .entry(out_key)
                .or_default()
                .push(payload.to_vec());
            (TransferStatus::Completed, payload.len())
        }
    }

    /// GET_DESCRIPTOR requests the scripted device can answer itself
    fn standard_answer(&self, handle: NativeHandle, setup: &ControlSetup) -> Option<Vec<u8>> {
        if setup.request_type != 0x80 || setup.request != request::GET_DESCRIPTOR {
            return None;
        }
        let spec = self.spec_for_handle(handle)?;
        let index = (setup.value & 0xFF) as u8;
        match (setup.value >> 8) as u8 {
            0x01 => Some(spec.descriptor.to_vec()),
            0x02 => spec.configs.get(usize::from(index)).cloned(),
            0x03 => string_descriptor(spec, index),
            _ => None,
        }
    }
}

fn string_descriptor(spec: &FakeDeviceSpec, index: u8) -> Option<Vec<u8>> {
    if index == 0 {
        let mut bytes = vec![(2 + spec.languages.len() * 2) as u8, 0x03];
        for lang in &spec.languages {
            bytes.extend_from_slice(&lang.to_le_bytes());
        }
        return Some(bytes);
    }
    spec.strings
        .get(&index)
        .map(|text| encode_string_descriptor(text))
}

fn notice_for(kind: HotplugEventKind, spec: &FakeDeviceSpec) -> HotplugNotice {
    HotplugNotice {
        kind,
        bus_number: spec.bus_number,
        address: spec.address,
        port_number: spec.port_numbers.last().copied().unwrap_or(0),
        descriptor: spec.descriptor_error.is_none().then_some(spec.descriptor),
    }
}

fn notify(callbacks: Vec<Arc<Mutex<HotplugCallback>>>, notice: &HotplugNotice) {
    for callback in callbacks {
        let mut callback = callback.lock().unwrap_or_else(|e| e.into_inner());
        (*callback)(notice.clone());
    }
}

fn payload_offset(kind: TransferKind) -> usize {
    if kind == TransferKind::Control {
        SETUP_PACKET_LEN
    } else {
        0
    }
}

fn is_in(setup: &TransferSetup, buffer: &[u8]) -> bool {
    match setup.kind {
        TransferKind::Control => buffer.first().is_some_and(|b| b & 0x80 != 0),
        _ => setup.endpoint & 0x80 != 0,
    }
}

fn finish_with(mut pending: PendingTransfer, status: TransferStatus, data: &[u8]) -> Delivery {
    let offset = payload_offset(pending.setup.kind);
    let capacity = pending.buffer.len().saturating_sub(offset);
    let actual_length = if is_in(&pending.setup, &pending.buffer) {
        let n = data.len().min(capacity);
        pending.buffer[offset..offset + n].copy_from_slice(&data[..n]);
        n
    } else {
        data.len().min(capacity)
    };
    (
        pending.on_complete,
        TransferCompletion {
            status,
            actual_length,
            buffer: pending.buffer,
        },
    )
}

fn deliver(deliveries: Vec<Delivery>) -> usize {
    let count = deliveries.len();
    for (callback, completion) in deliveries {
        callback(completion);
    }
    count
}

impl UsbBackend for FakeUsb {
    fn init(&self) -> Result<NativeContext> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let id = st.alloc_id();
        st.contexts.insert(
            id,
            ContextRecord {
                alive: true,
                log_level: 0,
            },
        );
        Ok(NativeContext(id))
    }

    fn exit(&self, ctx: NativeContext) -> ExitReport {
        let mut guard = self.lock();
        let st = &mut *guard;
        match st.contexts.get_mut(&ctx.0) {
            Some(c) if c.alive => c.alive = false,
            Some(_) => {
                st.counters.double_releases += 1;
                return ExitReport::default();
            }
            None => {
                st.counters.stale_ids += 1;
                return ExitReport::default();
            }
        }
        st.hotplugs.retain(|_, h| h.ctx != ctx.0);
        ExitReport {
            referenced_devices: st.devices.values().filter(|d| d.ctx == ctx.0).count(),
            open_handles: st.handles.values().filter(|h| h.ctx == ctx.0).count(),
        }
    }

    fn set_option(&self, ctx: NativeContext, option: NativeOption) -> Result<()> {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.check_ctx(ctx.0)?;
        let NativeOption::LogLevel(level) = option;
        if level > 4 {
            return Err(UsbError::InvalidParameter);
        }
        if let Some(c) = st.contexts.get_mut(&ctx.0) {
            c.log_level = level;
        }
        Ok(())
    }

    fn get_device_list(&self, ctx: NativeContext) -> Result<Vec<NativeDevice>> {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.check_ctx(ctx.0)?;

        let attached: Vec<(u64, FakeDeviceSpec)> = st
            .attached
            .iter()
            .map(|a| (a.slot, a.spec.clone()))
            .collect();
        let mut list = Vec::with_capacity(attached.len());
        for (slot, spec) in attached {
            let existing = st
                .devices
                .iter()
                .find(|(_, d)| d.ctx == ctx.0 && d.slot == slot)
                .map(|(id, _)| *id);
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = st.alloc_id();
                    st.devices.insert(
                        id,
                        DeviceRecord {
                            ctx: ctx.0,
                            slot,
                            spec,
                            refs: 0,
                        },
                    );
                    id
                }
            };
            if let Some(record) = st.devices.get_mut(&id) {
                record.refs += 1;
            }
            list.push(NativeDevice(id));
        }
        Ok(list)
    }

    fn ref_device(&self, device: NativeDevice) {
        let mut guard = self.lock();
        let st = &mut *guard;
        if st.device(device).is_ok()
            && let Some(record) = st.devices.get_mut(&device.0)
        {
            record.refs += 1;
        }
    }

    fn unref_device(&self, device: NativeDevice) {
        self.lock().release_device_ref(device.0);
    }

    fn device_descriptor(&self, device: NativeDevice) -> Result<[u8; 18]> {
        let mut st = self.lock();
        let spec = &st.device(device)?.spec;
        match &spec.descriptor_error {
            Some(error) => Err(error.clone()),
            None => Ok(spec.descriptor),
        }
    }

    fn config_descriptor(&self, device: NativeDevice, index: u8) -> Result<Vec<u8>> {
        self.lock()
            .device(device)?
            .spec
            .configs
            .get(usize::from(index))
            .cloned()
            .ok_or(UsbError::NotFound)
    }

    fn active_config_descriptor(&self, device: NativeDevice) -> Result<Vec<u8>> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let spec = &st.device(device)?.spec;
        spec.configs
            .get(spec.active_config)
            .cloned()
            .ok_or(UsbError::NotFound)
    }

    fn bus_number(&self, device: NativeDevice) -> Result<u8> {
        let mut st = self.lock();
        let spec = &st.device(device)?.spec;
        match &spec.location_error {
            Some(error) => Err(error.clone()),
            None => Ok(spec.bus_number),
        }
    }

    fn device_address(&self, device: NativeDevice) -> Result<u8> {
        let mut st = self.lock();
        let spec = &st.device(device)?.spec;
        match &spec.location_error {
            Some(error) => Err(error.clone()),
            None => Ok(spec.address),
        }
    }

    fn port_number(&self, device: NativeDevice) -> Result<u8> {
        Ok(self
            .lock()
            .device(device)?
            .spec
            .port_numbers
            .last()
            .copied()
            .unwrap_or(0))
    }

    fn port_numbers(&self, device: NativeDevice) -> Result<Vec<u8>> {
        Ok(self.lock().device(device)?.spec.port_numbers.clone())
    }

    fn speed(&self, device: NativeDevice) -> Result<DeviceSpeed> {
        Ok(self.lock().device(device)?.spec.speed)
    }

    fn open(&self, device: NativeDevice) -> Result<NativeHandle> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let (ctx, slot) = {
            let record = st.device(device)?;
            (record.ctx, record.slot)
        };
        if !st.is_connected(slot) {
            return Err(UsbError::NoDevice);
        }
        if let Some(record) = st.devices.get_mut(&device.0) {
            record.refs += 1;
        }
        let id = st.alloc_id();
        st.handles.insert(
            id,
            HandleRecord {
                ctx,
                device: device.0,
                slot,
                claimed: BTreeSet::new(),
                detached: BTreeSet::new(),
            },
        );
        Ok(NativeHandle(id))
    }

    fn close(&self, handle: NativeHandle) {
        let mut guard = self.lock();
        let st = &mut *guard;
        match st.handles.remove(&handle.0) {
            Some(record) => st.release_device_ref(record.device),
            None => st.counters.double_releases += 1,
        }
    }

    fn claim_interface(&self, handle: NativeHandle, interface: u8) -> Result<()> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let bound = st
            .spec_for_handle(handle)
            .is_some_and(|s| s.kernel_drivers.contains(&interface));
        let record = st.handle(handle)?;
        if bound && !record.detached.contains(&interface) {
            return Err(UsbError::ResourceBusy);
        }
        record.claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&self, handle: NativeHandle, interface: u8) -> Result<()> {
        let mut guard = self.lock();
        let st = &mut *guard;
        if st.handle(handle)?.claimed.remove(&interface) {
            Ok(())
        } else {
            Err(UsbError::NotFound)
        }
    }

    fn set_interface_alt_setting(
        &self,
        handle: NativeHandle,
        interface: u8,
        _alt_setting: u8,
    ) -> Result<()> {
        let mut guard = self.lock();
        let st = &mut *guard;
        if st.handle(handle)?.claimed.contains(&interface) {
            Ok(())
        } else {
            Err(UsbError::NotFound)
        }
    }

    fn kernel_driver_active(&self, handle: NativeHandle, interface: u8) -> Result<bool> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let bound = st
            .spec_for_handle(handle)
            .is_some_and(|s| s.kernel_drivers.contains(&interface));
        let record = st.handle(handle)?;
        Ok(bound && !record.detached.contains(&interface))
    }

    fn detach_kernel_driver(&self, handle: NativeHandle, interface: u8) -> Result<()> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let bound = st
            .spec_for_handle(handle)
            .is_some_and(|s| s.kernel_drivers.contains(&interface));
        let record = st.handle(handle)?;
        if bound && record.detached.insert(interface) {
            Ok(())
        } else {
            Err(UsbError::NotFound)
        }
    }

    fn attach_kernel_driver(&self, handle: NativeHandle, interface: u8) -> Result<()> {
        let mut guard = self.lock();
        let st = &mut *guard;
        if st.handle(handle)?.detached.remove(&interface) {
            Ok(())
        } else {
            Err(UsbError::NotFound)
        }
    }

    fn reset_device(&self, handle: NativeHandle) -> Result<()> {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.handle(handle)?;
        st.resets += 1;
        Ok(())
    }

    fn clear_halt(&self, handle: NativeHandle, _endpoint: u8) -> Result<()> {
        self.lock().handle(handle).map(|_| ())
    }

    fn get_string_descriptor(
        &self,
        handle: NativeHandle,
        index: u8,
        _language: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.handle(handle)?;
        let bytes = st
            .spec_for_handle(handle)
            .and_then(|spec| string_descriptor(spec, index))
            .ok_or(UsbError::Pipe)?;
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn get_string_descriptor_ascii(
        &self,
        handle: NativeHandle,
        index: u8,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.handle(handle)?;
        let text = st
            .spec_for_handle(handle)
            .and_then(|spec| spec.strings.get(&index).cloned())
            .ok_or(UsbError::Pipe)?;
        let ascii: Vec<u8> = text
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect();
        let n = ascii.len().min(buf.len());
        buf[..n].copy_from_slice(&ascii[..n]);
        Ok(n)
    }

    fn control_transfer(
        &self,
        handle: NativeHandle,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(TransferStatus, usize)> {
        self.blocking_transfer(handle, 0, TransferKind::Control, Some(setup), data, timeout)
    }

    fn bulk_transfer(
        &self,
        handle: NativeHandle,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(TransferStatus, usize)> {
        self.blocking_transfer(handle, endpoint, TransferKind::Bulk, None, data, timeout)
    }

    fn interrupt_transfer(
        &self,
        handle: NativeHandle,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(TransferStatus, usize)> {
        self.blocking_transfer(handle, endpoint, TransferKind::Interrupt, None, data, timeout)
    }

    fn alloc_transfer(&self) -> Result<NativeTransfer> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let id = st.alloc_id();
        st.transfers.insert(id, TransferRecord::default());
        Ok(NativeTransfer(id))
    }

    fn submit_transfer(
        &self,
        transfer: NativeTransfer,
        setup: TransferSetup,
        mut buffer: Vec<u8>,
        on_complete: CompletionCallback,
    ) -> Result<()> {
        let completion = {
            let mut guard = self.lock();
            let st = &mut *guard;
            match st.transfers.get(&transfer.0) {
                None => {
                    st.counters.stale_ids += 1;
                    return Err(UsbError::NotFound);
                }
                Some(record) if record.pending.is_some() => return Err(UsbError::ResourceBusy),
                Some(_) => {}
            }
            st.handle(setup.handle)?;

            let control = if setup.kind == TransferKind::Control {
                let header: [u8; SETUP_PACKET_LEN] = buffer
                    .get(..SETUP_PACKET_LEN)
                    .and_then(|h| h.try_into().ok())
                    .ok_or(UsbError::InvalidParameter)?;
                Some(ControlSetup::from_bytes(&header))
            } else {
                None
            };
            st.counters.submitted += 1;

            match st.behavior(setup.endpoint, setup.kind) {
                TransferBehavior::Respond => {
                    let offset = payload_offset(setup.kind);
                    let (status, actual_length) =
                        st.respond(setup.handle, setup.endpoint, control, &mut buffer[offset..]);
                    TransferCompletion {
                        status,
                        actual_length,
                        buffer,
                    }
                }
                TransferBehavior::Fail(status) => {
                    if let Some(control) = control {
                        st.control_log.push(control);
                    }
                    TransferCompletion {
                        status,
                        actual_length: 0,
                        buffer,
                    }
                }
                TransferBehavior::Hold | TransferBehavior::CompleteOnCancel => {
                    if let Some(control) = control {
                        st.control_log.push(control);
                    }
                    if let Some(record) = st.transfers.get_mut(&transfer.0) {
                        record.pending = Some(PendingTransfer {
                            setup,
                            buffer,
                            on_complete,
                        });
                    }
                    return Ok(());
                }
            }
        };
        on_complete(completion);
        Ok(())
    }

    fn cancel_transfer(&self, transfer: NativeTransfer) -> Result<()> {
        let delivery = {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.counters.cancel_calls += 1;
            let Some(record) = st.transfers.get(&transfer.0) else {
                st.counters.stale_ids += 1;
                return Err(UsbError::NotFound);
            };
            let Some(pending) = record.pending.as_ref() else {
                return Err(UsbError::NotFound);
            };
            match st.behavior(pending.setup.endpoint, pending.setup.kind) {
                TransferBehavior::CompleteOnCancel => st
                    .transfers
                    .get_mut(&transfer.0)
                    .and_then(|r| r.pending.take())
                    .map(|p| finish_with(p, TransferStatus::Cancelled, &[])),
                _ => None,
            }
        };
        if let Some(delivery) = delivery {
            deliver(vec![delivery]);
        }
        Ok(())
    }

    fn free_transfer(&self, transfer: NativeTransfer) {
        let mut guard = self.lock();
        let st = &mut *guard;
        match st.transfers.remove(&transfer.0) {
            Some(record) if record.pending.is_some() => st.counters.freed_in_flight += 1,
            Some(_) => {}
            None => st.counters.double_releases += 1,
        }
    }

    fn register_hotplug(
        &self,
        ctx: NativeContext,
        filter: HotplugFilter,
        callback: HotplugCallback,
    ) -> Result<NativeHotplug> {
        let callback = Arc::new(Mutex::new(callback));
        let (id, initial) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.check_ctx(ctx.0)?;
            let id = st.alloc_id();
            st.hotplugs.insert(
                id,
                HotplugRecord {
                    ctx: ctx.0,
                    filter,
                    callback: callback.clone(),
                },
            );
            let initial: Vec<HotplugNotice> = if filter.enumerate {
                st.attached
                    .iter()
                    .filter(|a| filter.matches(&a.spec.descriptor))
                    .map(|a| notice_for(HotplugEventKind::Arrived, &a.spec))
                    .collect()
            } else {
                Vec::new()
            };
            (id, initial)
        };
        for notice in &initial {
            notify(vec![callback.clone()], notice);
        }
        Ok(NativeHotplug(id))
    }

    fn deregister_hotplug(&self, ctx: NativeContext, hotplug: NativeHotplug) {
        let mut guard = self.lock();
        let st = &mut *guard;
        if !st.contexts.get(&ctx.0).is_some_and(|c| c.alive) {
            st.counters.use_after_exit += 1;
        }
        if st.hotplugs.remove(&hotplug.0).is_none() {
            st.counters.double_releases += 1;
        }
    }

    fn strerror(&self, error: &UsbError) -> String {
        format!("fake: {}", error)
    }
}

impl FakeUsb {
    /// Blocking transfers share the pending table with submitted ones, so
    /// [`FakeUsb::complete_pending`] and device departure finish them too
    fn blocking_transfer(
        &self,
        handle: NativeHandle,
        endpoint: u8,
        kind: TransferKind,
        setup: Option<ControlSetup>,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(TransferStatus, usize)> {
        let (tx, rx) = mpsc::channel();
        let id = {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.handle(handle)?;
            match st.behavior(endpoint, kind) {
                TransferBehavior::Respond => {
                    return Ok(st.respond(handle, endpoint, setup, data));
                }
                TransferBehavior::Fail(status) => return Ok((status, 0)),
                TransferBehavior::Hold | TransferBehavior::CompleteOnCancel => {}
            }

            let mut buffer = Vec::with_capacity(SETUP_PACKET_LEN + data.len());
            if let Some(setup) = setup {
                buffer.extend_from_slice(&setup.to_bytes());
            }
            buffer.extend_from_slice(data);

            let id = st.alloc_id();
            st.transfers.insert(
                id,
                TransferRecord {
                    pending: Some(PendingTransfer {
                        setup: TransferSetup {
                            handle,
                            endpoint,
                            kind,
                            timeout,
                        },
                        buffer,
                        on_complete: Box::new(move |completion| {
                            let _ = tx.send(completion);
                        }),
                    }),
                },
            );
            id
        };
        debug!("Blocking transfer {} held on {:#04x}", id, endpoint);

        let completion = if timeout.is_zero() {
            rx.recv().ok()
        } else {
            match rx.recv_timeout(timeout) {
                Ok(completion) => Some(completion),
                Err(_) => {
                    let abandoned = self
                        .lock()
                        .transfers
                        .remove(&id)
                        .and_then(|record| record.pending)
                        .is_some();
                    // Lost the race with a completion already on its way
                    if abandoned { None } else { rx.recv().ok() }
                }
            }
        };
        self.lock().transfers.remove(&id);

        let Some(completion) = completion else {
            return Ok((TransferStatus::TimedOut, 0));
        };
        let offset = payload_offset(kind);
        let payload = completion.buffer.get(offset..).unwrap_or_default();
        let actual_length = completion.actual_length.min(payload.len()).min(data.len());
        let direction_in = match setup {
            Some(setup) => setup.direction() == Direction::In,
            None => endpoint & 0x80 != 0,
        };
        if direction_in {
            data[..actual_length].copy_from_slice(&payload[..actual_length]);
        }
        Ok((completion.status, actual_length))
    }
}
