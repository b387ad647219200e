//! Synchronous transfer bridge
//!
//! Turns the native submit-and-callback transfer primitive into a blocking
//! call with a deadline and cooperative cancellation.
//!
//! The completion callback is the only authority on when the native layer
//! has stopped touching the transfer buffer. Whatever woke the caller first
//! (completion, deadline, or a [`CancellationToken`]), the bridge waits for
//! that callback before freeing the native transfer record.

use crate::native::{
    NativeHandle, TransferCompletion, TransferKind, TransferSetup, UsbBackend,
};
use protocol::{ControlSetup, Direction, Result, SETUP_PACKET_LEN, TransferStatus, UsbError};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Added to the transfer timeout so the native timeout normally fires first
/// and reports partial progress
const DEADLINE_SLACK: Duration = Duration::from_millis(50);

// ============================================================================
// Cancellation
// ============================================================================

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    waiters: Vec<Weak<CompletionSignal>>,
}

/// Cooperative cancellation shared between a caller and its transfers
///
/// Cloning yields another handle to the same token. Cancelling wakes every
/// transfer currently waiting on it; transfers started afterwards are
/// cancelled as soon as they are submitted.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Mutex<TokenState>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let waiters = {
            let mut state = lock(&self.inner);
            state.cancelled = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters.iter().filter_map(Weak::upgrade) {
            waiter.request_cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.inner).cancelled
    }

    fn register(&self, signal: &Arc<CompletionSignal>) {
        let mut state = lock(&self.inner);
        if state.cancelled {
            drop(state);
            signal.request_cancel();
            return;
        }
        state.waiters.retain(|w| w.strong_count() > 0);
        state.waiters.push(Arc::downgrade(signal));
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// Completion signal
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Completed,
    Cancelled,
    TimedOut,
}

#[derive(Default)]
struct SignalState {
    completion: Option<TransferCompletion>,
    cancel_requested: bool,
}

/// One-shot rendezvous between the native callback and the waiting caller
#[derive(Default)]
struct CompletionSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl CompletionSignal {
    fn complete(&self, completion: TransferCompletion) {
        lock(&self.state).completion = Some(completion);
        self.cond.notify_all();
    }

    fn request_cancel(&self) {
        lock(&self.state).cancel_requested = true;
        self.cond.notify_all();
    }

    /// Block until completion, a cancel request, or `deadline`
    fn wait_first(&self, deadline: Option<Instant>) -> Wake {
        let mut state = lock(&self.state);
        loop {
            if state.completion.is_some() {
                return Wake::Completed;
            }
            if state.cancel_requested {
                return Wake::Cancelled;
            }
            state = match deadline {
                None => self.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wake::TimedOut;
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Block until the native callback has fired
    fn wait_completion(&self) -> TransferCompletion {
        let mut state = lock(&self.state);
        loop {
            if let Some(completion) = state.completion.take() {
                return completion;
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Requests and outcomes
// ============================================================================

/// Where a transfer goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferTarget {
    Control(ControlSetup),
    Bulk(u8),
    Interrupt(u8),
}

/// One synchronous transfer
///
/// For IN transfers `buffer` is zeroed space for the device's data; for OUT
/// transfers it holds the payload. Control payloads never include the setup
/// packet. A zero `timeout` waits forever.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub target: TransferTarget,
    pub buffer: Vec<u8>,
    pub timeout: Duration,
    pub cancel: Option<CancellationToken>,
}

impl TransferRequest {
    /// Device-to-host control request reading `setup.length` bytes
    pub fn control_in(setup: ControlSetup, timeout: Duration) -> Result<Self> {
        if setup.direction() != Direction::In {
            return Err(UsbError::InvalidParameter);
        }
        Ok(Self::new(
            TransferTarget::Control(setup),
            vec![0; usize::from(setup.length)],
            timeout,
        ))
    }

    /// Host-to-device control request; `setup.length` must match `data`
    pub fn control_out(setup: ControlSetup, data: &[u8], timeout: Duration) -> Result<Self> {
        if setup.direction() != Direction::Out || usize::from(setup.length) != data.len() {
            return Err(UsbError::InvalidParameter);
        }
        Ok(Self::new(
            TransferTarget::Control(setup),
            data.to_vec(),
            timeout,
        ))
    }

    pub fn bulk_in(endpoint: u8, length: usize, timeout: Duration) -> Result<Self> {
        check_endpoint(endpoint, Direction::In)?;
        Ok(Self::new(
            TransferTarget::Bulk(endpoint),
            vec![0; length],
            timeout,
        ))
    }

    pub fn bulk_out(endpoint: u8, data: &[u8], timeout: Duration) -> Result<Self> {
        check_endpoint(endpoint, Direction::Out)?;
        Ok(Self::new(
            TransferTarget::Bulk(endpoint),
            data.to_vec(),
            timeout,
        ))
    }

    pub fn interrupt_in(endpoint: u8, length: usize, timeout: Duration) -> Result<Self> {
        check_endpoint(endpoint, Direction::In)?;
        Ok(Self::new(
            TransferTarget::Interrupt(endpoint),
            vec![0; length],
            timeout,
        ))
    }

    pub fn interrupt_out(endpoint: u8, data: &[u8], timeout: Duration) -> Result<Self> {
        check_endpoint(endpoint, Direction::Out)?;
        Ok(Self::new(
            TransferTarget::Interrupt(endpoint),
            data.to_vec(),
            timeout,
        ))
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn new(target: TransferTarget, buffer: Vec<u8>, timeout: Duration) -> Self {
        Self {
            target,
            buffer,
            timeout,
            cancel: None,
        }
    }

    pub fn direction(&self) -> Direction {
        match self.target {
            TransferTarget::Control(setup) => setup.direction(),
            TransferTarget::Bulk(endpoint) | TransferTarget::Interrupt(endpoint) => {
                if endpoint & 0x80 != 0 {
                    Direction::In
                } else {
                    Direction::Out
                }
            }
        }
    }

    fn kind(&self) -> TransferKind {
        match self.target {
            TransferTarget::Control(_) => TransferKind::Control,
            TransferTarget::Bulk(_) => TransferKind::Bulk,
            TransferTarget::Interrupt(_) => TransferKind::Interrupt,
        }
    }

    fn endpoint(&self) -> u8 {
        match self.target {
            TransferTarget::Control(_) => 0,
            TransferTarget::Bulk(endpoint) | TransferTarget::Interrupt(endpoint) => endpoint,
        }
    }

    /// Buffer handed to the native layer; control transfers lead with the setup packet
    fn into_native_buffer(self) -> Vec<u8> {
        match self.target {
            TransferTarget::Control(setup) => {
                let mut buffer = Vec::with_capacity(SETUP_PACKET_LEN + self.buffer.len());
                buffer.extend_from_slice(&setup.to_bytes());
                buffer.extend_from_slice(&self.buffer);
                buffer
            }
            _ => self.buffer,
        }
    }
}

fn check_endpoint(endpoint: u8, direction: Direction) -> Result<()> {
    let is_in = endpoint & 0x80 != 0;
    if is_in == (direction == Direction::In) {
        Ok(())
    } else {
        Err(UsbError::InvalidParameter)
    }
}

/// What the native layer reported for a finished transfer
///
/// `actual_length` is reported whatever the status, so a timed out read can
/// still hand back the bytes that did arrive. `data` holds those bytes for
/// IN transfers and is empty for OUT transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status: TransferStatus,
    pub actual_length: usize,
    pub data: Vec<u8>,
}

impl TransferOutcome {
    /// `Ok(self)` only when the transfer completed
    pub fn into_result(self) -> Result<Self> {
        self.status.into_result().map(|()| self)
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransferStatus::Completed
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Run `request` through the asynchronous native primitive and wait for it
pub(crate) fn run_bridged(
    backend: &dyn UsbBackend,
    handle: NativeHandle,
    request: TransferRequest,
) -> Result<TransferOutcome> {
    let setup = TransferSetup {
        handle,
        endpoint: request.endpoint(),
        kind: request.kind(),
        timeout: request.timeout,
    };
    let direction = request.direction();
    let timeout = request.timeout;
    let cancel = request.cancel.clone();
    let buffer = request.into_native_buffer();

    let transfer = backend.alloc_transfer()?;
    let signal = Arc::new(CompletionSignal::default());
    let producer = signal.clone();

    if let Err(e) = backend.submit_transfer(
        transfer,
        setup,
        buffer,
        Box::new(move |completion| producer.complete(completion)),
    ) {
        debug!("Transfer submission failed on {:#04x}: {}", setup.endpoint, e);
        backend.free_transfer(transfer);
        return Err(e);
    }

    if let Some(token) = &cancel {
        token.register(&signal);
    }

    let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout + DEADLINE_SLACK);
    let wake = signal.wait_first(deadline);
    if wake != Wake::Completed {
        debug!(
            "Cancelling transfer on {:#04x} ({:?})",
            setup.endpoint, wake
        );
        if let Err(e) = backend.cancel_transfer(transfer) {
            debug!("Native cancel returned {}", e);
        }
    }
    let completion = signal.wait_completion();
    backend.free_transfer(transfer);

    Ok(outcome_from(completion, setup.kind, direction))
}

/// Run `request` on the native blocking primitives
///
/// Cancellation tokens are not observed; the native timeout bounds the call.
pub(crate) fn run_direct(
    backend: &dyn UsbBackend,
    handle: NativeHandle,
    request: TransferRequest,
) -> Result<TransferOutcome> {
    let direction = request.direction();
    let TransferRequest {
        target,
        mut buffer,
        timeout,
        ..
    } = request;

    let result = match target {
        TransferTarget::Control(setup) => {
            backend.control_transfer(handle, setup, &mut buffer, timeout)
        }
        TransferTarget::Bulk(endpoint) => {
            backend.bulk_transfer(handle, endpoint, &mut buffer, timeout)
        }
        TransferTarget::Interrupt(endpoint) => {
            backend.interrupt_transfer(handle, endpoint, &mut buffer, timeout)
        }
    };

    let (status, actual_length) = result?;
    let actual_length = actual_length.min(buffer.len());

    let data = if direction == Direction::In {
        buffer.truncate(actual_length);
        buffer
    } else {
        Vec::new()
    };
    Ok(TransferOutcome {
        status,
        actual_length,
        data,
    })
}

fn outcome_from(
    completion: TransferCompletion,
    kind: TransferKind,
    direction: Direction,
) -> TransferOutcome {
    let TransferCompletion {
        status,
        actual_length,
        mut buffer,
    } = completion;

    let offset = if kind == TransferKind::Control {
        SETUP_PACKET_LEN.min(buffer.len())
    } else {
        0
    };
    let mut payload = buffer.split_off(offset);
    let actual_length = actual_length.min(payload.len());

    let data = if direction == Direction::In {
        payload.truncate(actual_length);
        payload
    } else {
        Vec::new()
    };
    TransferOutcome {
        status,
        actual_length,
        data,
    }
}
