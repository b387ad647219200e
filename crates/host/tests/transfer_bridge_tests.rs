//! Transfer Bridge Integration Tests
//!
//! Blocking transfers built on the asynchronous native primitive, driven
//! through `DeviceHandle` against the in-memory backend.
//!
//! # Test Scenarios
//! - Deadline expiry cancels exactly once and waits for the completion
//! - Cancellation tokens, before and during a transfer
//! - Partial data on timeout, overflow, stall and device departure
//! - Control transfers keep the setup packet out of the returned data
//! - Direct mode on the native blocking primitives
//!
//! Run with: `cargo test -p host --test transfer_bridge_tests`

use common::TransferMode;
use common::init_test_logging;
use common::test_utils::device_descriptor_bytes;
use host::native::{FakeDeviceSpec, FakeUsb, TransferBehavior};
use host::usb::{CancellationToken, Context, ContextOptions, DeviceHandle, TransferRequest};
use protocol::{ControlSetup, TransferStatus, UsbError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const BULK_IN: u8 = 0x81;
const BULK_OUT: u8 = 0x02;
const INTERRUPT_IN: u8 = 0x83;
const SETTLE: Duration = Duration::from_secs(2);

fn open_with(options: ContextOptions) -> (Arc<FakeUsb>, Context, Arc<DeviceHandle>) {
    init_test_logging();
    let spec = FakeDeviceSpec::new(1, 4, &device_descriptor_bytes(0x1234, 0x5678, 0x0200));
    let fake = Arc::new(FakeUsb::with_devices([spec]));
    let ctx = Context::new(fake.clone(), options).unwrap();
    let handle = ctx.devices().unwrap().get(0).unwrap().open().unwrap();
    (fake, ctx, Arc::new(handle))
}

fn open() -> (Arc<FakeUsb>, Context, Arc<DeviceHandle>) {
    open_with(ContextOptions::default())
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + SETTLE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

// ============================================================================
// Deadlines
// ============================================================================

#[test]
fn test_deadline_cancels_once_then_waits_for_completion() {
    let (fake, _ctx, handle) = open();
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::Hold);

    let started = Instant::now();
    let worker = {
        let handle = handle.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            handle.read_bulk(BULK_IN, &mut buf, Duration::from_millis(50))
        })
    };

    assert!(wait_until(|| fake.counters().cancel_calls == 1));
    assert!(started.elapsed() >= Duration::from_millis(50));
    // Held transfers ignore cancel, so the caller must still be blocked
    thread::sleep(Duration::from_millis(20));
    assert!(!worker.is_finished());
    assert_eq!(fake.pending_transfers(), 1);

    assert_eq!(fake.complete_pending(TransferStatus::Cancelled, &[]), 1);
    assert_eq!(worker.join().unwrap(), Err(UsbError::Interrupted));

    let counters = fake.counters();
    assert_eq!(counters.cancel_calls, 1);
    assert_eq!(counters.misuse(), 0);
}

#[test]
fn test_native_cancel_completes_promptly() {
    let (fake, _ctx, handle) = open();
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::CompleteOnCancel);

    let started = Instant::now();
    let request = TransferRequest::bulk_in(BULK_IN, 32, Duration::from_millis(30)).unwrap();
    let outcome = handle.submit(request).unwrap();

    assert_eq!(outcome.status, TransferStatus::Cancelled);
    assert_eq!(outcome.actual_length, 0);
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(fake.pending_transfers(), 0);
    assert_eq!(fake.counters().misuse(), 0);
}

#[test]
fn test_timeout_reports_partial_data() {
    let (fake, _ctx, handle) = open();
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::Hold);

    let worker = {
        let handle = handle.clone();
        thread::spawn(move || {
            let request = TransferRequest::bulk_in(BULK_IN, 16, Duration::from_secs(10)).unwrap();
            handle.submit(request)
        })
    };

    assert!(fake.wait_for_pending(1, SETTLE));
    fake.complete_pending(TransferStatus::TimedOut, &[1, 2, 3]);

    let outcome = worker.join().unwrap().unwrap();
    assert_eq!(outcome.status, TransferStatus::TimedOut);
    assert_eq!(outcome.actual_length, 3);
    assert_eq!(outcome.data, vec![1, 2, 3]);
    assert_eq!(outcome.into_result(), Err(UsbError::Timeout));
    assert_eq!(fake.counters().cancel_calls, 0);
}

// ============================================================================
// Cancellation Tokens
// ============================================================================

#[test]
fn test_token_cancels_waiting_transfer() {
    let (fake, _ctx, handle) = open();
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::Hold);
    let token = CancellationToken::new();

    let worker = {
        let handle = handle.clone();
        let token = token.clone();
        thread::spawn(move || {
            // Zero timeout: only the token can end the wait
            let request = TransferRequest::bulk_in(BULK_IN, 8, Duration::ZERO)
                .unwrap()
                .with_cancel(token);
            handle.submit(request)
        })
    };

    assert!(fake.wait_for_pending(1, SETTLE));
    token.cancel();
    assert!(wait_until(|| fake.counters().cancel_calls == 1));

    fake.complete_pending(TransferStatus::Cancelled, &[]);
    let outcome = worker.join().unwrap().unwrap();
    assert_eq!(outcome.status, TransferStatus::Cancelled);
    assert!(token.is_cancelled());
    assert_eq!(fake.counters().misuse(), 0);
}

#[test]
fn test_cancelled_token_stops_new_transfer() {
    let (fake, _ctx, handle) = open();
    fake.set_transfer_behavior(INTERRUPT_IN, TransferBehavior::CompleteOnCancel);
    let token = CancellationToken::new();
    token.cancel();

    let request = TransferRequest::interrupt_in(INTERRUPT_IN, 8, Duration::ZERO)
        .unwrap()
        .with_cancel(token);
    let outcome = handle.submit(request).unwrap();

    assert_eq!(outcome.status, TransferStatus::Cancelled);
    assert_eq!(fake.counters().cancel_calls, 1);
}

#[test]
fn test_one_token_cancels_several_transfers() {
    let (fake, _ctx, handle) = open();
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::CompleteOnCancel);
    fake.set_transfer_behavior(INTERRUPT_IN, TransferBehavior::CompleteOnCancel);
    let token = CancellationToken::new();

    let workers: Vec<_> = [
        TransferRequest::bulk_in(BULK_IN, 8, Duration::ZERO).unwrap(),
        TransferRequest::interrupt_in(INTERRUPT_IN, 8, Duration::ZERO).unwrap(),
    ]
    .into_iter()
    .map(|request| {
        let handle = handle.clone();
        let request = request.with_cancel(token.clone());
        thread::spawn(move || handle.submit(request))
    })
    .collect();

    assert!(fake.wait_for_pending(2, SETTLE));
    token.cancel();
    for worker in workers {
        assert_eq!(
            worker.join().unwrap().unwrap().status,
            TransferStatus::Cancelled
        );
    }
    assert_eq!(fake.counters().cancel_calls, 2);
}

// ============================================================================
// Statuses
// ============================================================================

#[test]
fn test_bulk_round_trip() {
    let (fake, _ctx, handle) = open();
    fake.queue_in(BULK_IN, &[0xAA, 0xBB]);

    let mut buf = [0u8; 8];
    let n = handle.read_bulk(BULK_IN, &mut buf, Duration::from_secs(1)).unwrap();
    assert_eq!(&buf[..n], &[0xAA, 0xBB]);

    let sent = handle
        .write_bulk(BULK_OUT, b"hello", Duration::from_secs(1))
        .unwrap();
    assert_eq!(sent, 5);
    assert_eq!(fake.written(BULK_OUT), vec![b"hello".to_vec()]);
}

#[test]
fn test_overflow_keeps_received_bytes() {
    let (fake, _ctx, handle) = open();
    fake.queue_in(BULK_IN, &[7u8; 16]);

    let request = TransferRequest::bulk_in(BULK_IN, 8, Duration::from_secs(1)).unwrap();
    let outcome = handle.submit(request).unwrap();
    assert_eq!(outcome.status, TransferStatus::Overflow);
    assert_eq!(outcome.data, vec![7u8; 8]);
}

#[test]
fn test_stall_maps_to_resource_busy() {
    let (fake, _ctx, handle) = open();
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::Fail(TransferStatus::Stall));

    let mut buf = [0u8; 4];
    let err = handle
        .read_bulk(BULK_IN, &mut buf, Duration::from_secs(1))
        .unwrap_err();
    assert_eq!(err, UsbError::ResourceBusy);
    assert!(err.is_retryable());
}

#[test]
fn test_departure_completes_in_flight_transfer() {
    let (fake, _ctx, handle) = open();
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::Hold);

    let worker = {
        let handle = handle.clone();
        thread::spawn(move || {
            let request = TransferRequest::bulk_in(BULK_IN, 8, Duration::ZERO).unwrap();
            handle.submit(request)
        })
    };
    assert!(fake.wait_for_pending(1, SETTLE));
    assert!(fake.simulate_departure(1, 4));

    let outcome = worker.join().unwrap().unwrap();
    assert_eq!(outcome.status, TransferStatus::NoDevice);

    // Submission now fails outright and must not leak the native transfer
    let mut buf = [0u8; 8];
    assert_eq!(
        handle.read_bulk(BULK_IN, &mut buf, Duration::from_millis(10)),
        Err(UsbError::NoDevice)
    );
    assert_eq!(fake.counters().misuse(), 0);
}

#[test]
fn test_request_validation() {
    assert_eq!(
        TransferRequest::bulk_in(BULK_OUT, 8, Duration::ZERO).unwrap_err(),
        UsbError::InvalidParameter
    );
    assert_eq!(
        TransferRequest::interrupt_out(INTERRUPT_IN, &[1], Duration::ZERO).unwrap_err(),
        UsbError::InvalidParameter
    );
    assert_eq!(
        TransferRequest::control_in(ControlSetup::set_configuration(1), Duration::ZERO)
            .unwrap_err(),
        UsbError::InvalidParameter
    );
}

// ============================================================================
// Control Transfers
// ============================================================================

#[test]
fn test_control_in_strips_setup_packet() {
    let (fake, _ctx, handle) = open();
    let setup = ControlSetup::get_descriptor(0x01, 0, 0, 18);

    let data = handle.read_control(setup, Duration::from_secs(1)).unwrap();
    assert_eq!(data, device_descriptor_bytes(0x1234, 0x5678, 0x0200));
    assert_eq!(fake.control_requests(), vec![setup]);
}

#[test]
fn test_control_out_payload() {
    let (fake, _ctx, handle) = open();
    let setup = ControlSetup::from_raw(0x21, 0x01, 0x0200, 0x0100, 2);

    let n = handle
        .write_control(setup, &[0x10, 0x20], Duration::from_secs(1))
        .unwrap();
    assert_eq!(n, 2);
    assert_eq!(fake.written(0x00), vec![vec![0x10, 0x20]]);
}

#[test]
fn test_control_transfer_fills_buffer() {
    let (fake, _ctx, handle) = open();
    fake.queue_in(0x80, &[0x01]);

    let mut buf = [0u8; 1];
    let n = handle
        .control_transfer(ControlSetup::get_configuration(), &mut buf, Duration::from_secs(1))
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(buf, [0x01]);
}

// ============================================================================
// Direct Mode And Disposal
// ============================================================================

#[test]
fn test_direct_mode_uses_blocking_primitives() {
    let (fake, _ctx, handle) = open_with(ContextOptions {
        transfer_mode: TransferMode::Direct,
        ..Default::default()
    });
    fake.queue_in(BULK_IN, &[5, 6, 7]);

    let mut buf = [0u8; 8];
    assert_eq!(
        handle.read_bulk(BULK_IN, &mut buf, Duration::from_secs(1)),
        Ok(3)
    );
    assert_eq!(fake.counters().submitted, 0);

    fake.set_transfer_behavior(BULK_IN, TransferBehavior::Hold);
    assert_eq!(
        handle.read_bulk(BULK_IN, &mut buf, Duration::from_millis(20)),
        Err(UsbError::Timeout)
    );

    // `submit` always goes through the bridge
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::Respond);
    fake.queue_in(BULK_IN, &[9]);
    let request = TransferRequest::bulk_in(BULK_IN, 8, Duration::from_secs(1)).unwrap();
    assert_eq!(handle.submit(request).unwrap().data, vec![9]);
    assert_eq!(fake.counters().submitted, 1);
}

#[test]
fn test_overflow_keeps_partial_data_in_both_modes() {
    for mode in [TransferMode::Bridge, TransferMode::Direct] {
        let (fake, _ctx, handle) = open_with(ContextOptions {
            transfer_mode: mode,
            ..Default::default()
        });
        let sent: Vec<u8> = (0..16).collect();
        fake.queue_in(BULK_IN, &sent);

        let request = TransferRequest::bulk_in(BULK_IN, 8, Duration::from_secs(1)).unwrap();
        let outcome = handle.transfer(request).unwrap();
        assert_eq!(outcome.status, TransferStatus::Overflow, "{:?}", mode);
        assert_eq!(outcome.actual_length, 8, "{:?}", mode);
        assert_eq!(outcome.data, sent[..8].to_vec(), "{:?}", mode);
    }
}

#[test]
fn test_direct_mode_zero_timeout_waits_for_completion() {
    let (fake, _ctx, handle) = open_with(ContextOptions {
        transfer_mode: TransferMode::Direct,
        ..Default::default()
    });
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::Hold);

    let worker = {
        let handle = handle.clone();
        thread::spawn(move || {
            let request = TransferRequest::bulk_in(BULK_IN, 8, Duration::ZERO).unwrap();
            handle.transfer(request)
        })
    };

    assert!(fake.wait_for_pending(1, SETTLE));
    thread::sleep(Duration::from_millis(20));
    assert!(!worker.is_finished());

    assert_eq!(fake.complete_pending(TransferStatus::Completed, &[1, 2]), 1);
    let outcome = worker.join().unwrap().unwrap();
    assert_eq!(outcome.status, TransferStatus::Completed);
    assert_eq!(outcome.data, vec![1, 2]);
    assert_eq!(fake.counters().cancel_calls, 0);
}

#[test]
fn test_transfer_after_context_dispose_fails() {
    let (fake, ctx, handle) = open();
    ctx.dispose();

    let mut buf = [0u8; 8];
    assert!(matches!(
        handle.read_bulk(BULK_IN, &mut buf, Duration::from_millis(10)),
        Err(UsbError::AlreadyDisposed(_))
    ));
    assert_eq!(fake.counters().submitted, 0);

    handle.dispose();
    assert_eq!(fake.live_contexts(), 0);
    assert_eq!(fake.counters().misuse(), 0);
}

#[test]
fn test_dispose_waits_for_in_flight_transfer() {
    let (fake, _ctx, handle) = open();
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::Hold);

    let worker = {
        let handle = handle.clone();
        thread::spawn(move || {
            let request = TransferRequest::bulk_in(BULK_IN, 8, Duration::ZERO).unwrap();
            handle.submit(request)
        })
    };
    assert!(fake.wait_for_pending(1, SETTLE));

    let closer = {
        let handle = handle.clone();
        thread::spawn(move || handle.dispose())
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!closer.is_finished());
    assert_eq!(fake.open_handles(), 1);

    fake.complete_pending(TransferStatus::Completed, &[1]);
    assert_eq!(worker.join().unwrap().unwrap().data, vec![1]);
    closer.join().unwrap();
    assert_eq!(fake.open_handles(), 0);
    assert_eq!(fake.counters().misuse(), 0);
}
