//! USB Worker Integration Tests
//!
//! The worker thread driven through the async bridge, with the in-memory
//! backend standing in for libusb.
//!
//! # Test Scenarios
//! - List, open, transfer and close through `UsbBridge`
//! - Unknown sessions and keys
//! - Zero timeouts fall back to the context default
//! - Hotplug arrivals and departures become `UsbEvent`s
//! - Departures close sessions even when the descriptor is unreadable
//! - Shutdown releases every native resource
//!
//! Run with: `cargo test -p host --test worker_tests`

use common::test_utils::{ConfigBuilder, DEFAULT_TEST_TIMEOUT, device_descriptor_bytes, with_timeout};
use common::{Error, TransferCommand, UsbBridge, UsbEvent, create_usb_bridge, init_test_logging};
use host::native::{FakeDeviceSpec, FakeUsb, TransferBehavior};
use host::usb::{Context, ContextOptions, EnumerationPolicy, spawn_usb_worker};
use protocol::{ControlSetup, DeviceKey, TransferStatus, UsbError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const BULK_IN: u8 = 0x81;
const BULK_OUT: u8 = 0x02;

fn camera(bus: u8, address: u8) -> FakeDeviceSpec {
    FakeDeviceSpec::new(bus, address, &device_descriptor_bytes(0x1234, 0x5678, 0x0200))
        .with_config(
            ConfigBuilder::new(1)
                .interface(0, 0, 0xFF)
                .endpoint(BULK_IN, 0x02, 512)
                .endpoint(BULK_OUT, 0x02, 512)
                .build(),
        )
}

fn start(
    specs: Vec<FakeDeviceSpec>,
    options: ContextOptions,
    policy: EnumerationPolicy,
) -> (Arc<FakeUsb>, UsbBridge, JoinHandle<()>) {
    init_test_logging();
    let fake = Arc::new(FakeUsb::with_devices(specs));
    let context = Context::new(fake.clone(), options).unwrap();
    let (bridge, worker) = create_usb_bridge();
    let handle = spawn_usb_worker(worker, context, policy).unwrap();
    (fake, bridge, handle)
}

fn start_default(specs: Vec<FakeDeviceSpec>) -> (Arc<FakeUsb>, UsbBridge, JoinHandle<()>) {
    start(specs, ContextOptions::default(), EnumerationPolicy::default())
}

async fn stop(bridge: UsbBridge, handle: JoinHandle<()>) {
    bridge.shutdown().await.unwrap();
    tokio::task::spawn_blocking(move || handle.join().unwrap())
        .await
        .unwrap();
}

fn assert_released(fake: &FakeUsb) {
    assert_eq!(fake.counters().misuse(), 0);
    assert_eq!(fake.live_contexts(), 0);
    assert_eq!(fake.open_handles(), 0);
    assert_eq!(fake.live_devices(), 0);
    assert_eq!(fake.hotplug_registrations(), 0);
}

// ============================================================================
// Commands
// ============================================================================

#[tokio::test]
async fn test_list_open_transfer_close() {
    let (fake, bridge, handle) = start_default(vec![camera(1, 4), camera(1, 5)]);

    let devices = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.list_devices())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].configurations[0].interfaces.len(), 1);

    let session = bridge.open(devices[0].key).await.unwrap();
    assert_eq!(fake.open_handles(), 1);

    fake.queue_in(BULK_IN, &[1, 2, 3]);
    let reply = bridge
        .transfer(
            session,
            TransferCommand::BulkIn {
                endpoint: BULK_IN,
                length: 64,
                timeout_ms: 1000,
            },
        )
        .await
        .unwrap();
    assert_eq!(reply.status, TransferStatus::Completed);
    assert_eq!(reply.data, vec![1, 2, 3]);

    let reply = bridge
        .transfer(
            session,
            TransferCommand::BulkOut {
                endpoint: BULK_OUT,
                data: vec![9, 8],
                timeout_ms: 1000,
            },
        )
        .await
        .unwrap();
    assert_eq!(reply.actual_length, 2);
    assert!(reply.data.is_empty());
    assert_eq!(fake.written(BULK_OUT), vec![vec![9, 8]]);

    let reply = bridge
        .transfer(
            session,
            TransferCommand::ControlIn {
                setup: ControlSetup::get_descriptor(0x01, 0, 0, 18),
                timeout_ms: 1000,
            },
        )
        .await
        .unwrap();
    assert_eq!(reply.data, device_descriptor_bytes(0x1234, 0x5678, 0x0200));

    bridge.close(session).await.unwrap();
    assert_eq!(fake.open_handles(), 0);

    stop(bridge, handle).await;
    assert_released(&fake);
}

#[tokio::test]
async fn test_unknown_session_and_key() {
    let (fake, bridge, handle) = start_default(vec![camera(1, 4)]);

    let missing = DeviceKey::new(0x1234, 0x5678, 1, 99);
    assert!(matches!(
        bridge.open(missing).await,
        Err(Error::Usb(UsbError::NotFound))
    ));

    let session = bridge.open(DeviceKey::new(0x1234, 0x5678, 1, 4)).await.unwrap();
    bridge.close(session).await.unwrap();
    assert!(matches!(
        bridge.close(session).await,
        Err(Error::Usb(UsbError::NotFound))
    ));
    assert!(matches!(
        bridge
            .transfer(
                session,
                TransferCommand::InterruptIn {
                    endpoint: 0x83,
                    length: 8,
                    timeout_ms: 10,
                },
            )
            .await,
        Err(Error::Usb(UsbError::NotFound))
    ));

    stop(bridge, handle).await;
    assert_released(&fake);
}

#[tokio::test]
async fn test_invalid_transfer_rejected() {
    let (fake, bridge, handle) = start_default(vec![camera(1, 4)]);
    let session = bridge.open(DeviceKey::new(0x1234, 0x5678, 1, 4)).await.unwrap();

    // OUT endpoint address used for an IN transfer
    let result = bridge
        .transfer(
            session,
            TransferCommand::BulkIn {
                endpoint: BULK_OUT,
                length: 8,
                timeout_ms: 10,
            },
        )
        .await;
    assert!(matches!(result, Err(Error::Usb(UsbError::InvalidParameter))));
    assert_eq!(fake.counters().submitted, 0);

    stop(bridge, handle).await;
    assert_released(&fake);
}

#[tokio::test]
async fn test_zero_timeout_uses_context_default() {
    let options = ContextOptions {
        default_timeout: Duration::from_millis(40),
        ..Default::default()
    };
    let (fake, bridge, handle) = start(vec![camera(1, 4)], options, EnumerationPolicy::default());
    fake.set_transfer_behavior(BULK_IN, TransferBehavior::CompleteOnCancel);

    let session = bridge.open(DeviceKey::new(0x1234, 0x5678, 1, 4)).await.unwrap();
    let started = Instant::now();
    let reply = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        bridge.transfer(
            session,
            TransferCommand::BulkIn {
                endpoint: BULK_IN,
                length: 8,
                timeout_ms: 0,
            },
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(reply.status, TransferStatus::Cancelled);
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(fake.counters().cancel_calls, 1);

    stop(bridge, handle).await;
    assert_released(&fake);
}

// ============================================================================
// Hotplug Events
// ============================================================================

#[tokio::test]
async fn test_arrival_event() {
    let (fake, bridge, handle) = start_default(Vec::new());

    fake.simulate_arrival(camera(2, 7));
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap()
        .unwrap();
    match event {
        UsbEvent::DeviceArrived { device } => {
            assert_eq!(device.key.to_string(), "1234_5678_2_7");
            assert_eq!(device.configurations.len(), 1);
        }
        other => panic!("unexpected event {:?}", other),
    }

    fake.simulate_departure(2, 7);
    stop(bridge, handle).await;
    assert_released(&fake);
}

#[tokio::test]
async fn test_filtered_arrival_is_silent() {
    let policy = EnumerationPolicy {
        filters: vec!["0xABCD:*".to_string()],
        ..Default::default()
    };
    let (fake, bridge, handle) = start(Vec::new(), ContextOptions::default(), policy);

    fake.simulate_arrival(camera(2, 7));
    fake.simulate_arrival(FakeDeviceSpec::new(
        2,
        8,
        &device_descriptor_bytes(0xABCD, 0x0001, 0x0200),
    ));

    let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap()
        .unwrap();
    match event {
        UsbEvent::DeviceArrived { device } => assert_eq!(device.address, 8),
        other => panic!("unexpected event {:?}", other),
    }

    stop(bridge, handle).await;
    assert_released(&fake);
}

#[tokio::test]
async fn test_departure_closes_sessions() {
    let (fake, bridge, handle) = start_default(vec![camera(1, 4)]);
    let key = DeviceKey::new(0x1234, 0x5678, 1, 4);

    let first = bridge.open(key).await.unwrap();
    let second = bridge.open(key).await.unwrap();
    assert_eq!(fake.open_handles(), 2);

    assert!(fake.simulate_departure(1, 4));
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        UsbEvent::DeviceLeft {
            key,
            closed_sessions: vec![first, second],
        }
    );
    assert_eq!(fake.open_handles(), 0);

    assert!(matches!(
        bridge.close(first).await,
        Err(Error::Usb(UsbError::NotFound))
    ));
    assert!(bridge.list_devices().await.unwrap().is_empty());

    stop(bridge, handle).await;
    assert_released(&fake);
}

#[tokio::test]
async fn test_unidentified_departure_closes_sessions() {
    let (fake, bridge, handle) = start_default(vec![camera(1, 4), camera(1, 5)]);
    let key = DeviceKey::new(0x1234, 0x5678, 1, 4);
    let session = bridge.open(key).await.unwrap();
    let other = bridge.open(DeviceKey::new(0x1234, 0x5678, 1, 5)).await.unwrap();
    assert_eq!(fake.open_handles(), 2);

    // The device can no longer be read by the time it is reported gone
    assert!(fake.break_descriptor(1, 4));
    assert!(fake.simulate_departure(1, 4));
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        UsbEvent::DeviceLeft {
            key,
            closed_sessions: vec![session],
        }
    );
    assert_eq!(fake.open_handles(), 1);
    bridge.close(other).await.unwrap();

    stop(bridge, handle).await;
    assert_released(&fake);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_releases_open_sessions() {
    let (fake, bridge, handle) = start_default(vec![camera(1, 4), camera(1, 5)]);

    bridge.open(DeviceKey::new(0x1234, 0x5678, 1, 4)).await.unwrap();
    bridge.open(DeviceKey::new(0x1234, 0x5678, 1, 5)).await.unwrap();
    assert_eq!(fake.open_handles(), 2);

    stop(bridge.clone(), handle).await;
    assert_released(&fake);

    assert!(matches!(bridge.list_devices().await, Err(Error::Channel(_))));
}
