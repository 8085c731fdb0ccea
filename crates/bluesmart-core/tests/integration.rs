//! End-to-end tests over the mock radio: scan, classification, queued
//! GATT traffic, notifications, and link-loss handling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluesmart_core::characteristic::Characteristic;
use bluesmart_core::context::{BleContext, ContextEvent};
use bluesmart_core::device::Device;
use bluesmart_core::identifier::Identifier;
use bluesmart_core::intent::Intent;
use bluesmart_core::mock::{MockCommand, MockPeripheral, MockRadio};
use bluesmart_core::radio::{AdvertisementReport, CharacteristicHandle, GattService, GattStatus};
use bluesmart_core::ActionResult;
use bluesmart_types::uuid::{expand, CLIENT_CHARACTERISTIC_CONFIG, ENABLE_NOTIFICATION_VALUE};
use bluesmart_types::ConnectionState;

const WIDGET: &str = "AA:BB:CC:DD:EE:FF";
const BATTERY_HANDLE: u64 = 11;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn widget_peripheral() -> MockPeripheral {
    let service = expand("180f").unwrap();
    MockPeripheral::new()
        .service(GattService {
            uuid: service,
            characteristics: vec![CharacteristicHandle {
                id: BATTERY_HANDLE,
                service,
                uuid: expand("2a19").unwrap(),
            }],
        })
        .value(BATTERY_HANDLE, vec![87])
}

fn widget_report() -> AdvertisementReport {
    AdvertisementReport {
        address: WIDGET.into(),
        local_name: Some("Widget".into()),
        payload: vec![],
        service_uuids: vec![expand("feed").unwrap()],
        rssi: -45,
    }
}

fn widget_identifier(battery: &Arc<Characteristic>) -> Identifier {
    let battery = Arc::clone(battery);
    Identifier::builder(Arc::new(move |report, radio| {
        let device = Device::new(report.address.clone(), radio);
        device.register_characteristics(vec![Arc::clone(&battery)])?;
        Ok(device)
    }))
    .name("Widget")
    .service(expand("feed").unwrap())
    .build()
    .unwrap()
}

async fn settle(device: &Arc<Device>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while device.pending_queues() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue did not settle"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // One more beat so trailing events drain through dispatch.
    tokio::time::sleep(Duration::from_millis(5)).await;
}

struct Harness {
    radio: Arc<MockRadio>,
    context: Arc<BleContext>,
    battery: Arc<Characteristic>,
}

fn harness() -> Harness {
    init_tracing();
    let (radio, events) = MockRadio::detached();
    radio.add_peripheral(WIDGET, widget_peripheral());
    let context = BleContext::new(Arc::clone(&radio) as _, events);
    let battery = Arc::new(Characteristic::from_literals("180f", "2a19").unwrap());
    context.add_identifier(widget_identifier(&battery));
    Harness {
        radio,
        context,
        battery,
    }
}

async fn discover_widget(harness: &Harness) -> Arc<Device> {
    let mut events = harness.context.subscribe();
    harness.context.start_scan().await.unwrap();
    harness.radio.advertise(widget_report());
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("discovery timed out")
        .unwrap();
    assert!(matches!(event, ContextEvent::DeviceDiscovered { ref address } if address == WIDGET));
    harness.context.device(WIDGET).unwrap()
}

#[tokio::test]
async fn scan_classify_connect_read_disconnect() {
    let harness = harness();
    let device = discover_widget(&harness).await;
    assert_eq!(device.rssi(), -45);
    assert_eq!(device.name().as_deref(), Some("Widget"));

    let read_result = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&read_result);
    device.enqueue(
        Intent::new()
            .connect()
            .read(&harness.battery)
            .on_result(move |result| {
                *slot.lock().unwrap() = Some(result);
                result.is_ok()
            })
            .disconnect(),
    );
    settle(&device).await;

    assert_eq!(*read_result.lock().unwrap(), Some(ActionResult::Ok));
    assert_eq!(harness.battery.value(), vec![87]);
    assert_eq!(device.state(), ConnectionState::Disconnected);

    let commands = harness.radio.commands();
    let gatt: Vec<&MockCommand> = commands
        .iter()
        .filter(|c| !matches!(c, MockCommand::StartScan { .. } | MockCommand::StopScan))
        .collect();
    assert!(matches!(gatt[0], MockCommand::Connect { address } if address == WIDGET));
    assert!(matches!(gatt[1], MockCommand::DiscoverServices { address } if address == WIDGET));
    assert!(
        matches!(gatt[2], MockCommand::Read { address, handle } if address == WIDGET && *handle == BATTERY_HANDLE)
    );
    assert!(matches!(gatt[3], MockCommand::Disconnect { address } if address == WIDGET));
}

#[tokio::test]
async fn reports_for_unmatched_devices_are_cached_once() {
    let harness = harness();
    harness.context.start_scan().await.unwrap();

    let stranger = AdvertisementReport {
        address: "11:22:33:44:55:66".into(),
        local_name: Some("Gadget".into()),
        ..widget_report()
    };
    harness.radio.advertise(stranger.clone());
    harness.radio.advertise(stranger);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(harness.context.device_count(), 0);
    assert!(harness.context.scanner().is_rejected("11:22:33:44:55:66"));

    // A new rule makes the address eligible again.
    let gadget_battery = Arc::new(Characteristic::from_literals("180f", "2a19").unwrap());
    let gadget = {
        let battery = Arc::clone(&gadget_battery);
        Identifier::builder(Arc::new(move |report, radio| {
            let device = Device::new(report.address.clone(), radio);
            device.register_characteristics(vec![Arc::clone(&battery)])?;
            Ok(device)
        }))
        .name("Gadget")
        .build()
        .unwrap()
    };
    harness.context.add_identifier(gadget);
    assert!(!harness.context.scanner().is_rejected("11:22:33:44:55:66"));

    harness.radio.advertise(AdvertisementReport {
        address: "11:22:33:44:55:66".into(),
        local_name: Some("Gadget".into()),
        ..widget_report()
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.context.device("11:22:33:44:55:66").is_some());
}

#[tokio::test]
async fn failed_write_aborts_queue_and_cancels_the_rest() {
    init_tracing();
    let (radio, events) = MockRadio::detached();
    radio.add_peripheral(
        WIDGET,
        widget_peripheral().write_status(BATTERY_HANDLE, GattStatus::Failure),
    );
    let context = BleContext::new(Arc::clone(&radio) as _, events);
    let battery = Arc::new(Characteristic::from_literals("180f", "2a19").unwrap());
    let device = Device::new(WIDGET, Arc::clone(context.radio()));
    device
        .register_characteristics(vec![Arc::clone(&battery)])
        .unwrap();
    context.inject_device(Arc::clone(&device));

    let observed = Arc::new(Mutex::new(Vec::new()));
    let reads = Arc::new(AtomicUsize::new(0));

    let write_slot = Arc::clone(&observed);
    let read_slot = Arc::clone(&observed);
    let read_count = Arc::clone(&reads);
    device.enqueue(
        Intent::new()
            .connect()
            .write(&battery, vec![0x01])
            .on_result(move |result| {
                write_slot.lock().unwrap().push(result);
                result.is_ok()
            })
            .read(&battery)
            .on_result(move |result| {
                read_slot.lock().unwrap().push(result);
                read_count.fetch_add(1, Ordering::SeqCst);
                true
            }),
    );
    settle(&device).await;

    assert_eq!(
        *observed.lock().unwrap(),
        vec![ActionResult::Failed, ActionResult::Cancelled]
    );
    // The read was cancelled, never issued.
    assert!(!radio
        .commands()
        .iter()
        .any(|c| matches!(c, MockCommand::Read { .. })));
}

#[tokio::test]
async fn secured_characteristic_reports_bonding_required() {
    init_tracing();
    let (radio, events) = MockRadio::detached();
    radio.add_peripheral(
        WIDGET,
        widget_peripheral().read_status(BATTERY_HANDLE, GattStatus::InsufficientSecurity),
    );
    let context = BleContext::new(Arc::clone(&radio) as _, events);
    let battery = Arc::new(Characteristic::from_literals("180f", "2a19").unwrap());
    let device = Device::new(WIDGET, Arc::clone(context.radio()));
    device
        .register_characteristics(vec![Arc::clone(&battery)])
        .unwrap();
    context.inject_device(Arc::clone(&device));

    let observed = Arc::new(Mutex::new(Vec::new()));
    let read_slot = Arc::clone(&observed);
    let disconnect_slot = Arc::clone(&observed);
    device.enqueue(
        Intent::new()
            .connect()
            .read(&battery)
            .on_result(move |result| {
                read_slot.lock().unwrap().push(result);
                result.is_ok()
            })
            .disconnect()
            .on_result(move |result| {
                disconnect_slot.lock().unwrap().push(result);
                true
            }),
    );
    settle(&device).await;

    assert_eq!(
        *observed.lock().unwrap(),
        vec![ActionResult::BondingRequired, ActionResult::Cancelled]
    );
    // The peripheral rejected the read but the link itself stayed up.
    assert_eq!(device.state(), ConnectionState::ServicesDiscovered);
}

#[tokio::test]
async fn notifications_reach_the_registered_listener() {
    let harness = harness();
    let device = discover_widget(&harness).await;

    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&frames);
    let listener: bluesmart_core::NotificationListener = Arc::new(move |value: &[u8]| {
        sink.lock().unwrap().push(value.to_vec());
    });

    device.enqueue(
        Intent::new()
            .connect()
            .enable_notifications(&harness.battery, &listener),
    );
    settle(&device).await;

    // The config descriptor is written and acknowledged before the radio
    // flag flips.
    let commands = harness.radio.commands();
    let descriptor_at = commands.iter().position(|c| matches!(
        c,
        MockCommand::WriteDescriptor { handle, descriptor, value, .. }
            if *handle == BATTERY_HANDLE
                && *descriptor == CLIENT_CHARACTERISTIC_CONFIG
                && value == &ENABLE_NOTIFICATION_VALUE
    ));
    let flag_at = commands.iter().position(|c| matches!(
        c,
        MockCommand::SetNotification { handle, enable: true, .. } if *handle == BATTERY_HANDLE
    ));
    assert!(descriptor_at.is_some() && flag_at.is_some());
    assert!(descriptor_at < flag_at);

    harness
        .radio
        .push_notification(WIDGET, BATTERY_HANDLE, vec![0x63]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*frames.lock().unwrap(), vec![vec![0x63]]);
    assert_eq!(harness.battery.value(), vec![0x63]);
}

#[tokio::test]
async fn link_loss_invalidates_handles_and_listeners() {
    let harness = harness();
    let device = discover_widget(&harness).await;

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let listener: bluesmart_core::NotificationListener = Arc::new(move |_: &[u8]| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    device.enqueue(
        Intent::new()
            .connect()
            .enable_notifications(&harness.battery, &listener),
    );
    settle(&device).await;
    assert!(harness.battery.is_ready());

    harness.radio.drop_link(WIDGET);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(!harness.battery.is_ready());
    assert_eq!(harness.battery.listener_count(), 0);

    // A late frame for the dead link reaches nobody.
    harness
        .radio
        .push_notification(WIDGET, BATTERY_HANDLE, vec![0x01]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_radio_times_out_the_read() {
    let harness = harness();
    let device = discover_widget(&harness).await;

    device.enqueue(Intent::new().connect());
    settle(&device).await;
    assert!(device.is_ready());

    harness.radio.go_silent(true);
    let result = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);
    let started = tokio::time::Instant::now();
    device.enqueue(
        Intent::new()
            .read(&harness.battery)
            .timeout(Duration::from_secs(1))
            .on_result(move |outcome| {
                *slot.lock().unwrap() = Some(outcome);
                outcome.is_ok()
            }),
    );
    settle(&device).await;

    assert_eq!(*result.lock().unwrap(), Some(ActionResult::TimedOut));
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn idle_executor_disconnects_the_device() {
    init_tracing();
    let (radio, events) = MockRadio::detached();
    radio.add_peripheral(WIDGET, widget_peripheral());
    let context = BleContext::new(Arc::clone(&radio) as _, events);
    let device = Device::with_idle_timeout(
        WIDGET,
        Arc::clone(context.radio()),
        Some(Duration::from_millis(100)),
    );
    context.inject_device(Arc::clone(&device));

    device.enqueue(Intent::new().connect());
    settle(&device).await;
    assert!(device.is_ready());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(radio
        .commands()
        .iter()
        .any(|c| matches!(c, MockCommand::Disconnect { .. })));
}

#[tokio::test]
async fn intents_are_reusable() {
    let harness = harness();
    let device = discover_widget(&harness).await;

    let reads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reads);
    let poll = Intent::new()
        .connect()
        .read(&harness.battery)
        .on_result(move |result| {
            if result.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            result.is_ok()
        });

    device.enqueue(poll.clone());
    device.enqueue(poll);
    settle(&device).await;

    assert_eq!(reads.load(Ordering::SeqCst), 2);
}
