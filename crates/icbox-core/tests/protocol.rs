use icbox_core::protocol::{IcBox, PortInfo, ProtocolError, SimulatedBackend, SimulatedDevice};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::Instant;

const TIMEOUT: Duration = Duration::from_millis(500);

async fn connected() -> (IcBox, SimulatedDevice) {
    let backend = SimulatedBackend::new();
    let device = backend.device();
    let mut icbox = IcBox::with_backend(backend);
    icbox.open("TEST").await.unwrap();
    (icbox, device)
}

/// Deliver `reply` to the open line after `delay`
fn inject_after(device: &SimulatedDevice, delay: Duration, reply: &'static str) {
    let device = device.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        device.inject(reply);
    });
}

#[tokio::test(start_paused = true)]
async fn test_rx_level_end_to_end() {
    let (mut icbox, device) = connected().await;
    inject_after(&device, Duration::from_millis(100), "012\r");

    assert_eq!(icbox.get_rx_level().await.unwrap(), 12);
    assert_eq!(device.written(), vec!["@CN?".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_rx_level_without_reply_is_zero() {
    let (mut icbox, _device) = connected().await;

    let start = Instant::now();
    assert_eq!(icbox.get_rx_level().await.unwrap(), 0);
    let elapsed = start.elapsed();
    assert!(elapsed >= TIMEOUT, "returned early after {:?}", elapsed);
    assert!(elapsed < TIMEOUT + Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_acknowledge_commands() {
    let (mut icbox, device) = connected().await;

    device.reply_to("@CX", "OK F\r");
    assert!(icbox.check_connection_status().await.unwrap());

    device.clear_replies();
    device.reply_to("@CX", "ERR\r");
    assert!(!icbox.check_connection_status().await.unwrap());

    device.reply_to("@CI5551234", "F\r");
    assert!(icbox.dial_number("5551234").await.unwrap());

    device.reply_to("@CN-4", "F\r");
    assert!(icbox.set_rx_level(-4).await.unwrap());

    device.reply_to("@CM2", "F\r");
    assert!(icbox.set_rx_mode(2).await.unwrap());

    device.reply_to("@CS17", "F\r");
    assert!(icbox.set_id("17").await.unwrap());

    assert_eq!(
        device.written(),
        vec!["@CX", "@CX", "@CI5551234", "@CN-4", "@CM2", "@CS17"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_numeric_commands_round() {
    let (mut icbox, device) = connected().await;
    device.reply_to("@CN?", "12.7\r");
    device.reply_to("@CM?", "-3.2\r");
    device.reply_to("@CS?", "id?\r");

    assert_eq!(icbox.get_rx_level().await.unwrap(), 13);
    assert_eq!(icbox.get_rx_mode().await.unwrap(), -3);
    assert_eq!(icbox.get_id().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hook_state() {
    let (mut icbox, device) = connected().await;

    device.reply_to("@CG?", "0\r");
    assert!(icbox.get_on_hook().await.unwrap());

    device.clear_replies();
    device.reply_to("@CG?", "1\r");
    assert!(!icbox.get_on_hook().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_version_info_is_raw() {
    let (mut icbox, device) = connected().await;
    device.reply_to("@CV", "ICBOX V2.13\r");

    assert_eq!(icbox.get_version_info().await.unwrap(), "ICBOX V2.13\r");
}

#[tokio::test(start_paused = true)]
async fn test_receive_stops_at_terminator() {
    let (mut icbox, device) = connected().await;
    device.inject("5\r\nignored");

    let start = Instant::now();
    let text = icbox.receive(TIMEOUT).await.unwrap();
    assert_eq!(text, "5\r\nignored");
    assert_eq!(start.elapsed(), Duration::ZERO);

    // Bytes after the terminating read belong to the next receive
    device.inject("tail\r");
    assert_eq!(icbox.receive(TIMEOUT).await.unwrap(), "tail\r");
}

#[tokio::test(start_paused = true)]
async fn test_receive_accumulates_across_polls() {
    let (mut icbox, device) = connected().await;
    device.inject("RI");
    inject_after(&device, Duration::from_millis(120), "NG\r");

    assert_eq!(icbox.receive(TIMEOUT).await.unwrap(), "RING\r");
}

#[tokio::test(start_paused = true)]
async fn test_receive_timeout_returns_partial() {
    let (mut icbox, device) = connected().await;
    device.inject("12");

    assert_eq!(icbox.receive(TIMEOUT).await.unwrap(), "12");
    assert_eq!(icbox.receive(TIMEOUT).await.unwrap(), "");
}

#[tokio::test(start_paused = true)]
async fn test_receive_read_error_returns_partial() {
    let (mut icbox, device) = connected().await;
    device.fail_reads("framing error");

    let start = Instant::now();
    assert_eq!(icbox.receive(TIMEOUT).await.unwrap(), "");
    assert!(start.elapsed() < TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn test_receive_read_error_keeps_collected_text() {
    let (mut icbox, device) = connected().await;
    assert!(device.inject("12"));

    let failing = device.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        failing.fail_reads("framing error");
    });

    let start = Instant::now();
    assert_eq!(icbox.receive(TIMEOUT).await.unwrap(), "12");
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(120));
    assert!(elapsed < TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn test_receive_requires_open_port() {
    let backend = SimulatedBackend::new();
    let mut icbox = IcBox::with_backend(backend);

    let err = icbox.receive(TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ProtocolError::PortNotOpen));

    icbox.open("TEST").await.unwrap();
    icbox.close().await.unwrap();
    let err = icbox.receive(TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ProtocolError::PortNotOpen));
}

#[tokio::test(start_paused = true)]
async fn test_send_command_without_connection() {
    let backend = SimulatedBackend::new();
    let device = backend.device();
    let mut icbox = IcBox::with_backend(backend);

    assert_eq!(icbox.send_command("@CV").await.unwrap(), None);
    assert!(device.written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_command_counts_suffix() {
    let (mut icbox, device) = connected().await;

    assert_eq!(icbox.send_command("@CV").await.unwrap(), Some(5));
    assert_eq!(device.written(), vec!["@CV".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_propagates() {
    let (mut icbox, device) = connected().await;
    device.fail_writes("broken pipe");

    let err = icbox.send_command("@CV").await.unwrap_err();
    assert!(matches!(err, ProtocolError::WriteFailed(_)));

    let err = icbox.get_rx_level().await.unwrap_err();
    assert!(matches!(err, ProtocolError::WriteFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_close_twice() {
    let (mut icbox, device) = connected().await;

    assert!(icbox.close().await.unwrap());
    assert!(!icbox.close().await.unwrap());
    assert!(!icbox.is_connected());
    assert!(!device.is_open());

    let mut never_opened = IcBox::with_backend(SimulatedBackend::new());
    assert!(!never_opened.close().await.unwrap());
    assert!(!never_opened.close().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_close_failure_propagates() {
    let (mut icbox, device) = connected().await;
    device.fail_close("device busy");

    let err = icbox.close().await.unwrap_err();
    assert!(matches!(err, ProtocolError::CloseFailed(_)));
    assert!(!icbox.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_is_connected_after_open_resolves() {
    let backend = SimulatedBackend::new();
    let mut icbox = IcBox::with_backend(backend);

    assert!(!icbox.is_connected());
    icbox.open("TEST").await.unwrap();
    assert!(icbox.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_get_event_waits_for_device() {
    let (mut icbox, device) = connected().await;
    inject_after(&device, Duration::from_millis(900), "RING\r");

    // Default timeout gives up before the ring arrives
    assert_eq!(icbox.get_event(None).await.unwrap(), "");
    assert_eq!(
        icbox.get_event(Some(Duration::from_secs(2))).await.unwrap(),
        "RING\r"
    );
    assert!(device.written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_get_ports() {
    let backend = SimulatedBackend::new();
    let device = backend.device();
    device.set_ports(vec![PortInfo::named("TEST"), PortInfo::named("COM3")]);
    let icbox = IcBox::with_backend(backend);

    let names: Vec<String> = icbox
        .get_ports()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["TEST", "COM3"]);

    device.fail_enumeration("access denied");
    let err = icbox.get_ports().await.unwrap_err();
    assert!(matches!(err, ProtocolError::EnumerationFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_demo_backend_replies() {
    let mut icbox = IcBox::with_backend(SimulatedBackend::demo());
    icbox.open("SIM0").await.unwrap();

    assert!(icbox.get_version_info().await.unwrap().starts_with("ICBOX"));
    assert!(icbox.get_on_hook().await.unwrap());
    assert!(icbox.check_connection_status().await.unwrap());
    assert!(icbox.dial_number("100").await.unwrap());
    assert_eq!(icbox.get_rx_level().await.unwrap(), 12);
    assert!(icbox.set_rx_level(8).await.unwrap());
    assert_eq!(icbox.get_rx_mode().await.unwrap(), 1);
    assert_eq!(icbox.get_id().await.unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_shared_driver_serializes_commands() {
    let backend = SimulatedBackend::new();
    let device = backend.device();
    device.reply_after("@CN?", "7\r", Duration::from_millis(120));
    device.reply_after("@CM?", "2\r", Duration::from_millis(60));

    let mut icbox = IcBox::with_backend(backend);
    icbox.open("TEST").await.unwrap();
    let shared = std::sync::Arc::new(tokio::sync::Mutex::new(icbox));

    let level = {
        let shared = shared.clone();
        tokio::spawn(async move { shared.lock().await.get_rx_level().await })
    };
    let mode = {
        let shared = shared.clone();
        tokio::spawn(async move { shared.lock().await.get_rx_mode().await })
    };

    assert_eq!(level.await.unwrap().unwrap(), 7);
    assert_eq!(mode.await.unwrap().unwrap(), 2);
}
