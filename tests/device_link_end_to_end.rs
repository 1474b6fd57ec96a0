//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "End-to-end link scenarios against a mock device."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use bk215_common::config::AppConfig;
use bk215_core::{DeviceLink, LinkConfig, MemoryRegistry};
use bk215_metrics::{new_registry, LinkMetrics, SharedRegistry};
use bk215_protocol::{check_writable, Field};
use bk215_session::WatchdogSettings;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const HANDSHAKE: &[u8] = b"{\"code\":24658,\"data\":{}}\r\n";

async fn mock_device() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn accept_with_handshake(listener: &TcpListener) -> TcpStream {
    let (mut device, _) = timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("link dials within deadline")
        .unwrap();
    let mut handshake = vec![0u8; HANDSHAKE.len()];
    device.read_exact(&mut handshake).await.unwrap();
    assert_eq!(handshake, HANDSHAKE);
    device.write_all(b"{\"code\":0,\"data\":{}}").await.unwrap();
    device
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached within deadline");
}

fn counter(registry: &SharedRegistry, name: &str) -> f64 {
    registry
        .gather()
        .iter()
        .find(|family| family.get_name() == name)
        .map(|family| {
            family
                .get_metric()
                .iter()
                .map(|metric| metric.get_counter().get_value())
                .sum()
        })
        .unwrap_or(0.0)
}

fn link_config_from_toml(port: u16) -> LinkConfig {
    let config: AppConfig = format!(
        r#"
[device]
host = "127.0.0.1"
port = {port}
timeout_ms = 500

[device.backoff]
base_secs = 1
"#
    )
    .parse()
    .unwrap();
    LinkConfig::from(&config.device)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_device_is_dropped_and_redialled() {
    let (listener, port) = mock_device().await;
    let mut config = link_config_from_toml(port);
    config.watchdog = Some(WatchdogSettings {
        check_interval: Duration::from_millis(50),
        floor: Duration::from_millis(200),
        margin: Duration::from_millis(50),
    });

    let metrics_registry = new_registry();
    let metrics = LinkMetrics::new(metrics_registry.clone()).unwrap();
    let registry = MemoryRegistry::new();
    let link = DeviceLink::new(config, Arc::new(registry.clone()))
        .with_metrics(metrics)
        .start();

    let _first = accept_with_handshake(&listener).await;
    wait_until(|| registry.is_connected()).await;

    // Keep the first socket open but silent; the watchdog must give up on it.
    let _second = accept_with_handshake(&listener).await;
    wait_until(|| counter(&metrics_registry, "bk215_link_connects_total") >= 2.0).await;

    assert!(counter(&metrics_registry, "bk215_link_transport_errors_total") >= 1.0);
    assert!(counter(&metrics_registry, "bk215_link_reconnects_scheduled_total") >= 1.0);
    assert!(registry
        .state()
        .last_error
        .map_or(true, |message| message.contains("no data received")));

    link.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reports_dribbled_byte_by_byte_are_reassembled() {
    let (listener, port) = mock_device().await;
    let registry = MemoryRegistry::new();
    let link = DeviceLink::new(link_config_from_toml(port), Arc::new(registry.clone())).start();
    let mut device = accept_with_handshake(&listener).await;

    let stream = b"{\"code\":24658,\"data\":{\"t211\":64,\"t1001\":\"32\"}}junk{\"code\":24661,\"data\":{\"t592\":12,\"t593\":65535}}";
    for byte in stream.iter() {
        device.write_all(std::slice::from_ref(byte)).await.unwrap();
        device.flush().await.unwrap();
    }

    wait_until(|| registry.value(Field::HEAD_STORAGE) == Some(12.0)).await;
    assert_eq!(registry.value(Field::BATTERY_LEVEL), Some(64.0));
    assert_eq!(registry.value(Field::EXPANSION_4), Some(32.0));
    assert_eq!(registry.value(Field::EXPANSION_1), None);

    link.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nothing_is_applied_after_shutdown() {
    let (listener, port) = mock_device().await;
    let registry = MemoryRegistry::new();
    let link = DeviceLink::new(link_config_from_toml(port), Arc::new(registry.clone())).start();
    let mut device = accept_with_handshake(&listener).await;
    wait_until(|| registry.is_connected()).await;

    link.shutdown().await.unwrap();
    let _ = device
        .write_all(b"{\"code\":24658,\"data\":{\"t211\":99}}")
        .await;
    sleep(Duration::from_millis(200)).await;

    assert_eq!(registry.value(Field::BATTERY_LEVEL), None);
    assert_eq!(registry.state().snapshots_applied, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validated_write_reaches_the_device() {
    let (listener, port) = mock_device().await;
    let link = DeviceLink::new(link_config_from_toml(port), Arc::new(MemoryRegistry::new())).start();
    let mut device = accept_with_handshake(&listener).await;
    wait_until(|| link.is_connected()).await;

    assert!(check_writable("system_charge_limit", 101).is_err());
    let entry = check_writable("system_charge_limit", 90).unwrap();

    let device_script = async {
        let expected = b"{\"code\":24662,\"data\":{\"t363\":90}}";
        let mut buf = vec![0u8; expected.len()];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
        device
            .write_all(b"{\"code\":24663,\"data\":{\"t363\":0}}")
            .await
            .unwrap();
    };
    let (outcome, ()) = tokio::join!(link.set_field(entry.field, 90), device_script);
    assert_eq!(outcome, Ok(()));

    link.shutdown().await.unwrap();
}
