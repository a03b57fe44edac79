//! Runtime wiring: discovery over the transport, the services forwarding and
//! shutdown.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::FakeTransport;
use spyder_remote_client::{ClientConfig, ClientError, ClientState, Runtime};

const INFO: &str = r#"{"port":40123,"pid":77,"base_url":"http://127.0.0.1:40123","token":"discovered","runtime_dir":"/run/user/1000/jupyter","version":"0.3.0"}"#;

fn runtime(config: ClientConfig) -> (Runtime, Arc<FakeTransport>) {
    let transport = FakeTransport::new();
    let rt = Runtime::with_transport(config, transport.clone());
    (rt, transport)
}

#[tokio::test]
async fn test_discover_reads_the_last_line() {
    let (rt, transport) = runtime(ClientConfig::builder("kernel-host").build().unwrap());
    *transport.exec_output.lock().unwrap() = format!("motd: welcome\n{INFO}\n");

    let info = rt.discover().await.unwrap();
    assert_eq!(info.port, 40123);
    assert_eq!(info.token, "discovered");
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_services_forward_the_discovered_port_once() {
    let (rt, transport) = runtime(ClientConfig::builder("kernel-host").build().unwrap());
    *transport.exec_output.lock().unwrap() = INFO.to_string();

    let api = rt.services().await.unwrap();
    let again = rt.services().await.unwrap();
    assert!(Arc::ptr_eq(&api, &again));

    let local = transport.forwards_to(40123);
    assert_eq!(local.len(), 1);
    assert_eq!(api.base_url(), format!("http://127.0.0.1:{}", local[0]));
    assert_eq!(rt.tunnels().open_forwardings().await, 1);
}

#[tokio::test]
async fn test_configured_port_and_token_skip_discovery() {
    let config = ClientConfig::builder("kernel-host")
        .server_port(41000)
        .token("configured")
        .build()
        .unwrap();
    let (rt, transport) = runtime(config);

    rt.services().await.unwrap();
    assert_eq!(transport.forwards_to(41000).len(), 1);
    assert!(transport.forwards_to(40123).is_empty());
}

#[tokio::test]
async fn test_missing_server_is_unreachable() {
    let (rt, _transport) = runtime(ClientConfig::builder("kernel-host").build().unwrap());
    let err = rt.services().await.err().unwrap();
    assert!(matches!(err, ClientError::ServerUnreachable(_)), "{err:?}");
    assert_eq!(rt.tunnels().open_forwardings().await, 0);
}

#[tokio::test]
async fn test_kernel_options_follow_config() {
    let config = ClientConfig::builder("kernel-host")
        .open_attempts(5)
        .request_timeout_secs(9)
        .build()
        .unwrap();
    let (rt, _) = runtime(config);
    let options = rt.kernel_options();
    assert_eq!(options.open_attempts, 5);
    assert_eq!(options.request_timeout.as_secs(), 9);
    assert_eq!(options.heartbeat.missed_limit, 3);
}

#[tokio::test]
async fn test_shutdown_closes_kernels_and_the_connection() {
    let config = ClientConfig::builder("kernel-host")
        .server_port(41000)
        .token("configured")
        .build()
        .unwrap();
    let (rt, transport) = runtime(config);
    let kernel = rt.kernel_client().await.unwrap();
    assert_eq!(kernel.status(), ClientState::Idle);

    rt.shutdown().await;
    assert_eq!(kernel.status(), ClientState::Closed);
    assert_eq!(transport.active_forwards(), 0);
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(rt.tunnels().open_forwardings().await, 0);
}
