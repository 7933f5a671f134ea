//! Controller behavior: endpoint rotation for unreachable peers, endpoint
//! change events, watcher channel lifecycle.

mod common;

use common::{machine_config, peer_config, MockDevice};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use uncloud_model::PublicKey;
use uncloud_wg::{EndpointChangeEvent, WgNetwork, UP_THRESHOLD};

#[tokio::test]
async fn down_peer_rotates_to_next_endpoint_and_notifies() {
    let device = Arc::new(MockDevice::new());

    // The peer's handshake is long stale, so it is down from the start and
    // rotation is only gated by the rotate interval.
    let key = PublicKey([2; 32]);
    let stale = SystemTime::now() - UP_THRESHOLD - Duration::from_secs(60);
    device.seed_peer(key, Some("192.0.2.10:51820".parse().unwrap()), Some(stale));

    let network = Arc::new(WgNetwork::new(device.clone()));
    network
        .configure(machine_config(
            0,
            vec![peer_config(1, key, &["192.0.2.10:51820", "192.0.2.11:51820"])],
        ))
        .await
        .unwrap();

    let mut events = network.watch_endpoints().await;

    let cancel = CancellationToken::new();
    let run = {
        let network = network.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { network.run(cancel).await })
    };

    // Rotation is due after ROTATE_INTERVAL (5 s) plus up to one tick.
    let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("endpoint change within 10s")
        .expect("channel open");
    assert_eq!(
        event,
        EndpointChangeEvent {
            public_key: key,
            endpoint: "192.0.2.11:51820".parse().unwrap(),
        }
    );

    // The device was patched with the new endpoint.
    assert_eq!(device.peer(&key).unwrap().endpoint, Some("192.0.2.11:51820".parse().unwrap()));

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn healthy_peer_never_rotates() {
    let device = Arc::new(MockDevice::new());

    let key = PublicKey([2; 32]);
    device.seed_peer(key, Some("192.0.2.10:51820".parse().unwrap()), Some(SystemTime::now()));

    let network = Arc::new(WgNetwork::new(device.clone()));
    network
        .configure(machine_config(
            0,
            vec![peer_config(1, key, &["192.0.2.10:51820", "192.0.2.11:51820"])],
        ))
        .await
        .unwrap();

    let mut events = network.watch_endpoints().await;

    let cancel = CancellationToken::new();
    let run = {
        let network = network.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { network.run(cancel).await })
    };

    // Well past the rotate interval: no event, endpoint unchanged.
    let event = tokio::time::timeout(Duration::from_secs(7), events.recv()).await;
    assert!(event.is_err(), "no endpoint change expected for a healthy peer");
    assert_eq!(device.peer(&key).unwrap().endpoint, Some("192.0.2.10:51820".parse().unwrap()));

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn watcher_channel_closes_on_cancel() {
    let device = Arc::new(MockDevice::new());
    let network = Arc::new(WgNetwork::new(device));
    network.configure(machine_config(0, vec![])).await.unwrap();

    let mut events = network.watch_endpoints().await;

    let cancel = CancellationToken::new();
    let run = {
        let network = network.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { network.run(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    cancel.cancel();
    run.await.unwrap().unwrap();

    let next = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("recv resolves after close");
    assert!(next.is_none(), "channel must be closed after cancellation");
}
