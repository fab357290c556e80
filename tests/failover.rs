//! Client-side failover: a handle with several URLs survives its
//! broker dying without notice and moves its subscriptions along.

use std::sync::Arc;
use std::time::Duration;

use cumulus::client::{Client, ClientConfig, ConnectionState};
use cumulus::proto::CloudStatus;
use cumulus::{Broker, BrokerConfig, Message};
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn await_connected(client: &Client) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while client.state() != ConnectionState::Connected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "client never reconnected, state {:?}",
            client.state()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn client_fails_over_when_its_broker_dies() {
    init_tracing();
    let a = Broker::start(BrokerConfig::builder().addr("127.0.0.1:0").build())
        .await
        .unwrap();
    let b = Broker::start(
        BrokerConfig::builder()
            .addr("127.0.0.1:0")
            .cloud_seeds(a.url())
            .build(),
    )
    .await
    .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while b.cloud_status().await != CloudStatus::InCloud {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let roamer = Client::new(
        ClientConfig::builder()
            .urls(format!("{};{}", a.addr(), b.addr()))
            .name("roamer")
            .keepalive(Duration::from_millis(200))
            .build(),
    );
    roamer.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: cumulus::client::SubscriptionCallback =
        Arc::new(move |msg: Message| {
            let _ = tx.send(msg);
        });
    roamer.subscribe("news", "*", callback).await.unwrap();

    // the first URL dies without a shutdown notice
    a.kill();
    await_connected(&roamer).await;

    // the standing subscription must have moved to the survivor
    let producer = Client::new(
        ClientConfig::builder()
            .urls(b.addr().to_string())
            .name("producer")
            .build(),
    );
    producer.connect().await.unwrap();
    producer
        .send(Message::new("news", "flash").with_text("still here"))
        .await
        .unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery after failover")
        .unwrap();
    assert_eq!(got.text, "still here");
    assert!(
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .is_err(),
        "resubscribe duplicated the subscription"
    );
}

#[tokio::test]
async fn single_url_handle_fails_instead_of_retrying() {
    init_tracing();
    let a = Broker::start(BrokerConfig::builder().addr("127.0.0.1:0").build())
        .await
        .unwrap();
    let lonely = Client::new(
        ClientConfig::builder()
            .urls(a.addr().to_string())
            .name("lonely")
            .keepalive(Duration::from_millis(200))
            .build(),
    );
    lonely.connect().await.unwrap();

    a.kill();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while lonely.state() != ConnectionState::Failed {
        assert!(
            tokio::time::Instant::now() < deadline,
            "handle should give up, state {:?}",
            lonely.state()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(lonely.send(Message::new("void", "x")).await.is_err());
}

#[tokio::test]
async fn orderly_shutdown_disconnects_rather_than_failing_over() {
    init_tracing();
    let a = Broker::start(BrokerConfig::builder().addr("127.0.0.1:0").build())
        .await
        .unwrap();
    let b = Broker::start(BrokerConfig::builder().addr("127.0.0.1:0").build())
        .await
        .unwrap();

    let polite = Client::new(
        ClientConfig::builder()
            .urls(format!("{};{}", a.addr(), b.addr()))
            .name("polite")
            .build(),
    );
    polite.connect().await.unwrap();

    a.shutdown().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = polite.state();
        assert_ne!(
            state,
            ConnectionState::Reconnecting,
            "shutdown notice must not trigger failover"
        );
        if state == ConnectionState::Disconnected {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(b.client_count().await, 0);
}
