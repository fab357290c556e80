//! One broker, several clients: the core publish/subscribe and get
//! semantics without any cloud involved.

use std::sync::Arc;
use std::time::Duration;

use cumulus::client::{Client, ClientConfig};
use cumulus::{Broker, BrokerConfig, Message};
use tokio::sync::mpsc;

async fn broker() -> Broker {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = BrokerConfig::builder().addr("127.0.0.1:0").build();
    Broker::start(config).await.expect("broker start")
}

async fn client(broker: &Broker, name: &str) -> Client {
    let client = Client::new(
        ClientConfig::builder()
            .urls(broker.addr().to_string())
            .name(name)
            .build(),
    );
    client.connect().await.expect("connect");
    client
}

fn collector() -> (
    cumulus::client::SubscriptionCallback,
    mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: cumulus::client::SubscriptionCallback =
        Arc::new(move |msg| {
            let _ = tx.send(msg);
        });
    (callback, rx)
}

#[tokio::test]
async fn publish_reaches_matching_subscribers_only() {
    let broker = broker().await;
    let producer = client(&broker, "producer").await;
    let consumer = client(&broker, "consumer").await;

    let (callback, mut rx) = collector();
    consumer.subscribe("alarm*", "*", callback).await.unwrap();

    producer
        .send(Message::new("alarm-hall-b", "over-temp").with_text("97C"))
        .await
        .unwrap();
    producer
        .send(Message::new("status", "over-temp"))
        .await
        .unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery")
        .unwrap();
    assert_eq!(got.subject, "alarm-hall-b");
    assert_eq!(got.text, "97C");
    assert_eq!(got.sender, "producer");

    // the non-matching subject must never arrive
    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn sync_send_counts_deliveries() {
    let broker = broker().await;
    let producer = client(&broker, "producer").await;
    let consumer = client(&broker, "consumer").await;

    let (cb1, _rx1) = collector();
    let (cb2, _rx2) = collector();
    consumer.subscribe("news", "*", cb1).await.unwrap();
    consumer.subscribe("news*", "flash", cb2).await.unwrap();

    let count = producer
        .sync_send(Message::new("news", "flash"))
        .await
        .unwrap();
    assert_eq!(count, 2);

    let none = producer
        .sync_send(Message::new("silence", "flash"))
        .await
        .unwrap();
    assert_eq!(none, 0);
}

#[tokio::test]
async fn duplicate_subscription_is_rejected() {
    let broker = broker().await;
    let consumer = client(&broker, "consumer").await;

    let (callback, _rx) = collector();
    consumer
        .subscribe("a", "b", callback.clone())
        .await
        .unwrap();
    let dup = consumer.subscribe("a", "b", callback).await;
    assert!(matches!(dup, Err(cumulus::Error::AlreadyExists(_))));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let broker = broker().await;
    let producer = client(&broker, "producer").await;
    let consumer = client(&broker, "consumer").await;

    let (callback, mut rx) = collector();
    let sub = consumer.subscribe("tick", "*", callback).await.unwrap();

    producer.send(Message::new("tick", "1")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first delivery")
        .unwrap();

    consumer.unsubscribe(sub).await.unwrap();
    producer.send(Message::new("tick", "2")).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err()
    );
    assert_eq!(broker.subscription_count().await, 0);
}

#[tokio::test]
async fn duplicate_client_name_is_refused() {
    let broker = broker().await;
    let _first = client(&broker, "alice").await;

    let second = Client::new(
        ClientConfig::builder()
            .urls(broker.addr().to_string())
            .name("alice")
            .build(),
    );
    assert!(second.connect().await.is_err());
    assert_eq!(broker.client_count().await, 1);
}

#[tokio::test]
async fn simultaneous_same_name_registrations_admit_one() {
    let broker = broker().await;
    // neither record exists when both name checks start; the
    // registration lock has to decide the race
    let first = Client::new(
        ClientConfig::builder()
            .urls(broker.addr().to_string())
            .name("alice")
            .build(),
    );
    let second = Client::new(
        ClientConfig::builder()
            .urls(broker.addr().to_string())
            .name("alice")
            .build(),
    );
    let (r1, r2) = tokio::join!(first.connect(), second.connect());
    assert!(r1.is_ok() != r2.is_ok(), "{r1:?} vs {r2:?}");
    assert_eq!(broker.client_count().await, 1);
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let config = BrokerConfig::builder()
        .addr("127.0.0.1:0")
        .password("sesame")
        .build();
    let broker = Broker::start(config).await.unwrap();

    let wrong = Client::new(
        ClientConfig::builder()
            .urls(broker.addr().to_string())
            .name("intruder")
            .password("guess")
            .build(),
    );
    assert!(wrong.connect().await.is_err());

    let right = Client::new(
        ClientConfig::builder()
            .urls(broker.addr().to_string())
            .name("friend")
            .password("sesame")
            .build(),
    );
    right.connect().await.unwrap();
}

#[tokio::test]
async fn send_and_get_resolves_with_first_response() {
    let broker = broker().await;
    let requester = client(&broker, "requester").await;
    let responder = client(&broker, "responder").await;

    let (callback, mut rx) = collector();
    responder.subscribe("ping", "rpc", callback).await.unwrap();

    let responder2 = responder.clone();
    let serve = tokio::spawn(async move {
        let req = rx.recv().await.unwrap();
        assert!(req.is_get_request);
        let resp = req.respond("pong", "rpc").with_text("hello back");
        responder2.send(resp).await.unwrap();
    });

    let answer = requester
        .send_and_get(
            Message::new("ping", "rpc").with_text("hello"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(answer.text, "hello back");
    assert!(answer.is_get_response);
    serve.await.unwrap();

    // the broker keeps no bookkeeping after completion
    assert_eq!(broker.pending_get_count().await, 0);
}

#[tokio::test]
async fn send_and_get_times_out_without_responder() {
    let broker = broker().await;
    let requester = client(&broker, "requester").await;

    let outcome = requester
        .send_and_get(
            Message::new("void", "rpc"),
            Duration::from_millis(300),
        )
        .await;
    assert!(matches!(outcome, Err(cumulus::Error::Timeout)));

    // the forget message cleans the broker up; give it a moment
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.pending_get_count().await, 0);
}

#[tokio::test]
async fn subscribe_and_get_resolves_with_first_match() {
    let broker = broker().await;
    let producer = client(&broker, "producer").await;
    let waiter = client(&broker, "waiter").await;

    let waiter2 = waiter.clone();
    let get = tokio::spawn(async move {
        waiter2
            .subscribe_and_get("boot", "done", Duration::from_secs(5))
            .await
    });
    // let the one-shot registration land first
    tokio::time::sleep(Duration::from_millis(150)).await;

    producer
        .send(Message::new("boot", "done").with_text("ready"))
        .await
        .unwrap();
    let got = get.await.unwrap().unwrap();
    assert_eq!(got.text, "ready");
    assert_eq!(broker.pending_get_count().await, 0);
}

#[tokio::test]
async fn unreliable_send_travels_udp() {
    let broker = broker().await;
    let producer = client(&broker, "producer").await;
    let consumer = client(&broker, "consumer").await;

    let (callback, mut rx) = collector();
    consumer.subscribe("lossy", "*", callback).await.unwrap();

    producer
        .send(Message::new("lossy", "sample").with_text("v").unreliable())
        .await
        .unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("udp delivery")
        .unwrap();
    assert_eq!(got.subject, "lossy");
}

#[tokio::test]
async fn shutdown_clients_matches_by_pattern() {
    let broker = broker().await;
    let admin = client(&broker, "admin").await;
    let victim = client(&broker, "worker-1").await;
    let safe = client(&broker, "observer").await;

    admin.shutdown_clients("worker*", false).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if victim.state() != cumulus::client::ConnectionState::Connected {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "victim survived");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        safe.state(),
        cumulus::client::ConnectionState::Connected
    );
    assert_eq!(
        admin.state(),
        cumulus::client::ConnectionState::Connected
    );
}
