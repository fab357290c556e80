//! Broker federation: joining a cloud, bridged subscriptions, and
//! cloud-wide get and registration semantics.

use std::sync::Arc;
use std::time::Duration;

use cumulus::client::{Client, ClientConfig, SubscriptionCallback};
use cumulus::proto::CloudStatus;
use cumulus::{Broker, BrokerConfig, Message};
use tokio::sync::mpsc;

async fn standalone() -> Broker {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::level_filters::LevelFilter::TRACE)
        .try_init();
    Broker::start(BrokerConfig::builder().addr("127.0.0.1:0").build())
        .await
        .expect("broker start")
}

async fn joiner(seed: &Broker) -> Broker {
    Broker::start(
        BrokerConfig::builder()
            .addr("127.0.0.1:0")
            .cloud_seeds(seed.url())
            .build(),
    )
    .await
    .expect("broker start")
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

fn collector() -> (SubscriptionCallback, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: SubscriptionCallback = Arc::new(move |msg| {
        let _ = tx.send(msg);
    });
    (callback, rx)
}

/// Polls until both brokers report in-cloud and see each other.
async fn await_cloud(brokers: &[&Broker]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut ready = true;
        for broker in brokers {
            if broker.cloud_status().await != CloudStatus::InCloud
                || broker.bridge_count().await < brokers.len() - 1
            {
                ready = false;
                break;
            }
        }
        if ready {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cloud did not form"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn joiner_reaches_in_cloud_with_reciprocal_bridge() {
    let a = standalone().await;
    assert_eq!(a.cloud_status().await, CloudStatus::InCloud);

    let b = joiner(&a).await;
    await_cloud(&[&a, &b]).await;
    assert_eq!(a.bridge_count().await, 1);
    assert_eq!(b.bridge_count().await, 1);
}

#[tokio::test]
async fn subscription_bridges_across_the_cloud() {
    let a = standalone().await;
    let b = joiner(&a).await;
    await_cloud(&[&a, &b]).await;

    let consumer = client(&a, "consumer").await;
    let producer = client(&b, "producer").await;

    let (callback, mut rx) = collector();
    consumer.subscribe("weather", "*", callback).await.unwrap();
    // the subscribe must fan out to b before publishing is meaningful
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while b.subscription_count().await == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    producer
        .send(Message::new("weather", "rain").with_text("heavy"))
        .await
        .unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("bridged delivery")
        .unwrap();
    assert_eq!(got.subject, "weather");
    assert_eq!(got.text, "heavy");
    assert_eq!(got.sender, "producer");
}

#[tokio::test]
async fn subscription_made_before_join_is_replayed() {
    let a = standalone().await;
    let consumer = client(&a, "consumer").await;
    let (callback, mut rx) = collector();
    consumer.subscribe("early", "*", callback).await.unwrap();

    // the broker joining later must learn about the standing
    // subscription through the join-time replay
    let b = joiner(&a).await;
    await_cloud(&[&a, &b]).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while b.subscription_count().await == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let producer = client(&b, "producer").await;
    producer.send(Message::new("early", "bird")).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("replayed delivery")
        .unwrap();
    assert_eq!(got.subject, "early");
}

#[tokio::test]
async fn client_names_are_unique_cloud_wide() {
    let a = standalone().await;
    let b = joiner(&a).await;
    await_cloud(&[&a, &b]).await;

    let _alice_on_a = client(&a, "alice").await;
    let alice_on_b = Client::new(
        ClientConfig::builder()
            .urls(b.addr().to_string())
            .name("alice")
            .build(),
    );
    assert!(alice_on_b.connect().await.is_err());
    assert_eq!(b.client_count().await, 0);
}

#[tokio::test]
async fn send_and_get_finds_responder_on_another_broker() {
    let a = standalone().await;
    let b = joiner(&a).await;
    await_cloud(&[&a, &b]).await;

    let requester = client(&a, "requester").await;
    let responder = client(&b, "responder").await;

    let (callback, mut rx) = collector();
    responder.subscribe("ask", "rpc", callback).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.subscription_count().await == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let responder2 = responder.clone();
    let serve = tokio::spawn(async move {
        let req = rx.recv().await.unwrap();
        assert!(req.is_get_request);
        responder2
            .send(req.respond("answer", "rpc").with_text("42"))
            .await
            .unwrap();
    });

    let answer = requester
        .send_and_get(
            Message::new("ask", "rpc").with_text("meaning of life"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(answer.text, "42");
    serve.await.unwrap();

    // completion cancels the fanned-out copies everywhere
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if a.pending_get_count().await == 0
            && b.pending_get_count().await == 0
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "get leaked");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn subscribe_and_get_matches_remote_publish() {
    let a = standalone().await;
    let b = joiner(&a).await;
    await_cloud(&[&a, &b]).await;

    let waiter = client(&a, "waiter").await;
    let producer = client(&b, "producer").await;

    let waiter2 = waiter.clone();
    let get = tokio::spawn(async move {
        waiter2
            .subscribe_and_get("deploy", "done", Duration::from_secs(5))
            .await
    });
    // wait for the one-shot to fan out to b
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while b.pending_get_count().await == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    producer
        .send(Message::new("deploy", "done").with_text("v1.2"))
        .await
        .unwrap();
    let got = get.await.unwrap().unwrap();
    assert_eq!(got.text, "v1.2");
}

#[tokio::test]
async fn three_brokers_form_a_full_mesh() {
    let a = standalone().await;
    let b = joiner(&a).await;
    await_cloud(&[&a, &b]).await;
    let c = joiner(&a).await;
    await_cloud(&[&a, &b, &c]).await;

    // traffic crosses the mesh edge that discovery created (b <-> c)
    let consumer = client(&b, "consumer").await;
    let producer = client(&c, "producer").await;
    let (callback, mut rx) = collector();
    consumer.subscribe("mesh", "*", callback).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while c.subscription_count().await == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    producer.send(Message::new("mesh", "hop")).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("mesh delivery")
        .unwrap();
    assert_eq!(got.subject, "mesh");
}

#[tokio::test]
async fn contending_joiners_both_reach_in_cloud() {
    let a = standalone().await;
    // both contend for the seed's cloud lock at the same time; the
    // loser retries with backoff instead of wedging
    let (b, c) = tokio::join!(joiner(&a), joiner(&a));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if b.cloud_status().await == CloudStatus::InCloud
            && c.cloud_status().await == CloudStatus::InCloud
            && a.bridge_count().await == 2
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "joiners stuck");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(b.bridge_count().await >= 1);
    assert!(c.bridge_count().await >= 1);

    // the cloud that came out of the race carries traffic
    let consumer = client(&b, "consumer").await;
    let producer = client(&a, "producer").await;
    let (callback, mut rx) = collector();
    consumer.subscribe("race", "*", callback).await.unwrap();
    let settle = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.subscription_count().await == 0 {
        assert!(tokio::time::Instant::now() < settle);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    producer.send(Message::new("race", "won")).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery after contended join")
        .unwrap();
    assert_eq!(got.subject, "race");
}

#[tokio::test]
async fn simultaneous_same_name_registrations_admit_at_most_one() {
    let a = standalone().await;
    let b = joiner(&a).await;
    await_cloud(&[&a, &b]).await;

    let on_a = Client::new(
        ClientConfig::builder()
            .urls(a.addr().to_string())
            .name("mallory")
            .build(),
    );
    let on_b = Client::new(
        ClientConfig::builder()
            .urls(b.addr().to_string())
            .name("mallory")
            .build(),
    );
    let (r1, r2) = tokio::join!(on_a.connect(), on_b.connect());
    assert!(
        !(r1.is_ok() && r2.is_ok()),
        "the same name registered on both brokers"
    );
    assert!(a.client_count().await + b.client_count().await <= 1);
}

#[tokio::test]
async fn remote_message_is_not_echoed_back() {
    let a = standalone().await;
    let b = joiner(&a).await;
    await_cloud(&[&a, &b]).await;

    // subscribers on both sides; the producer's message must arrive
    // exactly once at each, never bounce between the brokers
    let on_a = client(&a, "on-a").await;
    let on_b = client(&b, "on-b").await;
    let producer = client(&a, "producer").await;

    let (cb_a, mut rx_a) = collector();
    let (cb_b, mut rx_b) = collector();
    on_a.subscribe("echo", "*", cb_a).await.unwrap();
    on_b.subscribe("echo", "*", cb_b).await.unwrap();
    // both subscriptions share one table key per broker, so the count
    // settles at one; give the cross-broker fan-out a moment to land
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.subscription_count().await < 1 || b.subscription_count().await < 1
    {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    producer.send(Message::new("echo", "once")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx_a.recv())
        .await
        .expect("local delivery")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
        .await
        .expect("bridged delivery")
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(500), rx_a.recv())
            .await
            .is_err(),
        "duplicate on a"
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(500), rx_b.recv())
            .await
            .is_err(),
        "duplicate on b"
    );
}
