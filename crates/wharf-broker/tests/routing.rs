mod common;

use bytes::Bytes;
use std::time::Duration;
use common::{Cluster, assert_no_push, next_push, uri};
use wharf_broker::OpenOptions;
use wharf_common::{ConfirmSelector, ConsumerParams, DomainConfig, Message, RoutingMode};

fn domains() -> Vec<DomainConfig> {
    vec![
        DomainConfig::new("prio", RoutingMode::Priority),
        DomainConfig::new(
            "fan",
            RoutingMode::Fanout {
                app_ids: vec!["foo".into(), "bar".into()],
            },
        ),
        DomainConfig::new("bcast", RoutingMode::Broadcast),
    ]
}

fn msg(body: &'static str) -> Message {
    Message::new(Bytes::from_static(body.as_bytes()))
}

#[tokio::test]
async fn higher_priority_consumer_gets_message_until_it_closes() {
    let cluster = Cluster::start(&["n1"], &domains()).await;
    let queue = uri("wharf://prio/q");
    let a = cluster.session();
    let b = cluster.session();
    let producer = cluster.session();

    let mut a_queue = a
        .open(
            &queue,
            OpenOptions::reader().with_params(ConsumerParams::default().with_priority(2)),
        )
        .await
        .expect("open a");
    let mut b_queue = b
        .open(
            &queue,
            OpenOptions::reader().with_params(ConsumerParams::default().with_priority(1)),
        )
        .await
        .expect("open b");
    producer
        .open(&queue, OpenOptions::writer())
        .await
        .expect("open producer");
    producer
        .post_and_wait(&queue, msg("msg"))
        .await
        .expect("ack");

    assert_eq!(next_push(&mut a_queue.pushes).await.payload, "msg");
    assert_no_push(&mut b_queue.pushes).await;

    a.close(&queue).await.expect("close a");
    assert_eq!(next_push(&mut b_queue.pushes).await.payload, "msg");
}

#[tokio::test]
async fn saturated_top_tier_does_not_spill_to_lower_tier() {
    let cluster = Cluster::start(&["n1"], &domains()).await;
    let queue = uri("wharf://prio/q");
    let high = cluster.session();
    let low = cluster.session();
    let producer = cluster.session();

    let mut high_queue = high
        .open(
            &queue,
            OpenOptions::reader()
                .with_params(ConsumerParams::default().with_priority(5).with_caps(1, 1024)),
        )
        .await
        .expect("open high");
    let mut low_queue = low
        .open(&queue, OpenOptions::reader())
        .await
        .expect("open low");
    producer
        .open(&queue, OpenOptions::writer())
        .await
        .expect("open producer");
    for body in ["one", "two"] {
        producer.post_and_wait(&queue, msg(body)).await.expect("ack");
    }

    let first = next_push(&mut high_queue.pushes).await;
    assert_eq!(first.payload, "one");
    assert_no_push(&mut low_queue.pushes).await;

    // Capacity freed by the confirm re-enables delivery without a new post.
    high.confirm(&queue, ConfirmSelector::Guid(first.guid))
        .await
        .expect("confirm");
    assert_eq!(next_push(&mut high_queue.pushes).await.payload, "two");
    assert_no_push(&mut low_queue.pushes).await;
}

#[tokio::test]
async fn byte_cap_blocks_second_message_until_confirm() {
    let cluster = Cluster::start(&["n1"], &domains()).await;
    let queue = uri("wharf://prio/q");
    let consumer = cluster.session();
    let producer = cluster.session();

    let mut opened = consumer
        .open(
            &queue,
            OpenOptions::reader().with_params(ConsumerParams::default().with_caps(2, 3)),
        )
        .await
        .expect("open consumer");
    producer
        .open(&queue, OpenOptions::writer())
        .await
        .expect("open producer");
    producer.post_and_wait(&queue, msg("123")).await.expect("ack");
    producer.post_and_wait(&queue, msg("1")).await.expect("ack");

    assert_eq!(next_push(&mut opened.pushes).await.payload, "123");
    assert_no_push(&mut opened.pushes).await;

    consumer
        .confirm(&queue, ConfirmSelector::Oldest(1))
        .await
        .expect("confirm");
    assert_eq!(next_push(&mut opened.pushes).await.payload, "1");
}

#[tokio::test]
async fn fanout_apps_consume_independently() {
    let cluster = Cluster::start(&["n1"], &domains()).await;
    let foo_uri = uri("wharf://fan/q?id=foo");
    let bar_uri = uri("wharf://fan/q?id=bar");
    let writer_uri = uri("wharf://fan/q");
    let foo = cluster.session();
    let bar = cluster.session();
    let producer = cluster.session();

    let mut foo_queue = foo
        .open(&foo_uri, OpenOptions::reader())
        .await
        .expect("open foo");
    let mut bar_queue = bar
        .open(&bar_uri, OpenOptions::reader())
        .await
        .expect("open bar");
    producer
        .open(&writer_uri, OpenOptions::writer())
        .await
        .expect("open producer");
    producer
        .post_and_wait(&writer_uri, msg("fan"))
        .await
        .expect("ack");

    let foo_event = next_push(&mut foo_queue.pushes).await;
    let bar_event = next_push(&mut bar_queue.pushes).await;
    assert_eq!(foo_event.guid, bar_event.guid);
    assert_eq!(bar_event.uri, bar_uri);

    foo.confirm(&foo_uri, ConfirmSelector::All)
        .await
        .expect("confirm foo");
    let broker = cluster.node("n1").broker();
    let mut stats = None;
    for _ in 0..200 {
        let current = broker.queue_stats(writer_uri.key()).await.expect("stats");
        if current.branch("foo").map(|b| b.unconfirmed) == Some(0) {
            stats = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = stats.expect("foo confirm applied");
    assert_eq!(stats.branch("bar").map(|b| b.unconfirmed), Some(1));
}

#[tokio::test]
async fn broadcast_reaches_only_connected_consumers() {
    let cluster = Cluster::start(&["n1"], &domains()).await;
    let queue = uri("wharf://bcast/q");
    let early = cluster.session();
    let late = cluster.session();
    let producer = cluster.session();

    let mut early_queue = early
        .open(&queue, OpenOptions::reader())
        .await
        .expect("open early");
    producer
        .open(&queue, OpenOptions::writer())
        .await
        .expect("open producer");
    producer
        .post_and_wait(&queue, msg("now"))
        .await
        .expect("ack");
    let mut late_queue = late
        .open(&queue, OpenOptions::reader())
        .await
        .expect("open late");

    assert_eq!(next_push(&mut early_queue.pushes).await.payload, "now");
    assert_no_push(&mut late_queue.pushes).await;

    producer
        .post_and_wait(&queue, msg("later"))
        .await
        .expect("ack");
    assert_eq!(next_push(&mut early_queue.pushes).await.payload, "later");
    assert_eq!(next_push(&mut late_queue.pushes).await.payload, "later");
}

#[tokio::test]
async fn paused_consumer_resumes_after_configure() {
    let cluster = Cluster::start(&["n1"], &domains()).await;
    let queue = uri("wharf://prio/q");
    let consumer = cluster.session();
    let producer = cluster.session();

    let mut opened = consumer
        .open(&queue, OpenOptions::reader())
        .await
        .expect("open consumer");
    consumer
        .configure(&queue, ConsumerParams::default().with_caps(0, 0))
        .await
        .expect("pause");
    producer
        .open(&queue, OpenOptions::writer())
        .await
        .expect("open producer");
    producer
        .post_and_wait(&queue, msg("held"))
        .await
        .expect("ack");
    assert_no_push(&mut opened.pushes).await;

    consumer
        .configure(&queue, ConsumerParams::default())
        .await
        .expect("resume");
    assert_eq!(next_push(&mut opened.pushes).await.payload, "held");
}
