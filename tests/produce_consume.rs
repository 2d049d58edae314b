mod testsupport;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use kerbka::prelude::*;
use kerbka::protocol::Header;
use serde_derive::{Deserialize, Serialize};
use testsupport::{
    BrokerOptions, MockBroker, MESSAGE_TOO_LARGE, NOT_LEADER_FOR_PARTITION, PRODUCE,
    REQUEST_TIMED_OUT,
};
use tokio_stream::StreamExt;

const TOPIC: &str = "purchases";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Purchase {
    user_id: u32,
    item: String,
}

#[tokio::test]
async fn it_can_produce_and_consume() {
    let broker = MockBroker::start(BrokerOptions::default().topic(TOPIC, 3)).await;

    let producer = testsupport::producer(broker.config(), TOPIC).await;
    let delivered = producer
        .send(
            ProduceMessage::new(TOPIC, "hello")
                .with_key("user_12345")
                .with_header("source", "checkout"),
        )
        .await
        .unwrap();
    producer.close().await.unwrap();

    assert_eq!(delivered.topic, TOPIC);
    assert_eq!(Some(delivered.partition), partition_for_key(b"user_12345", 3));
    assert_eq!(delivered.offset, Some(0));

    let mut consumer = testsupport::consumer(broker.config(), "round-trip", TOPIC)
        .build()
        .await
        .unwrap();
    let records = testsupport::consume(&mut consumer, 1, Duration::from_secs(5)).await;

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.topic, TOPIC);
    assert_eq!(record.partition, delivered.partition);
    assert_eq!(record.offset, 0);
    assert_eq!(record.key.as_deref(), Some(&b"user_12345"[..]));
    assert_eq!(record.value.as_deref(), Some(&b"hello"[..]));
    assert_eq!(record.headers, vec![Header::new("source", "checkout")]);

    assert_eq!(consumer.state(), MembershipState::Stable);
    assert_eq!(consumer.assignment().len(), 3);
    assert_eq!(
        consumer.position(&TopicPartition::new(TOPIC, delivered.partition)),
        Some(1)
    );

    consumer.commit_consumed().await.unwrap();
    assert_eq!(broker.committed("round-trip", TOPIC, delivered.partition), Some(1));

    consumer.close().await.unwrap();
    assert_eq!(consumer.state(), MembershipState::Dead);
    assert!(matches!(
        consumer.poll(1, Duration::from_millis(10)).await,
        Err(Error::ClientClosed)
    ));
}

#[tokio::test]
async fn it_keeps_send_order_per_key() {
    let broker = MockBroker::start(BrokerOptions::default().topic(TOPIC, 4)).await;
    let producer = testsupport::producer(broker.config(), TOPIC).await;

    let keys = ["alice", "bob", "carol"];
    let mut handles = vec![];
    for i in 0..60 {
        let key = keys[i % keys.len()];
        let message = ProduceMessage::new(TOPIC, i.to_string()).with_key(key);
        handles.push(producer.enqueue(message).await.unwrap());
    }
    for handle in handles {
        handle.wait().await.unwrap();
    }
    producer.close().await.unwrap();

    let mut consumer = testsupport::consumer(broker.config(), "ordering", TOPIC)
        .build()
        .await
        .unwrap();
    let records = testsupport::consume(&mut consumer, 60, Duration::from_secs(5)).await;
    assert_eq!(records.len(), 60);

    let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
    for record in &records {
        let key = String::from_utf8(record.key.clone().unwrap().to_vec()).unwrap();
        let value = String::from_utf8_lossy(record.value.as_deref().unwrap()).parse().unwrap();
        assert_eq!(Some(record.partition), partition_for_key(key.as_bytes(), 4));
        by_key.entry(key).or_default().push(value);
    }
    for (n, key) in keys.iter().enumerate() {
        let expected: Vec<usize> = (0..60).filter(|i| i % keys.len() == n).collect();
        assert_eq!(by_key[*key], expected, "records for {} out of order", key);
    }
}

#[tokio::test]
async fn it_round_trips_json_values() {
    let broker = MockBroker::start(BrokerOptions::default().topic(TOPIC, 1)).await;
    let producer = testsupport::producer(broker.config(), TOPIC).await;
    let purchase = Purchase {
        user_id: 12345,
        item: "book".to_owned(),
    };
    producer
        .send(ProduceMessage::json(TOPIC, &purchase).unwrap())
        .await
        .unwrap();
    producer.close().await.unwrap();

    let mut consumer = testsupport::consumer(broker.config(), "json", TOPIC)
        .build()
        .await
        .unwrap();
    let records = testsupport::consume(&mut consumer, 1, Duration::from_secs(5)).await;
    assert_eq!(records[0].json::<Purchase>().unwrap(), purchase);
}

#[tokio::test]
async fn it_returns_an_empty_poll_after_its_timeout() {
    let broker = MockBroker::start(BrokerOptions::default().topic(TOPIC, 1)).await;
    let mut consumer = ConsumerBuilder::new(broker.config(), "idle", vec![TOPIC.to_owned()])
        .build()
        .await
        .unwrap();

    assert!(testsupport::joined(&mut consumer).await.is_empty());

    let started = Instant::now();
    let records = consumer.poll(10, Duration::from_millis(200)).await.unwrap();
    let elapsed = started.elapsed();

    assert!(records.is_empty());
    assert!(elapsed >= Duration::from_millis(190), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "returned after {:?}", elapsed);
}

#[tokio::test]
async fn it_starts_from_the_log_end_with_latest_reset() {
    let broker = MockBroker::start(BrokerOptions::default().topic(TOPIC, 1)).await;
    let producer = testsupport::producer(broker.config(), TOPIC).await;
    producer.send(ProduceMessage::new(TOPIC, "old")).await.unwrap();

    let mut consumer = testsupport::consumer(broker.config(), "latest", TOPIC)
        .auto_offset_reset(AutoOffsetReset::Latest)
        .build()
        .await
        .unwrap();
    assert!(testsupport::joined(&mut consumer).await.is_empty());
    assert_eq!(consumer.position(&TopicPartition::new(TOPIC, 0)), Some(1));

    producer.send(ProduceMessage::new(TOPIC, "new")).await.unwrap();
    let records = testsupport::consume(&mut consumer, 1, Duration::from_secs(5)).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value.as_deref(), Some(&b"new"[..]));
    assert_eq!(records[0].offset, 1);
    producer.close().await.unwrap();
}

#[tokio::test]
async fn it_resumes_from_committed_offsets() {
    let broker = MockBroker::start(BrokerOptions::default().topic(TOPIC, 1)).await;
    let producer = testsupport::producer(broker.config(), TOPIC).await;
    for i in 0..5 {
        producer
            .send(ProduceMessage::new(TOPIC, format!("event-{}", i)))
            .await
            .unwrap();
    }
    producer.close().await.unwrap();

    let mut first = testsupport::consumer(broker.config(), "resume", TOPIC)
        .build()
        .await
        .unwrap();
    let records = testsupport::consume(&mut first, 3, Duration::from_secs(5)).await;
    assert_eq!(records.len(), 3);
    first.commit_consumed().await.unwrap();
    first.close().await.unwrap();
    assert_eq!(broker.committed("resume", TOPIC, 0), Some(3));

    let mut second = testsupport::consumer(broker.config(), "resume", TOPIC)
        .build()
        .await
        .unwrap();
    let records = testsupport::consume(&mut second, 2, Duration::from_secs(5)).await;
    let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![3, 4]);
}

#[tokio::test]
async fn it_streams_polls() {
    let broker = MockBroker::start(BrokerOptions::default().topic(TOPIC, 2)).await;
    let producer = testsupport::producer(broker.config(), TOPIC).await;
    for i in 0..4 {
        producer
            .send(ProduceMessage::new(TOPIC, "v").with_partition(i % 2))
            .await
            .unwrap();
    }
    producer.close().await.unwrap();

    let consumer = testsupport::consumer(broker.config(), "stream", TOPIC)
        .build()
        .await
        .unwrap();
    let stream = consumer.into_stream(Duration::from_millis(100));
    tokio::pin!(stream);

    let mut seen = 0;
    while seen < 4 {
        let batch = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!batch.is_empty());
        seen += batch.len();
    }
    assert_eq!(seen, 4);
}

async fn retrying_producer(broker: &MockBroker, max_retries: u32) -> Producer {
    ProducerBuilder::new(broker.config())
        .topics(vec![TOPIC.to_owned()])
        .linger(Duration::from_millis(2))
        .max_retries(max_retries)
        .retry_backoff(Duration::from_millis(10), Duration::from_millis(40))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn it_retries_transient_produce_errors_in_order() {
    let broker = MockBroker::start(BrokerOptions::default().topic(TOPIC, 1)).await;
    broker.fail_next(PRODUCE, &[NOT_LEADER_FOR_PARTITION, REQUEST_TIMED_OUT]);
    let producer = retrying_producer(&broker, 3).await;

    let mut handles = vec![];
    for i in 0..10 {
        let message = ProduceMessage::new(TOPIC, format!("event-{}", i)).with_key("user_7");
        handles.push(producer.enqueue(message).await.unwrap());
    }
    let mut offsets = vec![];
    for handle in handles {
        offsets.push(handle.wait().await.unwrap().offset.unwrap());
    }
    producer.close().await.unwrap();

    assert_eq!(offsets, (0..10).collect::<Vec<i64>>());
    // two rejected attempts before the first batch went in
    assert!(broker.count(PRODUCE) >= 3, "{} produce requests", broker.count(PRODUCE));
    assert_eq!(broker.log_end_offset(TOPIC, 0), 10);

    let mut consumer = testsupport::consumer(broker.config(), "retries", TOPIC)
        .build()
        .await
        .unwrap();
    let records = testsupport::consume(&mut consumer, 10, Duration::from_secs(5)).await;
    let values: Vec<String> = records
        .iter()
        .map(|r| String::from_utf8(r.value.clone().unwrap().to_vec()).unwrap())
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("event-{}", i)).collect();
    assert_eq!(values, expected);
}

#[tokio::test]
async fn it_gives_up_after_max_retries() {
    let broker = MockBroker::start(BrokerOptions::default().topic(TOPIC, 1)).await;
    broker.fail_next(PRODUCE, &[REQUEST_TIMED_OUT; 3]);
    let producer = retrying_producer(&broker, 2).await;

    let err = producer
        .send(ProduceMessage::new(TOPIC, "late").with_key("user_7"))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Broker(KafkaCode::RequestTimedOut));
    assert_eq!(broker.count(PRODUCE), 3);
    assert_eq!(broker.log_end_offset(TOPIC, 0), 0);

    // the producer carries on with the next record
    let delivered = producer.send(ProduceMessage::new(TOPIC, "on time")).await.unwrap();
    assert_eq!(delivered.offset, Some(0));
    producer.close().await.unwrap();
}

#[tokio::test]
async fn it_does_not_retry_message_too_large() {
    let broker = MockBroker::start(BrokerOptions::default().topic(TOPIC, 1)).await;
    broker.fail_next(PRODUCE, &[MESSAGE_TOO_LARGE]);
    let producer = retrying_producer(&broker, 3).await;

    let err = producer
        .send(ProduceMessage::new(TOPIC, vec![0u8; 1024]))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Broker(KafkaCode::MessageTooLarge));
    assert_eq!(err.disposition(), Disposition::GiveUp);
    assert_eq!(broker.count(PRODUCE), 1);
    assert_eq!(broker.log_end_offset(TOPIC, 0), 0);

    let delivered = producer.send(ProduceMessage::new(TOPIC, "small")).await.unwrap();
    assert_eq!(delivered.offset, Some(0));
    producer.close().await.unwrap();
}
