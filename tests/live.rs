//! Runs against a real cluster when `KAFKA_BROKERS` and `KAFKA_TOPIC` are set.
mod testsupport;

use std::time::Duration;

use kerbka::prelude::*;

#[tokio::test]
async fn it_can_produce_and_consume_on_a_cluster() {
    let (brokers, topic) = match testsupport::live_cluster() {
        Some(cluster) => cluster,
        None => return,
    };
    let config = ClientConfig::from_servers(&brokers, SecurityProtocol::Plaintext).unwrap();

    let producer = testsupport::producer(config.clone(), &topic).await;
    let key = format!("live-{}", std::process::id());
    let delivered = producer
        .send(ProduceMessage::new(topic.as_str(), "123!").with_key(key.clone()))
        .await
        .unwrap();
    producer.close().await.unwrap();
    let offset = delivered.offset.unwrap();

    let group = format!("kerbka-live-{}", std::process::id());
    let mut consumer = testsupport::consumer(config, &group, &topic)
        .auto_offset_reset(AutoOffsetReset::Earliest)
        .build()
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let mut found = false;
    while !found && tokio::time::Instant::now() < deadline {
        let records = consumer.poll(500, Duration::from_millis(500)).await.unwrap();
        found = records.iter().any(|r| {
            r.partition == delivered.partition
                && r.offset == offset
                && r.key.as_deref() == Some(key.as_bytes())
        });
    }
    assert!(found, "record at offset {} never arrived", offset);
    consumer.close().await.unwrap();
}
