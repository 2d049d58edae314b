use std::time::{SystemTime, UNIX_EPOCH};

use kerbka::prelude::{ProduceMessage, ProducerBuilder};
use serde_derive::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct Event<'a> {
    user_id: u32,
    action: &'a str,
    timestamp: u64,
}

#[tokio::main]
async fn main() -> Result<(), ()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .init();

    let topic = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("KAFKA_TOPIC").ok())
        .ok_or_else(|| tracing::error!("pass a topic or set KAFKA_TOPIC"))?;

    let producer = ProducerBuilder::from_env()
        .map_err(|err| tracing::error!("{:?}", err))?
        .topics(vec![topic.clone()])
        .build()
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;

    for user_id in 0..10 {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let event = Event {
            user_id,
            action: "login",
            timestamp,
        };
        let message = ProduceMessage::json(topic.as_str(), &event)
            .map_err(|err| tracing::error!("{:?}", err))?
            .with_key(format!("user_{}", user_id));
        match producer.send(message).await {
            Ok(metadata) => tracing::info!(
                "Delivered to {}-{} at offset {:?}",
                metadata.topic,
                metadata.partition,
                metadata.offset
            ),
            Err(err) => tracing::error!("Delivery failed: {:?}", err),
        }
    }

    producer.close().await.map_err(|err| tracing::error!("{:?}", err))
}
