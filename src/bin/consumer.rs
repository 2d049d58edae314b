use std::time::Duration;

use kerbka::prelude::{ConsumerBuilder, MembershipState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .init();

    let topic = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("KAFKA_TOPIC").ok())
        .ok_or_else(|| tracing::error!("pass a topic or set KAFKA_TOPIC"))?;

    let mut consumer = ConsumerBuilder::from_env(vec![topic])
        .map_err(|err| tracing::error!("{:?}", err))?
        .build()
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;

    let mut empty_polls = 0;
    while empty_polls < 5 {
        let messages = consumer
            .poll(100, Duration::from_secs(1))
            .await
            .map_err(|err| tracing::error!("{:?}", err))?;
        if messages.is_empty() {
            // polls spent joining do not count
            if consumer.state() == MembershipState::Stable {
                empty_polls += 1;
            }
            continue;
        }
        empty_polls = 0;

        for message in &messages {
            let value = message
                .value
                .as_ref()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            tracing::info!(
                "{}-{}@{} key={:?} value={}",
                message.topic,
                message.partition,
                message.offset,
                message.key,
                value
            );
        }
        if let Err(err) = consumer.commit_consumed().await {
            tracing::warn!("Commit failed: {:?}", err);
        }
    }

    consumer.close().await.map_err(|err| tracing::error!("{:?}", err))
}
