/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{Header, Headers, Message, OwnedHeaders, OwnedMessage},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
    Offset, TopicPartitionList,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{Delivery, MessageConsumer};

const DELIVERY_ATTEMPTS_HEADER: &str = "delivery-attempts";

#[derive(Debug, Clone)]
pub struct KafkaConsumerConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub dead_letter_topic: Option<String>,
    pub max_delivery_attempts: u32,
    pub min_backoff: Duration,
}

struct KafkaInner {
    consumer: StreamConsumer,
    producer: FutureProducer,
    config: KafkaConsumerConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl KafkaInner {
    /// Republish a payload unchanged, carrying the attempt counter in a
    /// header. The broker has no per-delivery counter of its own.
    async fn produce(&self, topic: &str, payload: &[u8], key: Option<&[u8]>, attempt: u32) {
        let attempt_value = attempt.to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: DELIVERY_ATTEMPTS_HEADER,
            value: Some(attempt_value.as_str()),
        });

        let mut record = FutureRecord::to(topic).payload(payload).headers(headers);
        if let Some(key) = key {
            record = record.key(key);
        }

        if let Err((err, _)) = self
            .producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
        {
            error!("Failed to produce to {topic} : {err}");
        }
    }
}

/// Bus consumer on the Kafka stack. Offsets are committed only after the
/// handler outcome is known; a nack republishes the message for redelivery
/// after the minimum backoff, or dead-letters it once the attempt budget is
/// spent, then moves the offset forward.
pub struct KafkaConsumer {
    inner: Arc<KafkaInner>,
}

impl KafkaConsumer {
    pub fn new(config: KafkaConsumerConfig) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .context("failed to create bus consumer")?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .context("failed to subscribe to bus topic")?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("failed to create bus producer")?;

        if config.dead_letter_topic.is_none() {
            warn!("No dead-letter topic configured; poison messages will be dropped");
        }
        info!(
            "Consuming {} as {} (max attempts {})",
            config.topic, config.group_id, config.max_delivery_attempts
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(KafkaConsumer {
            inner: Arc::new(KafkaInner {
                consumer,
                producer,
                config,
                shutdown_tx,
            }),
        })
    }
}

fn delivery_attempts(message: &OwnedMessage) -> u32 {
    message
        .headers()
        .and_then(|headers| {
            headers.iter().find_map(|header| {
                if header.key != DELIVERY_ATTEMPTS_HEADER {
                    return None;
                }
                header
                    .value
                    .and_then(|value| std::str::from_utf8(value).ok())
                    .and_then(|value| value.parse().ok())
            })
        })
        .unwrap_or(1)
}

struct KafkaDelivery {
    id: String,
    message: OwnedMessage,
    attempt: u32,
    inner: Arc<KafkaInner>,
}

impl KafkaDelivery {
    fn commit(&self) {
        let mut assignment = TopicPartitionList::new();
        if let Err(err) = assignment.add_partition_offset(
            self.message.topic(),
            self.message.partition(),
            Offset::Offset(self.message.offset() + 1),
        ) {
            error!("Failed to build commit list for {} : {err}", self.id);
            return;
        }
        if let Err(err) = self.inner.consumer.commit(&assignment, CommitMode::Async) {
            error!("Failed to commit offset for {} : {err}", self.id);
        }
    }
}

#[async_trait]
impl Delivery for KafkaDelivery {
    fn id(&self) -> &str {
        &self.id
    }

    fn payload(&self) -> &[u8] {
        self.message.payload().unwrap_or_default()
    }

    async fn ack(self: Box<Self>) {
        self.commit();
    }

    async fn nack(self: Box<Self>) {
        let payload = self.message.payload().unwrap_or_default().to_vec();
        let key = self.message.key().map(|key| key.to_vec());

        if self.attempt >= self.inner.config.max_delivery_attempts {
            match &self.inner.config.dead_letter_topic {
                Some(dead_letter_topic) => {
                    warn!(
                        "Message {} exhausted {} delivery attempts, dead-lettering",
                        self.id, self.attempt
                    );
                    self.inner
                        .produce(dead_letter_topic, &payload, key.as_deref(), self.attempt)
                        .await;
                }
                None => error!(
                    "Message {} exhausted {} delivery attempts and no dead-letter topic is configured",
                    self.id, self.attempt
                ),
            }
        } else {
            let inner = self.inner.clone();
            let next_attempt = self.attempt + 1;
            let topic = self.inner.config.topic.clone();
            let backoff = self.inner.config.min_backoff;
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                inner
                    .produce(&topic, &payload, key.as_deref(), next_attempt)
                    .await;
            });
        }

        // The original offset moves forward either way; the redelivery is a
        // fresh record.
        self.commit();
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    async fn receive(&self) -> Option<Box<dyn Delivery>> {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                return None;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => return None,
                result = self.inner.consumer.recv() => match result {
                    Ok(message) => {
                        let message = message.detach();
                        let attempt = delivery_attempts(&message);
                        let id = format!(
                            "{}-{}-{}",
                            message.topic(),
                            message.partition(),
                            message.offset()
                        );
                        return Some(Box::new(KafkaDelivery {
                            id,
                            message,
                            attempt,
                            inner: self.inner.clone(),
                        }));
                    }
                    Err(err) => {
                        error!("Bus receive failed, backing off : {err}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
    }

    async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}
