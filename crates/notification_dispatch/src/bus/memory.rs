/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::warn;

use super::{Delivery, MessageConsumer};

#[derive(Debug, Clone)]
struct Envelope {
    id: String,
    payload: Vec<u8>,
    attempt: u32,
}

struct Inner {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    dead_letters: Mutex<Vec<Vec<u8>>>,
    shutdown_tx: watch::Sender<bool>,
    max_delivery_attempts: u32,
    min_backoff: Duration,
}

/// An in-process bus honoring the full contract: redelivery with a minimum
/// backoff, a delivery-attempt budget, and a dead-letter sink that captures
/// the original bytes. Drives the scenario tests.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    pub fn new(max_delivery_attempts: u32, min_backoff: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        InMemoryBus {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(rx),
                dead_letters: Mutex::new(Vec::new()),
                shutdown_tx,
                max_delivery_attempts,
                min_backoff,
            }),
        }
    }

    pub fn publish(&self, payload: Vec<u8>) {
        let envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            attempt: 1,
        };
        if self.inner.tx.send(envelope).is_err() {
            warn!("In-memory bus is closed, dropping published message");
        }
    }

    /// Messages that exceeded the attempt budget, byte-identical to what was
    /// published.
    pub async fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.inner.dead_letters.lock().await.clone()
    }
}

struct MemoryDelivery {
    envelope: Envelope,
    inner: Arc<Inner>,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn id(&self) -> &str {
        &self.envelope.id
    }

    fn payload(&self) -> &[u8] {
        &self.envelope.payload
    }

    async fn ack(self: Box<Self>) {}

    async fn nack(self: Box<Self>) {
        let envelope = self.envelope;
        let inner = self.inner;

        if envelope.attempt >= inner.max_delivery_attempts {
            inner.dead_letters.lock().await.push(envelope.payload);
            return;
        }

        let redelivery = Envelope {
            attempt: envelope.attempt + 1,
            ..envelope
        };
        let backoff = inner.min_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = inner.tx.send(redelivery);
        });
    }
}

#[async_trait]
impl MessageConsumer for InMemoryBus {
    async fn receive(&self) -> Option<Box<dyn Delivery>> {
        if *self.inner.shutdown_tx.borrow() {
            return None;
        }

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut rx = self.inner.rx.lock().await;
        if *shutdown_rx.borrow() {
            return None;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => None,
            envelope = rx.recv() => envelope.map(|envelope| {
                Box::new(MemoryDelivery {
                    envelope,
                    inner: self.inner.clone(),
                }) as Box<dyn Delivery>
            }),
        }
    }

    async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn redelivers_until_the_attempt_budget_then_dead_letters() {
        let bus = InMemoryBus::new(3, Duration::from_millis(1));
        bus.publish(b"poison".to_vec());

        for _ in 0..3 {
            let delivery = bus.receive().await.expect("delivery");
            assert_eq!(delivery.payload(), b"poison");
            delivery.nack().await;
        }

        // The budget is spent: nothing further arrives and the original
        // bytes land on the dead-letter sink.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.dead_letters().await, vec![b"poison".to_vec()]);

        bus.stop().await;
        assert!(bus.receive().await.is_none());
    }

    #[tokio::test]
    async fn ack_completes_the_message() {
        let bus = InMemoryBus::new(3, Duration::from_millis(1));
        bus.publish(b"cmd".to_vec());

        let delivery = bus.receive().await.expect("delivery");
        delivery.ack().await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bus.dead_letters().await.is_empty());

        bus.stop().await;
        assert!(bus.receive().await.is_none());
    }

    #[tokio::test]
    async fn stop_releases_blocked_receivers() {
        let bus = InMemoryBus::new(3, Duration::from_millis(1));
        let receiver = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.receive().await.is_none() })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.stop().await;
        assert!(receiver.await.expect("join"));
    }
}
