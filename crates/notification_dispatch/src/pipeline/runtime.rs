/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::{sync::Arc, time::Duration, time::Instant};

use anyhow::{anyhow, Result};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{error, info};

use crate::{
    bus::MessageConsumer,
    pipeline::processor::Processor,
    tools::prometheus::{CONSUMED_COMMANDS, HANDLER_DURATION, RETRIED_COMMANDS},
};

/// Worker pool pulling from the bus. Workers are independent; there is no
/// ordering between messages and no internal queue, so the bus's
/// outstanding-message limit is the back-pressure.
pub struct Pipeline {
    consumer: Arc<dyn MessageConsumer>,
    processor: Arc<Processor>,
    num_workers: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(
        num_workers: usize,
        consumer: Arc<dyn MessageConsumer>,
        processor: Arc<Processor>,
    ) -> Self {
        Pipeline {
            consumer,
            processor,
            num_workers: num_workers.max(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.num_workers {
            let consumer = self.consumer.clone();
            let processor = self.processor.clone();
            workers.push(tokio::spawn(async move {
                while let Some(delivery) = consumer.receive().await {
                    CONSUMED_COMMANDS.inc();
                    let start_time = Instant::now();

                    match processor.handle(delivery.payload()).await {
                        Ok(()) => {
                            HANDLER_DURATION
                                .with_label_values(&["ack"])
                                .observe(start_time.elapsed().as_secs_f64());
                            delivery.ack().await;
                        }
                        Err(err) => {
                            error!("Handler failed for message {} : {err}", delivery.id());
                            HANDLER_DURATION
                                .with_label_values(&["nack"])
                                .observe(start_time.elapsed().as_secs_f64());
                            RETRIED_COMMANDS.inc();
                            delivery.nack().await;
                        }
                    }
                }
                info!("Pipeline worker {worker_id} stopped");
            }));
        }
        info!("Pipeline started with {} workers", self.num_workers);
    }

    /// Stop pulling new messages, wait for in-flight handlers up to the
    /// deadline, then cancel whatever remains.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        self.consumer.stop().await;

        let mut workers = self.workers.lock().await;
        let mut handles: Vec<JoinHandle<()>> = workers.drain(..).collect();
        drop(workers);

        let deadline = tokio::time::Instant::now() + grace;
        let mut cancelled = 0usize;
        for handle in handles.iter_mut() {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            for handle in &handles {
                handle.abort();
            }
            return Err(anyhow!(
                "{cancelled} pipeline workers did not finish within {grace:?} and were cancelled"
            ));
        }
        Ok(())
    }
}
