/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use async_trait::async_trait;

pub mod kafka;
pub mod memory;

/// One delivery of a bus message. Exactly one of `ack`/`nack` must be
/// called; dropping the delivery without either leaves redelivery to the
/// bus's own timeout.
#[async_trait]
pub trait Delivery: Send {
    fn id(&self) -> &str;
    fn payload(&self) -> &[u8];

    /// Positive acknowledgement: the command is done, never redeliver.
    async fn ack(self: Box<Self>);

    /// Negative acknowledgement: the bus redelivers according to its retry
    /// policy and dead-letters once attempts are exhausted.
    async fn nack(self: Box<Self>);
}

/// The consuming side of the message bus. Implementations must be safe to
/// call from many workers concurrently.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Blocks until a message is available. Returns `None` once the
    /// consumer has been stopped and the stream is drained.
    async fn receive(&self) -> Option<Box<dyn Delivery>>;

    /// Stop pulling new messages. In-flight deliveries stay valid.
    async fn stop(&self);
}
