/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use thiserror::Error;

pub mod fcm;
pub mod mobile;
pub mod web;

/// Errors a dispatcher hands back to the pipeline. `Transport` and
/// `Transient` cause the whole command to be redelivered; `Payload` means
/// nothing in the command can succeed on retry but follows the same nack
/// path so the bus's attempt budget applies.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("provider transport failed: {0}")]
    Transport(String),
    #[error("transient delivery failures: {0}")]
    Transient(String),
    #[error("payload construction failed: {0}")]
    Payload(String),
}
