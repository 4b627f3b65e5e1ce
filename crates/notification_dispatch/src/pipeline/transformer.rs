/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use crate::{common::types::NotificationCommand, tools::error::AppError};

/// Parse a raw bus payload into a command. One call covers JSON parsing and
/// recipient canonicalization; a failure of either is a poison message, not
/// a transient fault.
pub fn decode_command(payload: &[u8]) -> Result<NotificationCommand, AppError> {
    serde_json::from_slice(payload)
        .map_err(|err| AppError::MalformedCommand(format!("failed to decode command: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_well_formed_command() {
        let command = decode_command(
            br#"{"recipient":"urn:x:user:A","content":{"title":"hi"},"data":{"k":"v"}}"#,
        )
        .expect("decode");
        assert_eq!(command.recipient.as_str(), "urn:x:user:A");
        assert_eq!(command.data.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn malformed_json_is_a_malformed_command() {
        let err = decode_command(br#"{"this is not valid json"#).expect_err("must fail");
        assert!(matches!(err, AppError::MalformedCommand(_)));
    }

    #[test]
    fn invalid_recipient_urn_is_a_malformed_command() {
        let err = decode_command(br#"{"recipient":"not-a-urn","content":{"title":"hi"}}"#)
            .expect_err("must fail");
        assert!(matches!(err, AppError::MalformedCommand(_)));
    }
}
