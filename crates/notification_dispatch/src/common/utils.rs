/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use sha2::{Digest, Sha256};

/// Deterministic storage key for a device row, derived from the channel's
/// unique identifier (the mobile token or the web endpoint). Re-registering
/// the same endpoint therefore lands on the same row.
pub fn device_key(unique_id: &str) -> String {
    hex::encode(Sha256::digest(unique_id.as_bytes()))
}

/// Decode a base64 string that may be standard or URL-safe, with or without
/// padding. Browsers and push libraries disagree on which alphabet they
/// hand out.
pub fn decode_base64_flexible(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD
        .decode(input)
        .or_else(|_| URL_SAFE.decode(input))
        .or_else(|_| STANDARD.decode(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    #[test]
    fn device_key_is_deterministic() {
        assert_eq!(device_key("tok-1"), device_key("tok-1"));
        assert_ne!(device_key("tok-1"), device_key("tok-2"));
        assert_eq!(device_key("tok-1").len(), 64);
    }

    #[test]
    fn flexible_decode_accepts_all_common_alphabets() {
        let bytes = vec![0xff, 0xfe, 0x01, 0x02, 0x03];
        let url_safe = URL_SAFE_NO_PAD.encode(&bytes);
        let standard = base64::engine::general_purpose::STANDARD.encode(&bytes);
        assert_eq!(decode_base64_flexible(&url_safe).expect("url-safe"), bytes);
        assert_eq!(decode_base64_flexible(&standard).expect("standard"), bytes);
        assert!(decode_base64_flexible("not base64!!!").is_err());
    }
}
