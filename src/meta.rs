// Platform Sync Engine — the mandatory meta extension (§3, §6).
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use platform_wire::{aligned_len, MessageReader, MessageWriter, SHA1_LEN};

use crate::error::{Error, Result};
use crate::registry::extension_type;

/// Fixed length of the compiled application token blob (§6). The original
/// client (`KAA_APPLICATION_TOKEN_LENGTH`) leaves this build-configured;
/// 20 bytes matches the digest-sized fields it sits alongside.
pub const APPLICATION_TOKEN_LEN: usize = 20;

/// Default request timeout, carried in every meta extension, mirroring the
/// original client's `KAA_SYNC_TIMEOUT` compiled constant.
pub const DEFAULT_SYNC_TIMEOUT_MS: u32 = 10_000;

const OPT_TIMEOUT: u32 = 0b0001;
const OPT_PUBKEY_HASH: u32 = 0b0010;
const OPT_PROFILE_HASH: u32 = 0b0100;
const OPT_APP_TOKEN: u32 = 0b1000;

/// Client-side content of the meta extension request (§3, §4.5).
pub struct MetaRequest {
    pub request_id: u32,
    pub timeout_ms: u32,
    pub endpoint_public_key_hash: [u8; SHA1_LEN],
    pub profile_hash: Option<[u8; SHA1_LEN]>,
    pub application_token: [u8; APPLICATION_TOKEN_LEN],
}

impl MetaRequest {
    /// Payload size in bytes, not including the extension's own 8-byte
    /// header. `profile_hash` is omitted until a profile has been reported
    /// at least once (§3 invariant).
    pub fn payload_size(&self) -> usize {
        let mut size = aligned_len(4) + aligned_len(4) + aligned_len(SHA1_LEN);
        if self.profile_hash.is_some() {
            size += aligned_len(SHA1_LEN);
        }
        size += aligned_len(APPLICATION_TOKEN_LEN);
        size
    }

    fn options(&self) -> u32 {
        let mut opts = OPT_TIMEOUT | OPT_PUBKEY_HASH | OPT_APP_TOKEN;
        if self.profile_hash.is_some() {
            opts |= OPT_PROFILE_HASH;
        }
        opts
    }

    pub fn write(&self, writer: &mut MessageWriter) -> Result<()> {
        let payload_len = self.payload_size();
        writer.extension_header_write(extension_type::META, self.options(), payload_len as u32)?;
        writer.write_aligned(&self.request_id.to_be_bytes())?;
        writer.write_aligned(&self.timeout_ms.to_be_bytes())?;
        writer.write_aligned(&self.endpoint_public_key_hash)?;
        if let Some(profile_hash) = self.profile_hash {
            writer.write_aligned(&profile_hash)?;
        }
        writer.write_aligned(&self.application_token)?;
        Ok(())
    }
}

/// Server-side echo carried by the meta extension in a response (§4.5):
/// just the request id the server is acknowledging.
pub struct MetaResponse {
    pub request_id: u32,
}

impl MetaResponse {
    pub fn read(reader: &mut MessageReader, length: u32) -> Result<MetaResponse> {
        if length < 4 {
            return Err(Error::BadFormat(platform_wire::Error::BadFormat));
        }
        let request_id = u32::from_be_bytes(
            reader
                .read_aligned(4)?
                .try_into()
                .map_err(|_| Error::BadFormat(platform_wire::Error::BadFormat))?,
        );
        Ok(MetaResponse { request_id })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn omits_profile_hash_before_registration() {
        let req = MetaRequest {
            request_id: 1,
            timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            endpoint_public_key_hash: [7u8; SHA1_LEN],
            profile_hash: None,
            application_token: [0u8; APPLICATION_TOKEN_LEN],
        };
        assert_eq!(
            req.payload_size(),
            4 + 4 + SHA1_LEN + APPLICATION_TOKEN_LEN
        );
        assert_eq!(req.options() & OPT_PROFILE_HASH, 0);
    }

    #[test]
    fn includes_profile_hash_once_reported() {
        let req = MetaRequest {
            request_id: 1,
            timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            endpoint_public_key_hash: [7u8; SHA1_LEN],
            profile_hash: Some([9u8; SHA1_LEN]),
            application_token: [0u8; APPLICATION_TOKEN_LEN],
        };
        assert_eq!(
            req.payload_size(),
            4 + 4 + SHA1_LEN + SHA1_LEN + APPLICATION_TOKEN_LEN
        );
        assert_ne!(req.options() & OPT_PROFILE_HASH, 0);
    }

    #[test]
    fn round_trips_request_id_in_response() {
        let mut buf = [0u8; 16];
        let mut w = MessageWriter::new(&mut buf);
        w.write_aligned(&42u32.to_be_bytes()).unwrap();
        let mut r = MessageReader::new(&buf[0..4]);
        let resp = MetaResponse::read(&mut r, 4).unwrap();
        assert_eq!(resp.request_id, 42);
    }
}
