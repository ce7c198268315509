// Platform Sync Engine — the platform protocol engine (§4.5).
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::collections::HashSet;
use std::sync::Mutex;

use platform_wire::{MessageReader, MessageWriter, FRAME_HEADER_SIZE};

use crate::error::{Error, Result};
use crate::meta::{MetaRequest, MetaResponse};
use crate::registry::{extension_type, ExtensionServices, Registry};


/// Compiled protocol identity. Mismatches are fatal for the session (§6,
/// §7).
pub const PROTOCOL_ID: u32 = 0x4B41_4130; // "KAA0"-shaped, arbitrary but stable
pub const PROTOCOL_VERSION: u16 = 1;

/// Builds outbound sync frames from enabled extensions and dispatches
/// inbound frames back to them (§4.5).
pub struct ProtocolEngine {
    request_id: Mutex<u32>,
    abandoned: Mutex<HashSet<u32>>,
    /// Once a `BadProtocolId`/`BadProtocolVersion` is seen, the session
    /// refuses further syncs until reconfigured (§7).
    poisoned: Mutex<bool>,
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        ProtocolEngine {
            request_id: Mutex::new(1),
            abandoned: Mutex::new(HashSet::new()),
            poisoned: Mutex::new(false),
        }
    }
}

impl ProtocolEngine {
    pub fn new() -> Self {
        ProtocolEngine::default()
    }

    pub fn is_poisoned(&self) -> bool {
        *self.poisoned.lock().expect("engine mutex poisoned")
    }

    /// Marks a request id as abandoned (transport torn down, or timed out
    /// per the failover strategy). A later response echoing it is dropped
    /// rather than dispatched (§5), and every extension is told its
    /// in-flight snapshot, if any, failed so it can return it to pending
    /// (§4.6).
    pub fn abandon_request(&self, request_id: u32, registry: &Registry, services: &ExtensionServices) {
        self.abandoned.lock().expect("engine mutex poisoned").insert(request_id);
        registry.notify_sync_failed(services);
    }

    fn current_request_id(&self) -> u32 {
        *self.request_id.lock().expect("engine mutex poisoned")
    }

    /// Builds a request frame covering every extension in `registry` whose
    /// `needs_sync` is true, plus the mandatory meta extension (§4.5 step
    /// 1-3). The request id advances only once serialization fully
    /// succeeds.
    pub fn serialize_client_sync(
        &self,
        registry: &Registry,
        services: &ExtensionServices,
        endpoint_public_key_hash: [u8; platform_wire::SHA1_LEN],
        application_token: [u8; crate::meta::APPLICATION_TOKEN_LEN],
        timeout_ms: u32,
    ) -> Result<Vec<u8>> {
        if self.is_poisoned() {
            return Err(Error::Unrecoverable);
        }

        let request_id = self.current_request_id();
        let meta = MetaRequest {
            request_id,
            timeout_ms,
            endpoint_public_key_hash,
            profile_hash: services.status.profile_hash(),
            application_token,
        };

        let enabled: Vec<u8> = registry
            .iter_in_order()
            .filter(|ext| ext.needs_sync(services))
            .map(|ext| ext.extension_type())
            .collect();

        let mut total = FRAME_HEADER_SIZE
            + platform_wire::extension_record_len(meta.payload_size());
        for ext in registry.iter_in_order() {
            if enabled.contains(&ext.extension_type()) {
                total += platform_wire::extension_record_len(ext.request_size(services));
            }
        }

        let mut buf = vec![0u8; total];
        {
            let mut writer = MessageWriter::new(&mut buf);
            writer.header_write(PROTOCOL_ID, PROTOCOL_VERSION)?;
            meta.write(&mut writer)?;
            for ext in registry.iter_in_order() {
                if !enabled.contains(&ext.extension_type()) {
                    continue;
                }
                // Each extension writes its own extension header and
                // payload; the writer tracks the running extension count.
                ext.serialize_request(services, &mut writer, request_id)?;
            }

            writer.patch_extension_count()?;
        }

        *self.request_id.lock().expect("engine mutex poisoned") = request_id.wrapping_add(1);
        Ok(buf)
    }

    /// Parses a response frame and dispatches each extension's slice to
    /// its handler, in wire order (§4.5 step 2). All-or-nothing: any
    /// handler error aborts processing and `status.save()` is *not*
    /// called (§4.5 step 3, §9 open question).
    pub fn process_server_sync(
        &self,
        registry: &Registry,
        services: &ExtensionServices,
        buffer: &[u8],
    ) -> Result<()> {
        let mut reader = MessageReader::new(buffer);
        let header = match reader.read_header(PROTOCOL_ID, PROTOCOL_VERSION) {
            Ok(h) => h,
            Err(e @ platform_wire::Error::BadProtocolId { .. })
            | Err(e @ platform_wire::Error::BadProtocolVersion { .. }) => {
                *self.poisoned.lock().expect("engine mutex poisoned") = true;
                return Err(Error::BadFormat(e));
            }
            Err(e) => return Err(Error::BadFormat(e)),
        };

        let mut request_id = None;
        let mut seen = 0u16;

        while reader.buffer_has_at_least(platform_wire::EXTENSION_HEADER_SIZE) && seen < header.extension_count {
            let ext_header = reader.read_extension_header()?;
            let payload = reader.read_aligned(ext_header.length as usize)?;
            seen += 1;

            if ext_header.extension_type == extension_type::META {
                let mut meta_reader = MessageReader::new(payload);
                let meta = MetaResponse::read(&mut meta_reader, ext_header.length)?;
                request_id = Some(meta.request_id);
                continue;
            }

            if let Some(id) = request_id {
                if self.abandoned.lock().expect("engine mutex poisoned").contains(&id) {
                    tracing::debug!(request_id = id, "dropping response for abandoned request");
                    return Ok(());
                }
            }

            match registry.get(ext_header.extension_type) {
                Some(ext) => {
                    let mut payload_reader = MessageReader::new(payload);
                    ext.handle_server_sync(
                        services,
                        &mut payload_reader,
                        ext_header.options,
                        ext_header.length,
                        request_id.unwrap_or(0),
                    )?;
                }
                None => {
                    tracing::warn!(
                        extension_type = ext_header.extension_type,
                        "unknown extension type in server sync, skipping"
                    );
                }
            }
        }

        services.status.save()
    }
}
