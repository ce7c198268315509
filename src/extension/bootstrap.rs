// Platform Sync Engine — bootstrap extension (§4.4, §4.6).
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::sync::atomic::{AtomicBool, Ordering};

use platform_wire::{aligned_len, MessageReader, MessageWriter};

use crate::channel_manager::AccessPoint;
use crate::error::Result;
use crate::meta::APPLICATION_TOKEN_LEN;
use crate::registry::{extension_type, Extension, ExtensionServices};

/// Asks the bootstrap/directory server for an updated operations-server
/// list, keyed by the compiled application token, and forwards the result
/// to the `ChannelManager` (§4.4).
pub struct BootstrapExtension {
    application_token: [u8; APPLICATION_TOKEN_LEN],
    requested: AtomicBool,
}

impl BootstrapExtension {
    pub fn new(application_token: [u8; APPLICATION_TOKEN_LEN]) -> Self {
        BootstrapExtension {
            application_token,
            requested: AtomicBool::new(true),
        }
    }

    /// Flags a bootstrap request for the next sync, e.g. after the
    /// failover strategy returns `UseNextBootstrap` (§4.4).
    pub fn request_bootstrap(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

impl Extension for BootstrapExtension {
    fn extension_type(&self) -> u8 {
        extension_type::BOOTSTRAP
    }

    fn needs_sync(&self, _services: &ExtensionServices) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn request_size(&self, _services: &ExtensionServices) -> usize {
        aligned_len(APPLICATION_TOKEN_LEN)
    }

    fn serialize_request(
        &self,
        _services: &ExtensionServices,
        writer: &mut MessageWriter,
        _request_id: u32,
    ) -> Result<()> {
        writer.extension_header_write(
            extension_type::BOOTSTRAP,
            0,
            APPLICATION_TOKEN_LEN as u32,
        )?;
        writer.write_aligned(&self.application_token)?;
        self.requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn handle_server_sync(
        &self,
        services: &ExtensionServices,
        reader: &mut MessageReader,
        _options: u32,
        _length: u32,
        _request_id: u32,
    ) -> Result<()> {
        let count = reader.read_u32()?;
        let mut servers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = reader.read_u32()?;
            let port = reader.read_u16()?;
            let _reserved = reader.read_u16()?;
            let host_len = reader.read_u16()? as usize;
            let host_bytes = reader.read_aligned(host_len)?;
            let host = String::from_utf8(host_bytes.to_vec())
                .map_err(|_| crate::error::Error::BadFormat(platform_wire::Error::BadFormat))?;
            servers.push(AccessPoint { id, host, port });
        }
        services.channels.on_server_list_updated(&servers);
        Ok(())
    }
}
