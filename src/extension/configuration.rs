// Platform Sync Engine — configuration extension (§4.6).
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::sync::Mutex;

use platform_wire::{aligned_len, MessageReader, MessageWriter, SHA1_LEN};

use crate::error::Result;
use crate::keys::sha1;
use crate::registry::{extension_type, Extension, ExtensionServices};

/// Notified when the server pushes a configuration body different from the
/// one currently held (§6).
pub trait ConfigurationListener: Send {
    fn on_configuration_updated(&self, body: &[u8]);
}

/// Holds the current configuration body and its hash, sending the hash
/// every sync so the server can reply with NO_DELTA or a new body (§3,
/// §4.6).
pub struct ConfigurationExtension {
    body: Mutex<Vec<u8>>,
    listener: Mutex<Option<Box<dyn ConfigurationListener>>>,
}

impl Default for ConfigurationExtension {
    fn default() -> Self {
        ConfigurationExtension {
            body: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        }
    }
}

impl ConfigurationExtension {
    pub fn new() -> Self {
        ConfigurationExtension::default()
    }

    pub fn set_listener(&self, listener: Box<dyn ConfigurationListener>) {
        *self.listener.lock().expect("configuration mutex poisoned") = Some(listener);
    }

    pub fn current(&self) -> Vec<u8> {
        self.body.lock().expect("configuration mutex poisoned").clone()
    }

    /// Seeds the locally-held configuration, e.g. from a value the host
    /// persisted itself on last shutdown. Does not fire the listener.
    pub fn seed(&self, body: Vec<u8>) {
        *self.body.lock().expect("configuration mutex poisoned") = body;
    }

    /// Host-initiated configuration push (§6 `update_configuration`). Unlike
    /// `seed`, this fires the listener so the host's own call site and any
    /// other registered listener observe the same update uniformly.
    pub fn update_configuration(&self, body: Vec<u8>) {
        *self.body.lock().expect("configuration mutex poisoned") = body.clone();
        if let Some(listener) = self.listener.lock().expect("configuration mutex poisoned").as_ref() {
            listener.on_configuration_updated(&body);
        }
    }
}

impl Extension for ConfigurationExtension {
    fn extension_type(&self) -> u8 {
        extension_type::CONFIGURATION
    }

    /// Every sync reports the current hash; this is not local-dirty
    /// state in the §4.6 `Idle/Dirty` sense, so it is always sent once the
    /// endpoint has been configured at least once.
    fn needs_sync(&self, _services: &ExtensionServices) -> bool {
        !self.body.lock().expect("configuration mutex poisoned").is_empty()
    }

    fn request_size(&self, _services: &ExtensionServices) -> usize {
        aligned_len(SHA1_LEN)
    }

    fn serialize_request(
        &self,
        _services: &ExtensionServices,
        writer: &mut MessageWriter,
        _request_id: u32,
    ) -> Result<()> {
        let hash = sha1(&self.body.lock().expect("configuration mutex poisoned"));
        writer.extension_header_write(extension_type::CONFIGURATION, 0, SHA1_LEN as u32)?;
        writer.write_aligned(&hash)?;
        Ok(())
    }

    fn handle_server_sync(
        &self,
        _services: &ExtensionServices,
        reader: &mut MessageReader,
        _options: u32,
        length: u32,
        _request_id: u32,
    ) -> Result<()> {
        // NO_DELTA: empty payload, the held body is already current.
        if length == 0 {
            return Ok(());
        }
        let body = reader.read_aligned(length as usize)?.to_vec();
        *self.body.lock().expect("configuration mutex poisoned") = body.clone();
        if let Some(listener) = self.listener.lock().expect("configuration mutex poisoned").as_ref() {
            listener.on_configuration_updated(&body);
        }
        Ok(())
    }
}
