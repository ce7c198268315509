// Platform Sync Engine — profile extension (§4.6).
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

use platform_wire::{MessageReader, MessageWriter, SHA1_LEN};

use crate::error::{Error, Result};
use crate::keys::sha1;
use crate::registry::{extension_type, Extension, ExtensionServices};

const RESPONSE_SUCCESS: u8 = 0;

/// Holds the endpoint's latest profile body and reports it whenever its
/// hash diverges from the last one the server acknowledged, or the
/// endpoint has never completed registration (§3, §4.6).
#[derive(Default)]
pub struct ProfileExtension {
    body: Mutex<Option<Vec<u8>>>,
}

impl ProfileExtension {
    pub fn new() -> Self {
        ProfileExtension::default()
    }

    /// Sets the profile body to report at the next sync. Called by the
    /// host through `Context::set_profile`.
    pub fn set_profile(&self, body: Vec<u8>) {
        *self.body.lock().expect("profile mutex poisoned") = Some(body);
    }

    fn current_hash(&self) -> Option<[u8; SHA1_LEN]> {
        self.body
            .lock()
            .expect("profile mutex poisoned")
            .as_ref()
            .map(|body| sha1(body))
    }
}

impl Extension for ProfileExtension {
    fn extension_type(&self) -> u8 {
        extension_type::PROFILE
    }

    fn needs_sync(&self, services: &ExtensionServices) -> bool {
        match self.current_hash() {
            Some(hash) => {
                Some(hash) != services.status.profile_hash() || !services.status.is_registered()
            }
            None => false,
        }
    }

    fn request_size(&self, _services: &ExtensionServices) -> usize {
        self.body
            .lock()
            .expect("profile mutex poisoned")
            .as_ref()
            .map(|body| body.len())
            .unwrap_or(0)
    }

    fn serialize_request(
        &self,
        _services: &ExtensionServices,
        writer: &mut MessageWriter,
        _request_id: u32,
    ) -> Result<()> {
        let guard = self.body.lock().expect("profile mutex poisoned");
        let body = guard
            .as_ref()
            .ok_or(Error::InvalidState("profile extension has no profile to send"))?;
        writer.extension_header_write(extension_type::PROFILE, 0, body.len() as u32)?;
        writer.write_aligned(body)?;
        Ok(())
    }

    fn handle_server_sync(
        &self,
        services: &ExtensionServices,
        reader: &mut MessageReader,
        _options: u32,
        length: u32,
        _request_id: u32,
    ) -> Result<()> {
        // An empty payload is a bare acknowledgement; anything else carries
        // an explicit result byte.
        let success = if length == 0 {
            true
        } else {
            reader.read_u8()? == RESPONSE_SUCCESS
        };

        if success {
            if let Some(hash) = self.current_hash() {
                services.status.set_profile_hash(hash);
            }
            services.status.set_registered(true);
        } else {
            tracing::warn!("server rejected profile registration");
        }
        Ok(())
    }
}
