// Platform Sync Engine — user attachment extension (§4.6).
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

use platform_wire::{aligned_len, MessageReader, MessageWriter};

use crate::error::{Error, Result};
use crate::registry::{extension_type, Extension, ExtensionServices};

const OPT_DETACH: u32 = 0b0001;
const RESPONSE_SUCCESS: u8 = 0;

/// Response-side options bit: trailing attach/detach notification records
/// follow the result byte (§6). Distinct frame from the request-side
/// `OPT_DETACH`, which happens to share bit 0.
const RESPONSE_HAS_NOTIFICATIONS: u32 = 0b0001;
const NOTIFY_ATTACH: u8 = 1;
const NOTIFY_DETACH: u8 = 2;

#[derive(Clone)]
enum AttachCommand {
    Attach { external_user_id: String, access_token: String },
    Detach { access_token: String },
}

fn payload_len(cmd: &AttachCommand) -> usize {
    let (id_len, token_len) = match cmd {
        AttachCommand::Attach { external_user_id, access_token } => {
            (external_user_id.len(), access_token.len())
        }
        AttachCommand::Detach { access_token } => (0, access_token.len()),
    };
    aligned_len(4) + aligned_len(id_len) + aligned_len(token_len)
}

/// Notified when an attach/detach command is acknowledged (§6).
pub trait UserAttachmentListener: Send {
    fn on_attached(&self, external_user_id: &str, access_token: &str);
    fn on_detached(&self, access_token: &str);
    fn on_response(&self, is_attached: bool);
}

/// Attaches the endpoint to an external user identity and reports the
/// result back through a host-supplied listener (§3, §4.6). Wire layout:
/// `{user-id-length:u8, reserved:u8, token-length:u16, user-id, token}`,
/// both variable fields individually padded to 4 bytes.
pub struct UserExtension {
    pending: Mutex<Option<AttachCommand>>,
    in_flight: Mutex<Option<AttachCommand>>,
    listener: Mutex<Option<Box<dyn UserAttachmentListener>>>,
}

impl Default for UserExtension {
    fn default() -> Self {
        UserExtension {
            pending: Mutex::new(None),
            in_flight: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }
}

impl UserExtension {
    pub fn new() -> Self {
        UserExtension::default()
    }

    pub fn set_listener(&self, listener: Box<dyn UserAttachmentListener>) {
        *self.listener.lock().expect("user mutex poisoned") = Some(listener);
    }

    pub fn attach(&self, external_user_id: String, access_token: String) {
        *self.pending.lock().expect("user mutex poisoned") =
            Some(AttachCommand::Attach { external_user_id, access_token });
    }

    pub fn detach(&self, access_token: String) {
        *self.pending.lock().expect("user mutex poisoned") =
            Some(AttachCommand::Detach { access_token });
    }
}

impl Extension for UserExtension {
    fn extension_type(&self) -> u8 {
        extension_type::USER
    }

    fn needs_sync(&self, _services: &ExtensionServices) -> bool {
        self.pending.lock().expect("user mutex poisoned").is_some()
    }

    fn request_size(&self, _services: &ExtensionServices) -> usize {
        self.pending
            .lock()
            .expect("user mutex poisoned")
            .as_ref()
            .map(payload_len)
            .unwrap_or(0)
    }

    fn serialize_request(
        &self,
        _services: &ExtensionServices,
        writer: &mut MessageWriter,
        _request_id: u32,
    ) -> Result<()> {
        let cmd = self
            .pending
            .lock()
            .expect("user mutex poisoned")
            .clone()
            .ok_or(Error::InvalidState("user extension has no pending command"))?;

        let (options, id_bytes, token_bytes): (u32, &[u8], &[u8]) = match &cmd {
            AttachCommand::Attach { external_user_id, access_token } => {
                (0, external_user_id.as_bytes(), access_token.as_bytes())
            }
            AttachCommand::Detach { access_token } => (OPT_DETACH, &[], access_token.as_bytes()),
        };

        writer.extension_header_write(extension_type::USER, options, payload_len(&cmd) as u32)?;
        writer.write_u8(id_bytes.len() as u8)?;
        writer.write_u8(0)?;
        writer.write_u16(token_bytes.len() as u16)?;
        writer.write_aligned(id_bytes)?;
        writer.write_aligned(token_bytes)?;

        *self.in_flight.lock().expect("user mutex poisoned") = Some(cmd);
        *self.pending.lock().expect("user mutex poisoned") = None;
        Ok(())
    }

    fn handle_server_sync(
        &self,
        services: &ExtensionServices,
        reader: &mut MessageReader,
        options: u32,
        length: u32,
        _request_id: u32,
    ) -> Result<()> {
        let cmd = self.in_flight.lock().expect("user mutex poisoned").take();
        let success = if length == 0 {
            true
        } else {
            reader.read_u8()? == RESPONSE_SUCCESS
        };

        if let Some(cmd) = cmd {
            if success {
                match &cmd {
                    AttachCommand::Attach { external_user_id, access_token } => {
                        services.status.set_attachment(Some(external_user_id.clone()));
                        if let Some(listener) = self.listener.lock().expect("user mutex poisoned").as_ref() {
                            listener.on_attached(external_user_id, access_token);
                        }
                    }
                    AttachCommand::Detach { access_token } => {
                        services.status.set_attachment(None);
                        if let Some(listener) = self.listener.lock().expect("user mutex poisoned").as_ref() {
                            listener.on_detached(access_token);
                        }
                    }
                }
            } else {
                tracing::warn!("server rejected user attachment command");
            }
            if let Some(listener) = self.listener.lock().expect("user mutex poisoned").as_ref() {
                listener.on_response(services.status.is_attached());
            }
        }

        // The same response can also carry attach/detach notifications for
        // this endpoint that are independent of the locally-issued command
        // above — e.g. another endpoint attaching the user this one just
        // detached from (§4.6, §8 scenario 3). These never re-fire
        // `on_response`, which is tied only to the local command's result.
        if length > 0 && options & RESPONSE_HAS_NOTIFICATIONS != 0 {
            while reader.remaining() > 0 {
                let kind = reader.read_u8()?;
                let id_len = reader.read_u8()? as usize;
                let _reserved = reader.read_u8()?;
                let token_len = reader.read_u16()? as usize;
                let id = read_field(reader, id_len)?;
                let token = read_field(reader, token_len)?;
                match kind {
                    NOTIFY_ATTACH => {
                        services.status.set_attachment(Some(id.clone()));
                        if let Some(listener) = self.listener.lock().expect("user mutex poisoned").as_ref() {
                            listener.on_attached(&id, &token);
                        }
                    }
                    NOTIFY_DETACH => {
                        services.status.set_attachment(None);
                        if let Some(listener) = self.listener.lock().expect("user mutex poisoned").as_ref() {
                            listener.on_detached(&token);
                        }
                    }
                    other => tracing::warn!(kind = other, "unknown user notification kind, skipping"),
                }
            }
        }
        Ok(())
    }
}

fn read_field(reader: &mut MessageReader, len: usize) -> Result<String> {
    let bytes = reader.read_aligned(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::BadFormat(platform_wire::Error::BadFormat))
}
