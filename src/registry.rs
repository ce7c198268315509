// Platform Sync Engine — extension contract and registry.
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::collections::BTreeMap;
use std::sync::Arc;

use platform_wire::{MessageReader, MessageWriter};

use crate::channel_manager::ChannelManager;
use crate::error::Result;
use crate::status::Status;

/// Extension-type codes (§3, §6). The table is reserved in full regardless
/// of which optional features are compiled in (§9 design note), so a peer
/// that serves a disabled extension is still recognizable, just never
/// enabled locally.
pub mod extension_type {
    pub const META: u8 = 1;
    pub const PROFILE: u8 = 2;
    pub const USER: u8 = 3;
    pub const EVENT: u8 = 4;
    pub const NOTIFICATION: u8 = 5;
    pub const LOGGING: u8 = 6;
    pub const CONFIGURATION: u8 = 7;
    pub const BOOTSTRAP: u8 = 8;
}

/// The services an extension may reach during a call, handed in rather than
/// stored, so extensions never hold an owning or even a raw back-reference
/// to `Context` (§3 ownership, §9 design note on self-referential links).
pub struct ExtensionServices<'a> {
    pub status: &'a Status,
    pub channels: &'a ChannelManager,
}

/// Shared contract every extension implements (§4.6). All state an
/// extension holds is behind its own interior mutability (a `Mutex` or
/// atomic), so every method takes `&self`: the Context keeps one `Arc` per
/// extension, cloning it both into the `Registry` (for the protocol
/// engine's dispatch) and into its own typed field (for the host API),
/// with no downcasting and no second copy of the state.
pub trait Extension: Send + Sync + 'static {
    /// The extension-type code this implementation serves.
    fn extension_type(&self) -> u8;

    /// Called once at `Context::init`, in registration order.
    fn init(&self, services: &ExtensionServices) -> Result<()> {
        let _ = services;
        Ok(())
    }

    /// Called once at `Context::deinit`, in reverse registration order.
    fn deinit(&self, services: &ExtensionServices) {
        let _ = services;
    }

    /// Whether this extension has pending local state that must be synced.
    fn needs_sync(&self, services: &ExtensionServices) -> bool;

    /// Size in bytes of this extension's serialized request payload,
    /// excluding its 8-byte extension header. Zero extensions are skipped
    /// entirely by the protocol engine (§4.5 step 1).
    fn request_size(&self, services: &ExtensionServices) -> usize;

    /// Serializes the extension's request payload (not including its own
    /// extension header, which the engine writes).
    fn serialize_request(
        &self,
        services: &ExtensionServices,
        writer: &mut MessageWriter,
        request_id: u32,
    ) -> Result<()>;

    /// Handles this extension's slice of a server response.
    fn handle_server_sync(
        &self,
        services: &ExtensionServices,
        reader: &mut MessageReader,
        options: u32,
        length: u32,
        request_id: u32,
    ) -> Result<()>;

    /// Called when the request carrying this extension's last serialized
    /// payload was abandoned or timed out before a response arrived (§4.6
    /// Dirty/Syncing/Acked cycle). Extensions that stage state out of
    /// `pending` in `serialize_request` must return it here rather than
    /// let it be silently dropped. The default is a no-op, correct for
    /// extensions that never move state out of `pending` until it is
    /// acknowledged.
    fn on_sync_failed(&self, services: &ExtensionServices) {
        let _ = services;
    }
}

/// Table of extension implementations, preserving the fixed creation order
/// used for both request-side iteration (§4.5) and teardown (§4.7). A
/// side index gives O(log n) lookup by extension-type.
#[derive(Default)]
pub struct Registry {
    slots: Vec<Arc<dyn Extension>>,
    index: BTreeMap<u8, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registers an extension. If the type code is already registered, the
    /// previous implementation is replaced in place (its creation-order
    /// slot is kept).
    pub fn register(&mut self, extension: Arc<dyn Extension>) {
        let ty = extension.extension_type();
        if let Some(&slot) = self.index.get(&ty) {
            self.slots[slot] = extension;
        } else {
            self.index.insert(ty, self.slots.len());
            self.slots.push(extension);
        }
    }

    pub fn get(&self, extension_type: u8) -> Option<Arc<dyn Extension>> {
        self.index.get(&extension_type).map(|&slot| self.slots[slot].clone())
    }

    /// Iterates extensions in their creation order (request-side order,
    /// §4.5).
    pub fn iter_in_order(&self) -> impl Iterator<Item = Arc<dyn Extension>> + '_ {
        self.slots.iter().cloned()
    }

    /// Tears down extensions in reverse creation order (§4.7).
    pub fn deinit_all(&self, services: &ExtensionServices) {
        for ext in self.slots.iter().rev() {
            ext.deinit(services);
        }
    }

    /// Notifies every extension that the in-flight request failed (§4.6),
    /// so whichever ones staged state out of `pending` can return it.
    pub fn notify_sync_failed(&self, services: &ExtensionServices) {
        for ext in self.slots.iter() {
            ext.on_sync_failed(services);
        }
    }
}
