// Platform Sync Engine — transport channel routing.
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
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// A directory-provided address of an operations or bootstrap server.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AccessPoint {
    pub id: u32,
    pub host: String,
    pub port: u16,
}

/// Builds a request frame covering exactly `types`; handed to a channel so
/// it can produce bytes to send whenever it is ready, decoupling the
/// manager's "please sync" signal from the actual I/O (§4.3).
pub type SyncRequestBuilder = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Transport channel interface the core consumes (§6). Implementations live
/// outside this crate (HTTP, TCP, ...); this crate only defines the
/// capability set and routes to it.
pub trait Channel: Send {
    /// Extension types this channel is willing to carry.
    fn supported_types(&self) -> &[u8];

    /// Commands the channel to begin a sync that must include `types` in
    /// its next outbound request.
    fn sync_handler(&mut self, types: &[u8]) -> Result<()>;

    /// Supplies (or replaces) the closure the channel calls to obtain
    /// request bytes for a given set of types.
    fn set_sync_request_builder(&mut self, builder: SyncRequestBuilder);

    /// Points the channel at a (possibly new) access point.
    fn set_server(&mut self, access_point: AccessPoint);

    /// Forwards an updated access-point list (bootstrap response, §4.6).
    fn on_server_list_updated(&mut self, _list: &[AccessPoint]) {}

    /// Releases resources tied to this channel. Idempotent.
    fn destroy(&mut self);
}

struct Binding {
    channel: Arc<Mutex<dyn Channel>>,
}

/// Maps extension-type to the transport channel currently bound for that
/// type (§4.3).
#[derive(Default)]
pub struct ChannelManager {
    bindings: Mutex<BTreeMap<u8, Binding>>,
    /// Every channel ever added, for `on_server_list_updated` fan-out and so
    /// a channel serving several types isn't dropped while any binding
    /// still points at it.
    channels: Mutex<Vec<Arc<Mutex<dyn Channel>>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        ChannelManager::default()
    }

    /// Registers a channel for all the types it declares support for. If a
    /// type already has a bound channel, the newer one wins and the
    /// displaced channel is notified via `destroy` is *not* called — only
    /// the binding is dropped, since the old channel may still serve other
    /// types (§4.3: "a channel must not be assumed exclusive").
    pub fn add_channel(&self, channel: Arc<Mutex<dyn Channel>>) {
        let types: Vec<u8> = channel.lock().expect("channel mutex poisoned").supported_types().to_vec();
        let mut bindings = self.bindings.lock().expect("bindings mutex poisoned");
        for ty in types {
            bindings.insert(
                ty,
                Binding {
                    channel: channel.clone(),
                },
            );
        }
        self.channels.lock().expect("channels mutex poisoned").push(channel);
    }

    /// Unbinds every type served by `channel` and calls its teardown hook.
    /// Idempotent.
    pub fn remove_channel(&self, channel: &Arc<Mutex<dyn Channel>>) {
        {
            let mut bindings = self.bindings.lock().expect("bindings mutex poisoned");
            bindings.retain(|_, binding| !Arc::ptr_eq(&binding.channel, channel));
        }
        let mut channels = self.channels.lock().expect("channels mutex poisoned");
        if let Some(pos) = channels.iter().position(|c| Arc::ptr_eq(c, channel)) {
            channels.remove(pos);
            channel.lock().expect("channel mutex poisoned").destroy();
        }
    }

    /// Asks the channel bound for `extension_type` to initiate a sync that
    /// must include it.
    pub fn sync(&self, extension_type: u8) -> Result<()> {
        let bindings = self.bindings.lock().expect("bindings mutex poisoned");
        let binding = bindings.get(&extension_type).ok_or(Error::NotFound)?;
        binding
            .channel
            .lock()
            .expect("channel mutex poisoned")
            .sync_handler(&[extension_type])
    }

    pub fn get_channel(&self, extension_type: u8) -> Result<Arc<Mutex<dyn Channel>>> {
        self.bindings
            .lock()
            .expect("bindings mutex poisoned")
            .get(&extension_type)
            .map(|b| b.channel.clone())
            .ok_or(Error::NotFound)
    }

    /// Forwards a new access-point list to every registered channel.
    pub fn on_server_list_updated(&self, list: &[AccessPoint]) {
        for channel in self.channels.lock().expect("channels mutex poisoned").iter() {
            channel
                .lock()
                .expect("channel mutex poisoned")
                .on_server_list_updated(list);
        }
    }

    /// Destroys every registered channel and drops all bindings (§4.7
    /// shutdown, step 2 of teardown).
    pub fn clear(&self) {
        self.bindings.lock().expect("bindings mutex poisoned").clear();
        let mut channels = self.channels.lock().expect("channels mutex poisoned");
        for channel in channels.drain(..) {
            channel.lock().expect("channel mutex poisoned").destroy();
        }
    }
}
