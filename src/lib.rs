// Platform Sync Engine
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Client-side sync engine for an IoT endpoint SDK: a binary framing
//! protocol between an endpoint and its platform, built around a fixed set
//! of extensions (profile, user attachment, events, notifications, logging,
//! configuration, bootstrap) multiplexed over one or more transport
//! channels. See `Context` for the entry point.

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    dead_code
)]

#[macro_use]
extern crate amplify_derive;

mod channel_manager;
mod context;
mod engine;
mod error;
mod extension;
mod failover;
mod keys;
mod meta;
mod registry;
mod status;

pub use channel_manager::{AccessPoint, Channel, ChannelManager, SyncRequestBuilder};
pub use context::{Context, ContextConfig};
pub use error::{Error, Result};
pub use extension::bootstrap::BootstrapExtension;
pub use extension::profile::ProfileExtension;
pub use extension::user::{UserAttachmentListener, UserExtension};
pub use failover::{BootstrapPool, DefaultFailoverStrategy, FailoverDecision, FailoverStrategy, ServerKind};
pub use keys::{sha1, KeyProvider, StaticKeyProvider};
pub use meta::{APPLICATION_TOKEN_LEN, DEFAULT_SYNC_TIMEOUT_MS};
pub use registry::{extension_type, Extension as ExtensionTrait, ExtensionServices, Registry};
pub use status::{Status, StatusPersistence, StdFsPersistence, SubscriptionKind, TopicState};

#[cfg(feature = "events")]
pub use extension::events::{Event, EventExtension, EventFamilyHandler, EventListenerResultHandler};
#[cfg(feature = "notifications")]
pub use extension::notifications::{NotificationExtension, NotificationListener, TopicListener};
#[cfg(feature = "logging")]
pub use extension::logging::{
    AlwaysUpload, InMemoryLogStorage, LogStorage, LoggingExtension, UploadDecision, UploadOutcome,
    UploadResultListener,
};
#[cfg(feature = "configuration")]
pub use extension::configuration::{ConfigurationExtension, ConfigurationListener};
