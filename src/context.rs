// Platform Sync Engine — the Context: host-facing entry point (§4.7, §6).
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::sync::{Arc, Mutex, Weak};

use platform_wire::SHA1_LEN;

use crate::channel_manager::{Channel, ChannelManager};
use crate::engine::ProtocolEngine;
use crate::error::{Error, Result};
use crate::extension::bootstrap::BootstrapExtension;
use crate::extension::profile::ProfileExtension;
use crate::extension::user::{UserAttachmentListener, UserExtension};
use crate::failover::{BootstrapPool, DefaultFailoverStrategy, FailoverDecision, FailoverStrategy, ServerKind};
use crate::keys::KeyProvider;
use crate::meta::APPLICATION_TOKEN_LEN;
use crate::registry::{extension_type, ExtensionServices, Registry};
use crate::status::{Status, StatusPersistence};

#[cfg(feature = "events")]
use crate::extension::events::{EventExtension, EventFamilyHandler, EventListenerResultHandler};
#[cfg(feature = "notifications")]
use crate::extension::notifications::{NotificationExtension, NotificationListener, TopicListener};
#[cfg(feature = "logging")]
use crate::extension::logging::{LogStorage, LoggingExtension, UploadDecision, UploadResultListener};
#[cfg(feature = "configuration")]
use crate::extension::configuration::{ConfigurationExtension, ConfigurationListener};
#[cfg(feature = "notifications")]
use crate::status::SubscriptionKind;

/// Everything `Context::init` needs that cannot be derived from state
/// already on disk (§4.7 steps 1-4).
pub struct ContextConfig {
    pub status_path: String,
    pub status_persistence: Box<dyn StatusPersistence>,
    pub key_provider: Box<dyn KeyProvider>,
    pub application_token: [u8; APPLICATION_TOKEN_LEN],
    pub bootstrap_servers: Vec<crate::channel_manager::AccessPoint>,
    pub sync_timeout_ms: u32,
}

/// Owns every long-lived collaborator of a running endpoint and is the
/// sole surface hosts call into (§6). Extensions are reachable two ways
/// from the same `Arc`: through `registry` for the protocol engine's
/// dispatch, and through a typed field here for the host API — see the
/// `Extension` trait's doc comment for why that's safe.
pub struct Context {
    status: Status,
    channels: ChannelManager,
    engine: ProtocolEngine,
    registry: Registry,
    failover: Mutex<Box<dyn FailoverStrategy>>,
    bootstrap_pool: BootstrapPool,
    application_token: [u8; APPLICATION_TOKEN_LEN],
    sync_timeout_ms: u32,
    access_token: Mutex<Option<String>>,
    /// Back-reference handed to channels so they can pull sync requests
    /// without keeping the context alive on their own (§9 design note).
    self_ref: Weak<Context>,

    profile: Arc<ProfileExtension>,
    user: Arc<UserExtension>,
    #[cfg(feature = "events")]
    events: Arc<EventExtension>,
    #[cfg(feature = "notifications")]
    notifications: Arc<NotificationExtension>,
    #[cfg(feature = "logging")]
    logging: Arc<LoggingExtension>,
    #[cfg(feature = "configuration")]
    configuration: Arc<ConfigurationExtension>,
    bootstrap: Arc<BootstrapExtension>,
}

impl Context {
    /// §4.7 steps 1-5: create the logger, load status, compute the
    /// endpoint's public-key hash once, create the channel manager /
    /// protocol engine / failover strategy, and instantiate + register
    /// every extension in the fixed order the wire format reserves for it.
    pub fn init(config: ContextConfig) -> Result<Arc<Context>> {
        tracing::info!("initializing platform sync context");

        let status = Status::load(config.status_path, config.status_persistence)?;
        if status.endpoint_public_key_hash().is_none() {
            let key = config.key_provider.endpoint_public_key();
            let hash = config.key_provider.compute_sha1(&key);
            status.set_endpoint_public_key_hash(hash)?;
        }

        let channels = ChannelManager::new();
        let engine = ProtocolEngine::new();
        let failover: Box<dyn FailoverStrategy> = Box::new(DefaultFailoverStrategy::default());
        let bootstrap_pool = BootstrapPool::new(config.bootstrap_servers);

        let mut registry = Registry::new();

        let profile = Arc::new(ProfileExtension::new());
        registry.register(profile.clone());

        let user = Arc::new(UserExtension::new());
        registry.register(user.clone());

        #[cfg(feature = "events")]
        let events = {
            let ext = Arc::new(EventExtension::new());
            registry.register(ext.clone());
            ext
        };

        #[cfg(feature = "notifications")]
        let notifications = {
            let ext = Arc::new(NotificationExtension::new());
            registry.register(ext.clone());
            ext
        };

        #[cfg(feature = "logging")]
        let logging = {
            let ext = Arc::new(LoggingExtension::new());
            registry.register(ext.clone());
            ext
        };

        #[cfg(feature = "configuration")]
        let configuration = {
            let ext = Arc::new(ConfigurationExtension::new());
            registry.register(ext.clone());
            ext
        };

        // Registered last: its `needs_sync` is already true from
        // construction, so the very first sync carries a bootstrap
        // request regardless of what else is pending (§4.4, §4.7 step 6).
        let bootstrap = Arc::new(BootstrapExtension::new(config.application_token));
        registry.register(bootstrap.clone());

        Ok(Arc::new_cyclic(|self_ref| Context {
            status,
            channels,
            engine,
            registry,
            failover: Mutex::new(failover),
            bootstrap_pool,
            application_token: config.application_token,
            sync_timeout_ms: config.sync_timeout_ms,
            access_token: Mutex::new(None),
            self_ref: self_ref.clone(),
            profile,
            user,
            #[cfg(feature = "events")]
            events,
            #[cfg(feature = "notifications")]
            notifications,
            #[cfg(feature = "logging")]
            logging,
            #[cfg(feature = "configuration")]
            configuration,
            bootstrap,
        }))
    }

    fn services(&self) -> ExtensionServices {
        ExtensionServices { status: &self.status, channels: &self.channels }
    }

    /// §4.7 step 6: trigger an immediate bootstrap sync. Fails with
    /// `NotFound` if no channel has been bound to the bootstrap extension
    /// type yet — the host is expected to call `add_channel` first.
    pub fn start(&self) -> Result<()> {
        self.channels.sync(extension_type::BOOTSTRAP)
    }

    /// Halts outbound syncs by releasing every transport channel, without
    /// discarding in-memory or persisted state. Safe to call before a
    /// reconfiguration that will `add_channel` again.
    pub fn stop(&self) {
        self.channels.clear();
    }

    /// §4.7 shutdown: tears down extensions in reverse registration order,
    /// releases channels, saves status one final time, then logs. Leaves
    /// the `Context` unusable for further syncs.
    pub fn deinit(&self) -> Result<()> {
        self.registry.deinit_all(&self.services());
        self.channels.clear();
        self.status.save()?;
        tracing::info!("platform sync context deinitialized");
        Ok(())
    }

    /// Registers a transport channel and wires it to pull sync requests
    /// from this context through a weak back-reference, so the channel
    /// never keeps the context alive on its own (§9 design note).
    pub fn add_channel(&self, channel: Arc<Mutex<dyn Channel>>) {
        let weak = self.self_ref.clone();
        let builder: crate::channel_manager::SyncRequestBuilder = Arc::new(move |_types: &[u8]| {
            let ctx = weak.upgrade().ok_or(Error::Unrecoverable)?;
            ctx.build_sync_request()
        });
        channel.lock().expect("channel mutex poisoned").set_sync_request_builder(builder);
        self.channels.add_channel(channel);
    }

    /// Serializes a request frame covering every extension with pending
    /// state, for a channel's `SyncRequestBuilder` to send.
    pub fn build_sync_request(&self) -> Result<Vec<u8>> {
        let hash = self.status.endpoint_public_key_hash().unwrap_or([0u8; SHA1_LEN]);
        self.engine.serialize_client_sync(
            &self.registry,
            &self.services(),
            hash,
            self.application_token,
            self.sync_timeout_ms,
        )
    }

    /// Dispatches a response frame to its extensions and persists status.
    /// Called by a channel once a server reply arrives.
    pub fn handle_sync_response(&self, buffer: &[u8]) -> Result<()> {
        self.engine.process_server_sync(&self.registry, &self.services(), buffer)
    }

    /// Tells the context that the request identified by `request_id` will
    /// never get a response (the transport was torn down, or the host's
    /// own timeout elapsed). A later response echoing this id is dropped,
    /// and every extension with state staged for that request returns it
    /// to pending instead of losing it (§4.6, §5).
    pub fn abandon_sync(&self, request_id: u32) {
        self.engine.abandon_request(request_id, &self.registry, &self.services());
    }

    /// Reports a transport-level failure to the failover strategy and
    /// returns whether the session should keep running. A bootstrap
    /// fallback re-requests the server list on its next sync (§4.4).
    pub fn process_failover(&self, kind: ServerKind, access_point_id: u32) -> bool {
        let decision = self.failover.lock().expect("failover mutex poisoned").on_failure(kind, access_point_id);
        match decision {
            FailoverDecision::UseNextBootstrap => {
                self.bootstrap.request_bootstrap();
                true
            }
            FailoverDecision::StopApp => false,
            FailoverDecision::Retry(_) | FailoverDecision::UseNext => true,
        }
    }

    pub fn process_success(&self, kind: ServerKind, access_point_id: u32) {
        self.failover.lock().expect("failover mutex poisoned").on_success(kind, access_point_id);
    }

    pub fn bootstrap_pool(&self) -> &BootstrapPool {
        &self.bootstrap_pool
    }

    // -- Profile & identity (§6) --------------------------------------

    pub fn set_profile(&self, body: Vec<u8>) {
        self.profile.set_profile(body);
    }

    pub fn set_access_token(&self, token: String) {
        *self.access_token.lock().expect("access token mutex poisoned") = Some(token);
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token.lock().expect("access token mutex poisoned").clone()
    }

    pub fn get_endpoint_id(&self) -> Option<[u8; SHA1_LEN]> {
        self.status.endpoint_public_key_hash()
    }

    // -- User attachment (§6) -------------------------------------------

    pub fn attach_to_user(&self, external_user_id: String, access_token: String) {
        self.user.attach(external_user_id, access_token);
    }

    pub fn detach_user(&self, access_token: String) {
        self.user.detach(access_token);
    }

    pub fn set_attachment_listener(&self, listener: Box<dyn UserAttachmentListener>) {
        self.user.set_listener(listener);
    }

    // -- Events (§6, feature = "events") ---------------------------------

    #[cfg(feature = "events")]
    pub fn produce_event(&self, fqn: String, data: Vec<u8>) {
        self.events.produce_event(fqn, data);
    }

    #[cfg(feature = "events")]
    pub fn begin_trx(&self) -> u32 {
        self.events.begin_trx()
    }

    #[cfg(feature = "events")]
    pub fn produce_event_in_trx(&self, trx_id: u32, fqn: String, data: Vec<u8>) -> Result<()> {
        self.events.produce(trx_id, fqn, data)
    }

    #[cfg(feature = "events")]
    pub fn commit(&self, trx_id: u32) -> Result<()> {
        self.events.commit(trx_id)
    }

    #[cfg(feature = "events")]
    pub fn rollback(&self, trx_id: u32) -> Result<()> {
        self.events.rollback(trx_id)
    }

    #[cfg(feature = "events")]
    pub fn find_event_listeners(&self, fqns: Vec<String>) -> u32 {
        self.events.find_event_listeners(fqns)
    }

    #[cfg(feature = "events")]
    pub fn add_event_family_handler(&self, handler: Box<dyn EventFamilyHandler>) {
        self.events.add_family_handler(handler);
    }

    #[cfg(feature = "events")]
    pub fn set_event_listener_result_handler(&self, handler: Box<dyn EventListenerResultHandler>) {
        self.events.set_listener_result_handler(handler);
    }

    // -- Notifications (§6, feature = "notifications") -------------------

    #[cfg(feature = "notifications")]
    pub fn subscribe_to_topics(&self, topics: Vec<(u32, String, SubscriptionKind)>, force_sync: bool) -> Result<()> {
        for (topic_id, name, kind) in topics {
            self.notifications.subscribe(topic_id, name, kind);
        }
        if force_sync {
            self.channels.sync(extension_type::NOTIFICATION)?;
        }
        Ok(())
    }

    #[cfg(feature = "notifications")]
    pub fn unsubscribe_from_topics(&self, topic_ids: Vec<u32>, force_sync: bool) -> Result<()> {
        for topic_id in topic_ids {
            self.notifications.unsubscribe(topic_id);
        }
        if force_sync {
            self.channels.sync(extension_type::NOTIFICATION)?;
        }
        Ok(())
    }

    /// Re-announces every currently subscribed topic, used after a
    /// NO_DELTA response leaves subscription state ambiguous (§8
    /// scenario 5).
    #[cfg(feature = "notifications")]
    pub fn sync_subscriptions(&self) {
        self.notifications.sync_subscriptions(&self.services());
    }

    #[cfg(feature = "notifications")]
    pub fn add_topic_listener(&self, listener: Box<dyn TopicListener>) -> u32 {
        self.notifications.add_topic_listener(listener)
    }

    #[cfg(feature = "notifications")]
    pub fn remove_topic_listener(&self, id: u32) -> Result<()> {
        self.notifications.remove_topic_listener(id)
    }

    #[cfg(feature = "notifications")]
    pub fn add_notification_listener(&self, listener: Box<dyn NotificationListener>) -> u32 {
        self.notifications.add_notification_listener(listener)
    }

    #[cfg(feature = "notifications")]
    pub fn remove_notification_listener(&self, id: u32) -> Result<()> {
        self.notifications.remove_notification_listener(id)
    }

    // -- Logging (§6, feature = "logging") --------------------------------

    #[cfg(feature = "logging")]
    pub fn add_log(&self, record: Vec<u8>) {
        self.logging.add_log(record);
    }

    #[cfg(feature = "logging")]
    pub fn set_log_storage(&self, storage: Box<dyn LogStorage>) {
        self.logging.set_log_storage(storage);
    }

    #[cfg(feature = "logging")]
    pub fn set_log_upload_strategy(&self, decision: Box<dyn UploadDecision>) {
        self.logging.set_upload_strategy(decision);
    }

    #[cfg(feature = "logging")]
    pub fn set_log_upload_result_listener(&self, listener: Box<dyn UploadResultListener>) {
        self.logging.set_result_listener(listener);
    }

    // -- Configuration (§6, feature = "configuration") --------------------

    #[cfg(feature = "configuration")]
    pub fn update_configuration(&self, body: Vec<u8>) {
        self.configuration.update_configuration(body);
    }

    #[cfg(feature = "configuration")]
    pub fn current_configuration(&self) -> Vec<u8> {
        self.configuration.current()
    }

    #[cfg(feature = "configuration")]
    pub fn set_configuration_listener(&self, listener: Box<dyn ConfigurationListener>) {
        self.configuration.set_listener(listener);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel_manager::SyncRequestBuilder;
    use crate::keys::StaticKeyProvider;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Mem(StdMutex<Option<Vec<u8>>>);
    impl StatusPersistence for Mem {
        fn read_file(&self, _p: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.0.lock().unwrap().clone())
        }
        fn write_file(&self, _p: &str, d: &[u8]) -> Result<()> {
            *self.0.lock().unwrap() = Some(d.to_vec());
            Ok(())
        }
    }

    fn config() -> ContextConfig {
        ContextConfig {
            status_path: "status.bin".to_owned(),
            status_persistence: Box::new(Mem::default()),
            key_provider: Box::new(StaticKeyProvider::new(b"endpoint-key".to_vec())),
            application_token: [0u8; APPLICATION_TOKEN_LEN],
            bootstrap_servers: vec![],
            sync_timeout_ms: 10_000,
        }
    }

    struct RecordingChannel {
        builder: Option<SyncRequestBuilder>,
        sent: Vec<Vec<u8>>,
    }
    impl Channel for RecordingChannel {
        fn supported_types(&self) -> &[u8] {
            &[extension_type::BOOTSTRAP]
        }
        fn sync_handler(&mut self, types: &[u8]) -> Result<()> {
            if let Some(builder) = &self.builder {
                let req = builder(types)?;
                self.sent.push(req);
            }
            Ok(())
        }
        fn set_sync_request_builder(&mut self, builder: SyncRequestBuilder) {
            self.builder = Some(builder);
        }
        fn set_server(&mut self, _access_point: crate::channel_manager::AccessPoint) {}
        fn destroy(&mut self) {}
    }

    #[test]
    fn init_assigns_endpoint_hash_once() {
        let ctx = Context::init(config()).unwrap();
        assert!(ctx.get_endpoint_id().is_some());
    }

    #[test]
    fn start_without_a_channel_is_not_found() {
        let ctx = Context::init(config()).unwrap();
        assert!(matches!(ctx.start(), Err(Error::NotFound)));
    }

    #[test]
    fn starting_with_a_bound_channel_pulls_a_bootstrap_request() {
        let ctx = Context::init(config()).unwrap();
        let channel: Arc<Mutex<dyn Channel>> =
            Arc::new(Mutex::new(RecordingChannel { builder: None, sent: Vec::new() }));
        ctx.add_channel(channel.clone());

        ctx.start().unwrap();

        let sent = &channel.lock().unwrap().sent;
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn deinit_persists_status() {
        let ctx = Context::init(config()).unwrap();
        ctx.set_profile(b"name=widget".to_vec());
        ctx.deinit().unwrap();
    }

    #[cfg(feature = "events")]
    #[test]
    fn abandoning_a_sync_keeps_the_event_queued_for_the_next_one() {
        use crate::engine::PROTOCOL_ID;
        use platform_wire::MessageReader;

        let ctx = Context::init(config()).unwrap();
        ctx.produce_event("device.temperature".to_owned(), vec![1, 2, 3]);

        let first = ctx.build_sync_request().unwrap();
        let mut reader = MessageReader::new(&first);
        let header = reader.read_header(PROTOCOL_ID, crate::engine::PROTOCOL_VERSION).unwrap();
        let mut saw_event = false;
        for _ in 0..header.extension_count {
            let ext_header = reader.read_extension_header().unwrap();
            reader.read_aligned(ext_header.length as usize).unwrap();
            saw_event |= ext_header.extension_type == extension_type::EVENT;
        }
        assert!(saw_event, "first request should carry the produced event");

        ctx.abandon_sync(1);

        let second = ctx.build_sync_request().unwrap();
        let mut reader = MessageReader::new(&second);
        let header = reader.read_header(PROTOCOL_ID, crate::engine::PROTOCOL_VERSION).unwrap();
        let mut saw_event_again = false;
        for _ in 0..header.extension_count {
            let ext_header = reader.read_extension_header().unwrap();
            reader.read_aligned(ext_header.length as usize).unwrap();
            saw_event_again |= ext_header.extension_type == extension_type::EVENT;
        }
        assert!(saw_event_again, "abandoned event should be reinjected into the next request");
    }

    #[test]
    fn failover_stop_app_halts_the_session() {
        let ctx = Context::init(config()).unwrap();
        for _ in 0..100 {
            if !ctx.process_failover(ServerKind::Bootstrap, 1) {
                return;
            }
        }
        panic!("expected failover to eventually stop the session");
    }
}
