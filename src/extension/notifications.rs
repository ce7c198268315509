// Platform Sync Engine — notification extension (§4.6).
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
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use platform_wire::{aligned_len, MessageReader, MessageWriter};

use crate::error::{Error, Result};
use crate::registry::{extension_type, Extension, ExtensionServices};
use crate::status::SubscriptionKind;

const OP_SUBSCRIBE: u8 = 0;
const OP_UNSUBSCRIBE: u8 = 1;
const ACK_SUCCESS: u8 = 0;

#[derive(Clone)]
enum SubCommand {
    Subscribe { topic_id: u32, name: String, kind: SubscriptionKind },
    Unsubscribe { topic_id: u32 },
}

fn write_str(writer: &mut MessageWriter, s: &str) -> Result<()> {
    writer.write_u16(s.len() as u16)?;
    writer.write_aligned(s.as_bytes())?;
    Ok(())
}

fn read_str(reader: &mut MessageReader) -> Result<String> {
    let len = reader.read_u16()? as usize;
    let bytes = reader.read_aligned(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::BadFormat(platform_wire::Error::BadFormat))
}

/// Notified when a subscription command this endpoint issued is acked
/// (§6).
pub trait TopicListener: Send {
    fn on_subscribed(&self, topic_id: u32, name: &str);
    fn on_unsubscribed(&self, topic_id: u32);
}

/// Notified when a notification payload arrives, multicast on a subscribed
/// topic or addressed to this endpoint directly (§6, §8 invariant: unicast
/// deliveries are deduplicated by UID before this fires).
pub trait NotificationListener: Send {
    fn on_multicast(&self, topic_id: u32, seq: u32, payload: &[u8]);
    fn on_unicast(&self, uid: u64, payload: &[u8]);
}

/// Tracks pending subscribe/unsubscribe commands and dispatches inbound
/// multicast/unicast notifications (§3, §4.6).
pub struct NotificationExtension {
    pending: Mutex<Vec<SubCommand>>,
    in_flight: Mutex<Vec<SubCommand>>,
    next_listener_id: AtomicU32,
    topic_listeners: Mutex<BTreeMap<u32, Box<dyn TopicListener>>>,
    notification_listeners: Mutex<BTreeMap<u32, Box<dyn NotificationListener>>>,
}

impl Default for NotificationExtension {
    fn default() -> Self {
        NotificationExtension {
            pending: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            next_listener_id: AtomicU32::new(1),
            topic_listeners: Mutex::new(BTreeMap::new()),
            notification_listeners: Mutex::new(BTreeMap::new()),
        }
    }
}

impl NotificationExtension {
    pub fn new() -> Self {
        NotificationExtension::default()
    }

    /// Registers a topic listener, returning the id `remove_topic_listener`
    /// takes back (§6).
    pub fn add_topic_listener(&self, listener: Box<dyn TopicListener>) -> u32 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.topic_listeners.lock().expect("notification mutex poisoned").insert(id, listener);
        id
    }

    pub fn remove_topic_listener(&self, id: u32) -> Result<()> {
        self.topic_listeners
            .lock()
            .expect("notification mutex poisoned")
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    /// Registers a notification listener, returning the id
    /// `remove_notification_listener` takes back (§6).
    pub fn add_notification_listener(&self, listener: Box<dyn NotificationListener>) -> u32 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.notification_listeners.lock().expect("notification mutex poisoned").insert(id, listener);
        id
    }

    pub fn remove_notification_listener(&self, id: u32) -> Result<()> {
        self.notification_listeners
            .lock()
            .expect("notification mutex poisoned")
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    pub fn subscribe(&self, topic_id: u32, name: String, kind: SubscriptionKind) {
        self.pending
            .lock()
            .expect("notification mutex poisoned")
            .push(SubCommand::Subscribe { topic_id, name, kind });
    }

    pub fn unsubscribe(&self, topic_id: u32) {
        self.pending
            .lock()
            .expect("notification mutex poisoned")
            .push(SubCommand::Unsubscribe { topic_id });
    }

    /// Marks every currently subscribed topic to be re-announced on the
    /// next sync, used after a NO_DELTA response tells the host its
    /// subscription state may have drifted (§8 scenario 5).
    pub fn sync_subscriptions(&self, services: &ExtensionServices) {
        let mut pending = self.pending.lock().expect("notification mutex poisoned");
        for (id, topic) in services.status.topics() {
            pending.push(SubCommand::Subscribe { topic_id: id, name: topic.name, kind: topic.kind });
        }
    }
}

impl Extension for NotificationExtension {
    fn extension_type(&self) -> u8 {
        extension_type::NOTIFICATION
    }

    fn needs_sync(&self, _services: &ExtensionServices) -> bool {
        !self.pending.lock().expect("notification mutex poisoned").is_empty()
    }

    fn request_size(&self, _services: &ExtensionServices) -> usize {
        let commands = self.pending.lock().expect("notification mutex poisoned");
        let mut size = aligned_len(4);
        for cmd in commands.iter() {
            let name_len = match cmd {
                SubCommand::Subscribe { name, .. } => name.len(),
                SubCommand::Unsubscribe { .. } => 0,
            };
            size += aligned_len(4) + aligned_len(4) + aligned_len(2) + aligned_len(name_len);
        }
        size
    }

    fn serialize_request(
        &self,
        services: &ExtensionServices,
        writer: &mut MessageWriter,
        _request_id: u32,
    ) -> Result<()> {
        let commands: Vec<SubCommand> =
            self.pending.lock().expect("notification mutex poisoned").drain(..).collect();

        let payload_len = self.request_size(services).max(aligned_len(4));
        writer.extension_header_write(extension_type::NOTIFICATION, 0, payload_len as u32)?;
        writer.write_u32(commands.len() as u32)?;
        for cmd in &commands {
            match cmd {
                SubCommand::Subscribe { topic_id, name, kind } => {
                    writer.write_u8(OP_SUBSCRIBE)?;
                    writer.write_u8(match kind {
                        SubscriptionKind::Mandatory => 0,
                        SubscriptionKind::Optional => 1,
                    })?;
                    writer.write_u16(0)?;
                    writer.write_u32(*topic_id)?;
                    write_str(writer, name)?;
                }
                SubCommand::Unsubscribe { topic_id } => {
                    writer.write_u8(OP_UNSUBSCRIBE)?;
                    writer.write_u8(0)?;
                    writer.write_u16(0)?;
                    writer.write_u32(*topic_id)?;
                    write_str(writer, "")?;
                }
            }
        }

        *self.in_flight.lock().expect("notification mutex poisoned") = commands;
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
        let in_flight = self.in_flight.lock().expect("notification mutex poisoned").drain(..).collect::<Vec<_>>();

        // NO_DELTA: nothing changed server-side since our last sync. The
        // accepted-UID set is pruned here rather than kept forever, since a
        // NO_DELTA means the server has forgotten which UIDs it already
        // delivered (§8 scenario 5).
        if length == 0 {
            services.status.clear_accepted_unicast_uids();
            return Ok(());
        }

        let ack_count = reader.read_u32()?;
        for i in 0..ack_count as usize {
            let op = reader.read_u8()?;
            let status = reader.read_u8()?;
            let _reserved = reader.read_u16()?;
            let topic_id = reader.read_u32()?;
            if status != ACK_SUCCESS {
                tracing::warn!(topic_id, "server rejected subscription command");
                continue;
            }
            match in_flight.get(i) {
                Some(SubCommand::Subscribe { name, kind, .. }) if op == OP_SUBSCRIBE => {
                    services.status.update_topic_seq(topic_id, name, *kind, services.status.topic(topic_id).map(|t| t.seq).unwrap_or(0));
                    for listener in self.topic_listeners.lock().expect("notification mutex poisoned").values() {
                        listener.on_subscribed(topic_id, name);
                    }
                }
                Some(SubCommand::Unsubscribe { .. }) if op == OP_UNSUBSCRIBE => {
                    services.status.remove_topic(topic_id);
                    for listener in self.topic_listeners.lock().expect("notification mutex poisoned").values() {
                        listener.on_unsubscribed(topic_id);
                    }
                }
                _ => tracing::warn!(topic_id, "subscription ack did not match an in-flight command"),
            }
        }

        let multicast_count = reader.read_u32()?;
        for _ in 0..multicast_count {
            let topic_id = reader.read_u32()?;
            let kind_byte = reader.read_u8()?;
            let _reserved = reader.read_u8()?;
            let seq = reader.read_u32()?;
            let name = read_str(reader)?;
            let payload_len = reader.read_u16()? as usize;
            let payload = reader.read_aligned(payload_len)?.to_vec();
            let kind = if kind_byte == 0 { SubscriptionKind::Mandatory } else { SubscriptionKind::Optional };

            if services.status.update_topic_seq(topic_id, &name, kind, seq) {
                for listener in self.notification_listeners.lock().expect("notification mutex poisoned").values() {
                    listener.on_multicast(topic_id, seq, &payload);
                }
            }
        }

        let unicast_count = reader.read_u32()?;
        for _ in 0..unicast_count {
            let uid = reader.read_u32()? as u64 | ((reader.read_u32()? as u64) << 32);
            let payload_len = reader.read_u16()? as usize;
            let payload = reader.read_aligned(payload_len)?.to_vec();

            if services.status.accept_unicast_uid(uid) {
                for listener in self.notification_listeners.lock().expect("notification mutex poisoned").values() {
                    listener.on_unicast(uid, &payload);
                }
            }
        }
        Ok(())
    }

    /// Returns the last serialized subscribe/unsubscribe commands to
    /// pending, ahead of anything queued since, so a timed-out or
    /// abandoned request doesn't silently drop them (§4.6).
    fn on_sync_failed(&self, _services: &ExtensionServices) {
        let in_flight = std::mem::take(&mut *self.in_flight.lock().expect("notification mutex poisoned"));
        if in_flight.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().expect("notification mutex poisoned");
        let mut restored = in_flight;
        restored.extend(pending.drain(..));
        *pending = restored;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel_manager::ChannelManager;
    use crate::status::{Status, StatusPersistence};
    use std::sync::{Arc, Mutex as StdMutex};

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

    fn harness() -> (Status, ChannelManager) {
        (
            Status::load("status.bin", Box::new(Mem::default())).unwrap(),
            ChannelManager::new(),
        )
    }

    fn write_response(
        acks: &[(u8, u8, u32)],
        multicasts: &[(u32, u8, u32, &str, &[u8])],
        unicasts: &[(u64, &[u8])],
    ) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let mut w = MessageWriter::new(&mut buf);
        w.write_u32(acks.len() as u32).unwrap();
        for (op, status, topic_id) in acks {
            w.write_u8(*op).unwrap();
            w.write_u8(*status).unwrap();
            w.write_u16(0).unwrap();
            w.write_u32(*topic_id).unwrap();
        }
        w.write_u32(multicasts.len() as u32).unwrap();
        for (topic_id, kind, seq, name, payload) in multicasts {
            w.write_u32(*topic_id).unwrap();
            w.write_u8(*kind).unwrap();
            w.write_u8(0).unwrap();
            w.write_u32(*seq).unwrap();
            write_str(&mut w, name).unwrap();
            w.write_u16(payload.len() as u16).unwrap();
            w.write_aligned(payload).unwrap();
        }
        w.write_u32(unicasts.len() as u32).unwrap();
        for (uid, payload) in unicasts {
            w.write_u32((*uid & 0xFFFF_FFFF) as u32).unwrap();
            w.write_u32((*uid >> 32) as u32).unwrap();
            w.write_u16(payload.len() as u16).unwrap();
            w.write_aligned(payload).unwrap();
        }
        let n = w.position();
        buf.truncate(n);
        buf
    }

    #[test]
    fn subscribe_ack_records_topic() {
        let ext = NotificationExtension::new();
        let (status, channels) = harness();
        let services = ExtensionServices { status: &status, channels: &channels };

        ext.subscribe(1, "weather".to_owned(), SubscriptionKind::Mandatory);
        let size = ext.request_size(&services);
        let mut buf = vec![0u8; size + 8];
        let mut writer = MessageWriter::new(&mut buf);
        ext.serialize_request(&services, &mut writer, 1).unwrap();

        let resp = write_response(&[(OP_SUBSCRIBE, ACK_SUCCESS, 1)], &[], &[]);
        let mut reader = MessageReader::new(&resp);
        ext.handle_server_sync(&services, &mut reader, 0, resp.len() as u32, 1).unwrap();

        assert!(status.topic(1).is_some());
    }

    #[test]
    fn duplicate_multicast_seq_is_ignored() {
        let ext = NotificationExtension::new();
        let (status, channels) = harness();
        let services = ExtensionServices { status: &status, channels: &channels };

        let seen = Arc::new(StdMutex::new(0u32));
        struct Counter(Arc<StdMutex<u32>>);
        impl NotificationListener for Counter {
            fn on_multicast(&self, _topic_id: u32, _seq: u32, _payload: &[u8]) {
                *self.0.lock().unwrap() += 1;
            }
            fn on_unicast(&self, _uid: u64, _payload: &[u8]) {}
        }
        ext.add_notification_listener(Box::new(Counter(seen.clone())));

        let resp = write_response(&[], &[(1, 0, 5, "weather", b"cold")], &[]);
        let mut reader = MessageReader::new(&resp);
        ext.handle_server_sync(&services, &mut reader, 0, resp.len() as u32, 1).unwrap();

        let resp2 = write_response(&[], &[(1, 0, 5, "weather", b"cold")], &[]);
        let mut reader2 = MessageReader::new(&resp2);
        ext.handle_server_sync(&services, &mut reader2, 0, resp2.len() as u32, 1).unwrap();

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn duplicate_unicast_uid_is_deduped() {
        let ext = NotificationExtension::new();
        let (status, channels) = harness();
        let services = ExtensionServices { status: &status, channels: &channels };

        let count = Arc::new(StdMutex::new(0u32));
        struct Counter(Arc<StdMutex<u32>>);
        impl NotificationListener for Counter {
            fn on_multicast(&self, _topic_id: u32, _seq: u32, _payload: &[u8]) {}
            fn on_unicast(&self, _uid: u64, _payload: &[u8]) {
                *self.0.lock().unwrap() += 1;
            }
        }
        ext.add_notification_listener(Box::new(Counter(count.clone())));

        let resp = write_response(&[], &[], &[(99, b"hi")]);
        let mut reader = MessageReader::new(&resp);
        ext.handle_server_sync(&services, &mut reader, 0, resp.len() as u32, 1).unwrap();
        let resp2 = write_response(&[], &[], &[(99, b"hi")]);
        let mut reader2 = MessageReader::new(&resp2);
        ext.handle_server_sync(&services, &mut reader2, 0, resp2.len() as u32, 1).unwrap();

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn every_topic_listener_fires_on_subscribe_ack() {
        let ext = NotificationExtension::new();
        let (status, channels) = harness();
        let services = ExtensionServices { status: &status, channels: &channels };

        let seen = Arc::new(StdMutex::new(Vec::new()));
        struct Recorder(Arc<StdMutex<Vec<u32>>>);
        impl TopicListener for Recorder {
            fn on_subscribed(&self, topic_id: u32, _name: &str) {
                self.0.lock().unwrap().push(topic_id);
            }
            fn on_unsubscribed(&self, _topic_id: u32) {}
        }
        ext.add_topic_listener(Box::new(Recorder(seen.clone())));
        ext.add_topic_listener(Box::new(Recorder(seen.clone())));

        ext.subscribe(1, "weather".to_owned(), SubscriptionKind::Mandatory);
        let size = ext.request_size(&services);
        let mut buf = vec![0u8; size + 8];
        let mut writer = MessageWriter::new(&mut buf);
        ext.serialize_request(&services, &mut writer, 1).unwrap();

        let resp = write_response(&[(OP_SUBSCRIBE, ACK_SUCCESS, 1)], &[], &[]);
        let mut reader = MessageReader::new(&resp);
        ext.handle_server_sync(&services, &mut reader, 0, resp.len() as u32, 1).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 1]);
    }

    #[test]
    fn removed_listener_id_is_not_found_on_second_removal() {
        let ext = NotificationExtension::new();
        struct Noop;
        impl TopicListener for Noop {
            fn on_subscribed(&self, _topic_id: u32, _name: &str) {}
            fn on_unsubscribed(&self, _topic_id: u32) {}
        }
        let id = ext.add_topic_listener(Box::new(Noop));
        ext.remove_topic_listener(id).unwrap();
        assert!(matches!(ext.remove_topic_listener(id), Err(Error::NotFound)));
    }

    #[test]
    fn abandoned_request_reinjects_subscription_command_as_pending() {
        let ext = NotificationExtension::new();
        let (status, channels) = harness();
        let services = ExtensionServices { status: &status, channels: &channels };

        ext.subscribe(1, "weather".to_owned(), SubscriptionKind::Mandatory);
        let size = ext.request_size(&services);
        let mut buf = vec![0u8; size + 8];
        let mut writer = MessageWriter::new(&mut buf);
        ext.serialize_request(&services, &mut writer, 1).unwrap();
        assert!(!ext.needs_sync(&services));

        ext.on_sync_failed(&services);
        assert!(ext.needs_sync(&services));
    }

    #[test]
    fn no_delta_response_clears_accepted_uids() {
        let ext = NotificationExtension::new();
        let (status, channels) = harness();
        let services = ExtensionServices { status: &status, channels: &channels };

        let resp = write_response(&[], &[], &[(99, b"hi")]);
        let mut reader = MessageReader::new(&resp);
        ext.handle_server_sync(&services, &mut reader, 0, resp.len() as u32, 1).unwrap();
        assert!(!status.accept_unicast_uid(99));

        let mut no_delta = MessageReader::new(&[]);
        ext.handle_server_sync(&services, &mut no_delta, 0, 0, 2).unwrap();
        assert!(status.accept_unicast_uid(99));
    }
}
