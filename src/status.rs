// Platform Sync Engine — persisted endpoint status.
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use platform_wire::SHA1_LEN;

use crate::error::{Error, Result};

/// Maximum number of accepted unicast notification UIDs kept before the
/// oldest are pruned on a successful delta sync (§3).
pub const MAX_ACCEPTED_UNICAST_UIDS: usize = 256;

/// Magic bytes at the start of a persisted status blob.
const STATUS_MAGIC: &[u8; 4] = b"PSS1";

/// Kind of a topic subscription (§3).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
pub enum SubscriptionKind {
    #[display("mandatory")]
    Mandatory,
    #[display("optional")]
    Optional,
}

/// Per-topic state kept in `Status` (§3).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TopicState {
    pub seq: u32,
    pub name: String,
    pub kind: SubscriptionKind,
}

/// External I/O shim for status persistence (§6). Hosts provide one
/// implementation; the engine never touches a filesystem directly.
pub trait StatusPersistence: Send + Sync {
    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>>;
    fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;
}

/// A `StatusPersistence` that writes through `std::fs`, using the
/// write-to-temp-then-rename sequence §4.2 describes, for hosts that run on
/// a conventional filesystem.
#[derive(Debug, Default)]
pub struct StdFsPersistence;

impl StatusPersistence for StdFsPersistence {
    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(_) => Err(Error::ReadFailed),
        }
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let tmp = format!("{}.tmp", path);
        std::fs::write(&tmp, data).map_err(|_| Error::WriteFailed)?;
        std::fs::rename(&tmp, path).map_err(|_| Error::WriteFailed)
    }
}

/// In-memory body of the persisted endpoint status (§3).
#[derive(Clone, PartialEq, Eq, Debug, Default)]
struct StatusBody {
    endpoint_public_key_hash: Option<[u8; SHA1_LEN]>,
    service_seq: BTreeMap<u8, u32>,
    profile_hash: Option<[u8; SHA1_LEN]>,
    is_registered: bool,
    is_attached: bool,
    attached_external_id: Option<String>,
    topics: BTreeMap<u32, TopicState>,
    accepted_unicast_uids: BTreeSet<u64>,
    /// Tagged fields the running binary does not understand, preserved
    /// byte-for-byte across a load/save round trip (§4.2).
    unknown_tags: Vec<(u8, Vec<u8>)>,
}

/// Tag identifiers for the on-disk TLV format.
mod tag {
    pub const ENDPOINT_HASH: u8 = 1;
    pub const SERVICE_SEQ: u8 = 2;
    pub const PROFILE_HASH: u8 = 3;
    pub const IS_REGISTERED: u8 = 4;
    pub const IS_ATTACHED: u8 = 5;
    pub const ATTACHED_EXTERNAL_ID: u8 = 6;
    pub const TOPICS: u8 = 7;
    pub const ACCEPTED_UNICAST_UIDS: u8 = 8;
}

impl StatusBody {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(STATUS_MAGIC);

        if let Some(hash) = &self.endpoint_public_key_hash {
            put_field(&mut out, tag::ENDPOINT_HASH, hash);
        }
        {
            let mut buf = Vec::with_capacity(self.service_seq.len() * 5);
            buf.push(self.service_seq.len() as u8);
            for (ty, seq) in &self.service_seq {
                buf.push(*ty);
                buf.extend_from_slice(&seq.to_be_bytes());
            }
            put_field(&mut out, tag::SERVICE_SEQ, &buf);
        }
        if let Some(hash) = &self.profile_hash {
            put_field(&mut out, tag::PROFILE_HASH, hash);
        }
        put_field(&mut out, tag::IS_REGISTERED, &[self.is_registered as u8]);
        put_field(&mut out, tag::IS_ATTACHED, &[self.is_attached as u8]);
        if let Some(id) = &self.attached_external_id {
            put_field(&mut out, tag::ATTACHED_EXTERNAL_ID, id.as_bytes());
        }
        {
            let mut buf = Vec::new();
            buf.extend_from_slice(&(self.topics.len() as u32).to_be_bytes());
            for (id, t) in &self.topics {
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(&t.seq.to_be_bytes());
                buf.push(match t.kind {
                    SubscriptionKind::Mandatory => 0,
                    SubscriptionKind::Optional => 1,
                });
                buf.extend_from_slice(&(t.name.len() as u16).to_be_bytes());
                buf.extend_from_slice(t.name.as_bytes());
            }
            put_field(&mut out, tag::TOPICS, &buf);
        }
        {
            let mut buf = Vec::with_capacity(self.accepted_unicast_uids.len() * 8);
            for uid in &self.accepted_unicast_uids {
                buf.extend_from_slice(&uid.to_be_bytes());
            }
            put_field(&mut out, tag::ACCEPTED_UNICAST_UIDS, &buf);
        }
        for (t, bytes) in &self.unknown_tags {
            put_field(&mut out, *t, bytes);
        }
        out
    }

    fn decode(data: &[u8]) -> Result<StatusBody> {
        if data.len() < 4 || &data[0..4] != STATUS_MAGIC {
            return Err(Error::BadParam);
        }
        let mut body = StatusBody::default();
        let mut pos = 4;
        while pos < data.len() {
            let (tag, field, next) = get_field(data, pos)?;
            pos = next;
            match tag {
                tag::ENDPOINT_HASH => {
                    body.endpoint_public_key_hash = Some(to_hash(field)?);
                }
                tag::SERVICE_SEQ => {
                    let mut it = field.iter().copied();
                    let count = it.next().ok_or(Error::BadParam)? as usize;
                    let rest: Vec<u8> = it.collect();
                    if rest.len() != count * 5 {
                        return Err(Error::BadParam);
                    }
                    for chunk in rest.chunks(5) {
                        let ty = chunk[0];
                        let seq = u32::from_be_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]);
                        body.service_seq.insert(ty, seq);
                    }
                }
                tag::PROFILE_HASH => {
                    body.profile_hash = Some(to_hash(field)?);
                }
                tag::IS_REGISTERED => {
                    body.is_registered = field.first().copied().unwrap_or(0) != 0;
                }
                tag::IS_ATTACHED => {
                    body.is_attached = field.first().copied().unwrap_or(0) != 0;
                }
                tag::ATTACHED_EXTERNAL_ID => {
                    body.attached_external_id =
                        Some(String::from_utf8(field.to_vec()).map_err(|_| Error::BadParam)?);
                }
                tag::TOPICS => {
                    if field.len() < 4 {
                        return Err(Error::BadParam);
                    }
                    let count = u32::from_be_bytes([field[0], field[1], field[2], field[3]]);
                    let mut p = 4usize;
                    for _ in 0..count {
                        if field.len() < p + 4 + 4 + 1 + 2 {
                            return Err(Error::BadParam);
                        }
                        let id = u32::from_be_bytes([
                            field[p],
                            field[p + 1],
                            field[p + 2],
                            field[p + 3],
                        ]);
                        let seq = u32::from_be_bytes([
                            field[p + 4],
                            field[p + 5],
                            field[p + 6],
                            field[p + 7],
                        ]);
                        let kind = match field[p + 8] {
                            0 => SubscriptionKind::Mandatory,
                            _ => SubscriptionKind::Optional,
                        };
                        let name_len =
                            u16::from_be_bytes([field[p + 9], field[p + 10]]) as usize;
                        p += 11;
                        if field.len() < p + name_len {
                            return Err(Error::BadParam);
                        }
                        let name = String::from_utf8(field[p..p + name_len].to_vec())
                            .map_err(|_| Error::BadParam)?;
                        p += name_len;
                        body.topics.insert(id, TopicState { seq, name, kind });
                    }
                }
                tag::ACCEPTED_UNICAST_UIDS => {
                    if field.len() % 8 != 0 {
                        return Err(Error::BadParam);
                    }
                    for chunk in field.chunks(8) {
                        body.accepted_unicast_uids.insert(u64::from_be_bytes(
                            chunk.try_into().map_err(|_| Error::BadParam)?,
                        ));
                    }
                }
                other => body.unknown_tags.push((other, field.to_vec())),
            }
        }
        Ok(body)
    }
}

fn put_field(out: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn get_field(data: &[u8], pos: usize) -> Result<(u8, &[u8], usize)> {
    if data.len() < pos + 5 {
        return Err(Error::BadParam);
    }
    let tag = data[pos];
    let len = u32::from_be_bytes([
        data[pos + 1],
        data[pos + 2],
        data[pos + 3],
        data[pos + 4],
    ]) as usize;
    let start = pos + 5;
    if data.len() < start + len {
        return Err(Error::BadParam);
    }
    Ok((tag, &data[start..start + len], start + len))
}

fn to_hash(field: &[u8]) -> Result<[u8; SHA1_LEN]> {
    field.try_into().map_err(|_| Error::BadParam)
}

/// Owns the durable endpoint state and its in-memory cache, serialized
/// behind a single mutex (§4.2, §5).
pub struct Status {
    path: String,
    io: Box<dyn StatusPersistence>,
    body: Mutex<StatusBody>,
}

impl Status {
    /// Loads status from `path`, or creates a fresh one if absent. A
    /// corrupted blob falls back to a fresh status with a warning (§7).
    pub fn load(path: impl Into<String>, io: Box<dyn StatusPersistence>) -> Result<Status> {
        let path = path.into();
        let body = match io.read_file(&path)? {
            Some(bytes) => StatusBody::decode(&bytes).unwrap_or_else(|_| {
                tracing::warn!(%path, "corrupted status blob, falling back to fresh status");
                StatusBody::default()
            }),
            None => StatusBody::default(),
        };
        Ok(Status {
            path,
            io,
            body: Mutex::new(body),
        })
    }

    /// Persists the current in-memory status, atomically from the host's
    /// point of view (§4.2).
    pub fn save(&self) -> Result<()> {
        let encoded = self.body.lock().expect("status mutex poisoned").encode();
        self.io.write_file(&self.path, &encoded)
    }

    pub fn endpoint_public_key_hash(&self) -> Option<[u8; SHA1_LEN]> {
        self.body.lock().expect("status mutex poisoned").endpoint_public_key_hash
    }

    /// Sets the endpoint's public key hash. Allowed only once (§4.2);
    /// a second call fails with `AlreadyExists`.
    pub fn set_endpoint_public_key_hash(&self, hash: [u8; SHA1_LEN]) -> Result<()> {
        let mut body = self.body.lock().expect("status mutex poisoned");
        if body.endpoint_public_key_hash.is_some() {
            return Err(Error::AlreadyExists);
        }
        body.endpoint_public_key_hash = Some(hash);
        Ok(())
    }

    pub fn service_seq(&self, extension_type: u8) -> u32 {
        *self
            .body
            .lock()
            .expect("status mutex poisoned")
            .service_seq
            .get(&extension_type)
            .unwrap_or(&0)
    }

    /// Advances a service's sequence counter. Rejects a decreasing value
    /// with `BadOrder` (§3 invariant).
    pub fn advance_service_seq(&self, extension_type: u8, new_seq: u32) -> Result<()> {
        let mut body = self.body.lock().expect("status mutex poisoned");
        let current = body.service_seq.get(&extension_type).copied().unwrap_or(0);
        if new_seq < current {
            return Err(Error::BadOrder);
        }
        body.service_seq.insert(extension_type, new_seq);
        Ok(())
    }

    pub fn profile_hash(&self) -> Option<[u8; SHA1_LEN]> {
        self.body.lock().expect("status mutex poisoned").profile_hash
    }

    pub fn set_profile_hash(&self, hash: [u8; SHA1_LEN]) {
        self.body.lock().expect("status mutex poisoned").profile_hash = Some(hash);
    }

    pub fn is_registered(&self) -> bool {
        self.body.lock().expect("status mutex poisoned").is_registered
    }

    pub fn set_registered(&self, value: bool) {
        self.body.lock().expect("status mutex poisoned").is_registered = value;
    }

    pub fn is_attached(&self) -> bool {
        self.body.lock().expect("status mutex poisoned").is_attached
    }

    pub fn attached_external_id(&self) -> Option<String> {
        self.body
            .lock()
            .expect("status mutex poisoned")
            .attached_external_id
            .clone()
    }

    pub fn set_attachment(&self, external_id: Option<String>) {
        let mut body = self.body.lock().expect("status mutex poisoned");
        body.is_attached = external_id.is_some();
        body.attached_external_id = external_id;
    }

    pub fn topics(&self) -> BTreeMap<u32, TopicState> {
        self.body.lock().expect("status mutex poisoned").topics.clone()
    }

    pub fn topic(&self, id: u32) -> Option<TopicState> {
        self.body.lock().expect("status mutex poisoned").topics.get(&id).cloned()
    }

    /// Updates a topic's sequence number. A multicast notification with
    /// `seq` no greater than the stored one is ignored (§8 invariant),
    /// returning `false`.
    pub fn update_topic_seq(&self, id: u32, name: &str, kind: SubscriptionKind, seq: u32) -> bool {
        let mut body = self.body.lock().expect("status mutex poisoned");
        let entry = body.topics.entry(id).or_insert_with(|| TopicState {
            seq: 0,
            name: name.to_owned(),
            kind,
        });
        if seq <= entry.seq && entry.seq != 0 {
            return false;
        }
        entry.seq = seq;
        entry.name = name.to_owned();
        entry.kind = kind;
        true
    }

    /// Drops a topic entirely, e.g. once an unsubscribe is acknowledged.
    pub fn remove_topic(&self, id: u32) {
        self.body.lock().expect("status mutex poisoned").topics.remove(&id);
    }

    pub fn set_topics(&self, topics: BTreeMap<u32, TopicState>) {
        self.body.lock().expect("status mutex poisoned").topics = topics;
    }

    /// Records a unicast UID as accepted. Returns `true` if it had not
    /// already been accepted (dedup, §8 invariant). Prunes the oldest UIDs
    /// once the bound is exceeded.
    pub fn accept_unicast_uid(&self, uid: u64) -> bool {
        let mut body = self.body.lock().expect("status mutex poisoned");
        let inserted = body.accepted_unicast_uids.insert(uid);
        while body.accepted_unicast_uids.len() > MAX_ACCEPTED_UNICAST_UIDS {
            if let Some(&oldest) = body.accepted_unicast_uids.iter().next() {
                body.accepted_unicast_uids.remove(&oldest);
            }
        }
        inserted
    }

    /// Clears accepted unicast UIDs, called after a NO_DELTA response
    /// (§8 scenario 5).
    pub fn clear_accepted_unicast_uids(&self) {
        self.body
            .lock()
            .expect("status mutex poisoned")
            .accepted_unicast_uids
            .clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct MemPersistence(Mutex<Option<Vec<u8>>>);

    impl StatusPersistence for MemPersistence {
        fn read_file(&self, _path: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.0.lock().unwrap().clone())
        }
        fn write_file(&self, _path: &str, data: &[u8]) -> Result<()> {
            *self.0.lock().unwrap() = Some(data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn fresh_status_has_no_hash() {
        let status = Status::load("status.bin", Box::new(MemPersistence::default())).unwrap();
        assert_eq!(status.endpoint_public_key_hash(), None);
    }

    #[test]
    fn hash_can_only_be_set_once() {
        let status = Status::load("status.bin", Box::new(MemPersistence::default())).unwrap();
        status.set_endpoint_public_key_hash([1u8; SHA1_LEN]).unwrap();
        assert!(matches!(
            status.set_endpoint_public_key_hash([2u8; SHA1_LEN]),
            Err(Error::AlreadyExists)
        ));
    }

    #[test]
    fn sequence_numbers_reject_decrease() {
        let status = Status::load("status.bin", Box::new(MemPersistence::default())).unwrap();
        status.advance_service_seq(5, 3).unwrap();
        assert!(matches!(
            status.advance_service_seq(5, 2),
            Err(Error::BadOrder)
        ));
        status.advance_service_seq(5, 3).unwrap();
        status.advance_service_seq(5, 4).unwrap();
        assert_eq!(status.service_seq(5), 4);
    }

    #[test]
    fn round_trip_preserves_unknown_tags() {
        let io = std::sync::Arc::new(MemPersistence::default());
        struct Shared(std::sync::Arc<MemPersistence>);
        impl StatusPersistence for Shared {
            fn read_file(&self, p: &str) -> Result<Option<Vec<u8>>> {
                self.0.read_file(p)
            }
            fn write_file(&self, p: &str, d: &[u8]) -> Result<()> {
                self.0.write_file(p, d)
            }
        }

        let status = Status::load("status.bin", Box::new(Shared(io.clone()))).unwrap();
        status.set_endpoint_public_key_hash([9u8; SHA1_LEN]).unwrap();
        {
            let mut body = status.body.lock().unwrap();
            body.unknown_tags.push((200, vec![1, 2, 3]));
        }
        status.save().unwrap();

        let reloaded = Status::load("status.bin", Box::new(Shared(io))).unwrap();
        assert_eq!(
            reloaded.endpoint_public_key_hash(),
            Some([9u8; SHA1_LEN])
        );
        assert_eq!(
            reloaded.body.lock().unwrap().unknown_tags,
            vec![(200, vec![1, 2, 3])]
        );
    }

    #[test]
    fn topic_seq_monotonic() {
        let status = Status::load("status.bin", Box::new(MemPersistence::default())).unwrap();
        assert!(status.update_topic_seq(1, "weather", SubscriptionKind::Mandatory, 5));
        assert!(!status.update_topic_seq(1, "weather", SubscriptionKind::Mandatory, 5));
        assert!(!status.update_topic_seq(1, "weather", SubscriptionKind::Mandatory, 3));
        assert!(status.update_topic_seq(1, "weather", SubscriptionKind::Mandatory, 6));
    }

    #[test]
    fn unicast_uid_dedup_and_clear() {
        let status = Status::load("status.bin", Box::new(MemPersistence::default())).unwrap();
        assert!(status.accept_unicast_uid(42));
        assert!(!status.accept_unicast_uid(42));
        status.clear_accepted_unicast_uids();
        assert!(status.accept_unicast_uid(42));
    }
}
