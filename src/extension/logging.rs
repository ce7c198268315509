// Platform Sync Engine — logging extension (§4.6).
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use platform_wire::{aligned_len, MessageReader, MessageWriter};

use crate::error::Result;
use crate::registry::{extension_type, Extension, ExtensionServices};

/// Per-block upload outcome the server reports (§4.6).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
pub enum UploadOutcome {
    #[display("delivered")]
    Delivered,
    #[display("canceled")]
    Canceled,
    #[display("server storage full")]
    ServerStorageFull,
}

impl UploadOutcome {
    fn from_byte(b: u8) -> UploadOutcome {
        match b {
            0 => UploadOutcome::Delivered,
            1 => UploadOutcome::Canceled,
            _ => UploadOutcome::ServerStorageFull,
        }
    }
}

/// Decides whether a batch of buffered records should be included as an
/// upload block in the next sync, letting hosts gate on network policy
/// (§6, supplementary feature).
pub trait UploadDecision: Send {
    fn should_upload(&self, pending_bytes: usize) -> bool;
}

/// Uploads every buffered batch unconditionally; the default policy.
pub struct AlwaysUpload;
impl UploadDecision for AlwaysUpload {
    fn should_upload(&self, _pending_bytes: usize) -> bool {
        true
    }
}

/// Notified once the server acknowledges an upload block (§4.6).
pub trait UploadResultListener: Send {
    fn on_upload_result(&self, upload_id: u32, outcome: UploadOutcome);
}

/// Where buffered records live before being bundled into an upload block
/// (§6 `set_log_storage`). Hosts constrained on RAM can swap in a
/// disk-backed implementation; the default keeps everything in memory.
pub trait LogStorage: Send {
    fn store(&mut self, record: Vec<u8>);
    fn drain(&mut self) -> Vec<Vec<u8>>;
    /// Non-destructive snapshot of what `drain` would return, used to size
    /// the outbound payload before it is actually serialized.
    fn pending_records(&self) -> Vec<Vec<u8>>;
    fn pending_bytes(&self) -> usize;
    fn is_empty(&self) -> bool;
}

/// Keeps every buffered record in a plain `Vec`; the default storage.
#[derive(Default)]
pub struct InMemoryLogStorage(Vec<Vec<u8>>);

impl LogStorage for InMemoryLogStorage {
    fn store(&mut self, record: Vec<u8>) {
        self.0.push(record);
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.0.drain(..).collect()
    }

    fn pending_records(&self) -> Vec<Vec<u8>> {
        self.0.clone()
    }

    fn pending_bytes(&self) -> usize {
        self.0.iter().map(|r| r.len()).sum()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Buffers user log records and, once an `UploadDecision` says so, bundles
/// them into a client-side-numbered upload block (§3, §4.6).
pub struct LoggingExtension {
    storage: Mutex<Box<dyn LogStorage>>,
    next_upload_id: AtomicU32,
    in_flight: Mutex<Option<u32>>,
    in_flight_records: Mutex<Vec<Vec<u8>>>,
    decision: Mutex<Box<dyn UploadDecision>>,
    listener: Mutex<Option<Box<dyn UploadResultListener>>>,
}

impl Default for LoggingExtension {
    fn default() -> Self {
        LoggingExtension {
            storage: Mutex::new(Box::new(InMemoryLogStorage::default())),
            next_upload_id: AtomicU32::new(1),
            in_flight: Mutex::new(None),
            in_flight_records: Mutex::new(Vec::new()),
            decision: Mutex::new(Box::new(AlwaysUpload)),
            listener: Mutex::new(None),
        }
    }
}

impl LoggingExtension {
    pub fn new() -> Self {
        LoggingExtension::default()
    }

    pub fn add_log(&self, record: Vec<u8>) {
        self.storage.lock().expect("logging mutex poisoned").store(record);
    }

    /// Swaps the backing store for buffered records (§6 `set_log_storage`).
    /// Any records already buffered in the previous store are carried over.
    pub fn set_log_storage(&self, mut storage: Box<dyn LogStorage>) {
        let mut current = self.storage.lock().expect("logging mutex poisoned");
        for record in current.drain() {
            storage.store(record);
        }
        *current = storage;
    }

    pub fn set_upload_strategy(&self, decision: Box<dyn UploadDecision>) {
        *self.decision.lock().expect("logging mutex poisoned") = decision;
    }

    pub fn set_result_listener(&self, listener: Box<dyn UploadResultListener>) {
        *self.listener.lock().expect("logging mutex poisoned") = Some(listener);
    }

    fn pending_bytes(&self) -> usize {
        self.storage.lock().expect("logging mutex poisoned").pending_bytes()
    }
}

impl Extension for LoggingExtension {
    fn extension_type(&self) -> u8 {
        extension_type::LOGGING
    }

    fn needs_sync(&self, _services: &ExtensionServices) -> bool {
        let storage = self.storage.lock().expect("logging mutex poisoned");
        !storage.is_empty() && self.decision.lock().expect("logging mutex poisoned").should_upload(storage.pending_bytes())
    }

    fn request_size(&self, _services: &ExtensionServices) -> usize {
        let storage = self.storage.lock().expect("logging mutex poisoned");
        let mut size = aligned_len(4) + aligned_len(4);
        for record in storage.pending_records() {
            size += aligned_len(4) + aligned_len(record.len());
        }
        size
    }

    fn serialize_request(
        &self,
        services: &ExtensionServices,
        writer: &mut MessageWriter,
        _request_id: u32,
    ) -> Result<()> {
        let records: Vec<Vec<u8>> = self.storage.lock().expect("logging mutex poisoned").drain();
        let upload_id = self.next_upload_id.fetch_add(1, Ordering::SeqCst);

        let payload_len = self.request_size(services).max(aligned_len(4) + aligned_len(4));
        writer.extension_header_write(extension_type::LOGGING, 0, payload_len as u32)?;
        writer.write_u32(upload_id)?;
        writer.write_u32(records.len() as u32)?;
        for record in &records {
            writer.write_u32(record.len() as u32)?;
            writer.write_aligned(record)?;
        }

        *self.in_flight.lock().expect("logging mutex poisoned") = Some(upload_id);
        *self.in_flight_records.lock().expect("logging mutex poisoned") = records;
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
        let in_flight = self.in_flight.lock().expect("logging mutex poisoned").take();
        self.in_flight_records.lock().expect("logging mutex poisoned").clear();
        if length == 0 {
            return Ok(());
        }
        let upload_id = reader.read_u32()?;
        let outcome = UploadOutcome::from_byte(reader.read_u8()?);

        if in_flight != Some(upload_id) {
            tracing::warn!(upload_id, "upload ack does not match in-flight upload");
        }
        if let Some(listener) = self.listener.lock().expect("logging mutex poisoned").as_ref() {
            listener.on_upload_result(upload_id, outcome);
        }
        Ok(())
    }

    /// Returns the last serialized upload block to storage, ahead of
    /// whatever was logged in the meantime, so a timed-out or abandoned
    /// request doesn't silently drop buffered records (§4.6).
    fn on_sync_failed(&self, _services: &ExtensionServices) {
        self.in_flight.lock().expect("logging mutex poisoned").take();
        let records = std::mem::take(&mut *self.in_flight_records.lock().expect("logging mutex poisoned"));
        if records.is_empty() {
            return;
        }
        let mut storage = self.storage.lock().expect("logging mutex poisoned");
        let newer = storage.drain();
        for record in records.into_iter().chain(newer.into_iter()) {
            storage.store(record);
        }
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

    struct NeverUpload;
    impl UploadDecision for NeverUpload {
        fn should_upload(&self, _pending_bytes: usize) -> bool {
            false
        }
    }

    #[test]
    fn upload_strategy_gates_needs_sync() {
        let ext = LoggingExtension::new();
        let (status, channels) = harness();
        let services = ExtensionServices { status: &status, channels: &channels };

        ext.add_log(b"boot".to_vec());
        assert!(ext.needs_sync(&services));

        ext.set_upload_strategy(Box::new(NeverUpload));
        assert!(!ext.needs_sync(&services));
    }

    #[test]
    fn upload_result_reaches_listener() {
        let ext = LoggingExtension::new();
        let (status, channels) = harness();
        let services = ExtensionServices { status: &status, channels: &channels };

        let outcomes = Arc::new(StdMutex::new(Vec::new()));
        struct Recorder(Arc<StdMutex<Vec<UploadOutcome>>>);
        impl UploadResultListener for Recorder {
            fn on_upload_result(&self, _upload_id: u32, outcome: UploadOutcome) {
                self.0.lock().unwrap().push(outcome);
            }
        }
        ext.set_result_listener(Box::new(Recorder(outcomes.clone())));

        ext.add_log(b"boot".to_vec());
        let size = ext.request_size(&services);
        let mut buf = vec![0u8; size + 8];
        let mut writer = MessageWriter::new(&mut buf);
        ext.serialize_request(&services, &mut writer, 1).unwrap();

        let mut resp = vec![0u8; 8];
        let mut w = MessageWriter::new(&mut resp);
        w.write_u32(1).unwrap();
        w.write_u8(0).unwrap();
        w.write_u8(0).unwrap();
        w.write_u8(0).unwrap();
        w.write_u8(0).unwrap();
        let n = w.position();

        let mut reader = MessageReader::new(&resp[..n]);
        ext.handle_server_sync(&services, &mut reader, 0, n as u32, 1).unwrap();

        assert_eq!(*outcomes.lock().unwrap(), vec![UploadOutcome::Delivered]);
    }

    #[test]
    fn abandoned_upload_reinjects_records_ahead_of_newly_logged_ones() {
        let ext = LoggingExtension::new();
        let (status, channels) = harness();
        let services = ExtensionServices { status: &status, channels: &channels };

        ext.add_log(b"first".to_vec());
        let size = ext.request_size(&services);
        let mut buf = vec![0u8; size + 8];
        let mut writer = MessageWriter::new(&mut buf);
        ext.serialize_request(&services, &mut writer, 1).unwrap();
        assert!(!ext.needs_sync(&services));

        ext.add_log(b"second".to_vec());
        ext.on_sync_failed(&services);

        assert!(ext.needs_sync(&services));
        let pending = ext.storage.lock().unwrap().pending_records();
        assert_eq!(pending, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn switching_storage_carries_buffered_records_over() {
        let ext = LoggingExtension::new();
        let (status, channels) = harness();
        let services = ExtensionServices { status: &status, channels: &channels };

        ext.add_log(b"boot".to_vec());
        ext.set_log_storage(Box::new(InMemoryLogStorage::default()));
        assert!(ext.needs_sync(&services));
    }
}
