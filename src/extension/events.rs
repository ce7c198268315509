// Platform Sync Engine — event extension (§4.6).
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use platform_wire::{aligned_len, MessageReader, MessageWriter};

use crate::error::{Error, Result};
use crate::registry::{extension_type, Extension, ExtensionServices};

/// One produced or received event (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub seq: u32,
    pub fqn: String,
    pub body: Vec<u8>,
}

/// Handles inbound events whose FQN this family declares support for (§6).
pub trait EventFamilyHandler: Send {
    fn supported_fqns(&self) -> &[String];
    fn on_event(&self, event: &Event);
}

/// Notified once a listener query the endpoint issued comes back with the
/// set of FQNs that currently have at least one listener (§6).
pub trait EventListenerResultHandler: Send {
    fn on_listeners_found(&self, query_id: u32, fqns_with_listeners: Vec<String>);
}

#[derive(Clone)]
struct PendingEvent {
    fqn: String,
    body: Vec<u8>,
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

/// A transaction batches `produce` calls until `commit` moves them into the
/// outbound queue, or `rollback` discards them (§6).
#[derive(Default)]
struct TransactionTable {
    next_id: AtomicU32,
    open: Mutex<HashMap<u32, Vec<PendingEvent>>>,
}

/// Buffers outbound events, dispatches inbound ones to registered family
/// handlers in sequence order, and tracks pending listener queries by a
/// client-allocated 32-bit request id (§3, §6).
pub struct EventExtension {
    outbox: Mutex<Vec<PendingEvent>>,
    trx: TransactionTable,
    next_query_id: AtomicU32,
    pending_queries: Mutex<BTreeMap<u32, Vec<String>>>,
    in_flight_events: Mutex<Vec<(u32, PendingEvent)>>,
    in_flight_queries: Mutex<Vec<(u32, Vec<String>)>>,
    families: Mutex<Vec<Box<dyn EventFamilyHandler>>>,
    listener_result_handler: Mutex<Option<Box<dyn EventListenerResultHandler>>>,
}

impl Default for EventExtension {
    fn default() -> Self {
        EventExtension {
            outbox: Mutex::new(Vec::new()),
            trx: TransactionTable::default(),
            next_query_id: AtomicU32::new(1),
            pending_queries: Mutex::new(BTreeMap::new()),
            in_flight_events: Mutex::new(Vec::new()),
            in_flight_queries: Mutex::new(Vec::new()),
            families: Mutex::new(Vec::new()),
            listener_result_handler: Mutex::new(None),
        }
    }
}

impl EventExtension {
    pub fn new() -> Self {
        EventExtension::default()
    }

    pub fn add_family_handler(&self, handler: Box<dyn EventFamilyHandler>) {
        self.families.lock().expect("event mutex poisoned").push(handler);
    }

    pub fn set_listener_result_handler(&self, handler: Box<dyn EventListenerResultHandler>) {
        *self.listener_result_handler.lock().expect("event mutex poisoned") = Some(handler);
    }

    /// Queues an event outside of any transaction (shorthand for
    /// `begin_trx` + `produce` + `commit` with a single event).
    pub fn produce_event(&self, fqn: String, body: Vec<u8>) {
        self.outbox.lock().expect("event mutex poisoned").push(PendingEvent { fqn, body });
    }

    pub fn begin_trx(&self) -> u32 {
        let id = self.trx.next_id.fetch_add(1, Ordering::SeqCst);
        self.trx.open.lock().expect("event mutex poisoned").insert(id, Vec::new());
        id
    }

    pub fn produce(&self, trx_id: u32, fqn: String, body: Vec<u8>) -> Result<()> {
        let mut open = self.trx.open.lock().expect("event mutex poisoned");
        let buf = open.get_mut(&trx_id).ok_or(Error::NotFound)?;
        buf.push(PendingEvent { fqn, body });
        Ok(())
    }

    pub fn commit(&self, trx_id: u32) -> Result<()> {
        let mut open = self.trx.open.lock().expect("event mutex poisoned");
        let buf = open.remove(&trx_id).ok_or(Error::NotFound)?;
        self.outbox.lock().expect("event mutex poisoned").extend(buf);
        Ok(())
    }

    pub fn rollback(&self, trx_id: u32) -> Result<()> {
        self.trx
            .open
            .lock()
            .expect("event mutex poisoned")
            .remove(&trx_id)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    /// Issues a listener query for `fqns`, returning the client-allocated
    /// request id the eventual response will echo (§6).
    pub fn find_event_listeners(&self, fqns: Vec<String>) -> u32 {
        let id = self.next_query_id.fetch_add(1, Ordering::SeqCst);
        self.pending_queries.lock().expect("event mutex poisoned").insert(id, fqns);
        id
    }

    fn dispatch(&self, event: &Event) {
        let families = self.families.lock().expect("event mutex poisoned");
        for family in families.iter() {
            if family.supported_fqns().iter().any(|fqn| fqn == &event.fqn) {
                family.on_event(event);
            }
        }
    }
}

impl Extension for EventExtension {
    fn extension_type(&self) -> u8 {
        extension_type::EVENT
    }

    fn needs_sync(&self, _services: &ExtensionServices) -> bool {
        !self.outbox.lock().expect("event mutex poisoned").is_empty()
            || !self.pending_queries.lock().expect("event mutex poisoned").is_empty()
    }

    fn request_size(&self, _services: &ExtensionServices) -> usize {
        let events = self.outbox.lock().expect("event mutex poisoned");
        let queries = self.pending_queries.lock().expect("event mutex poisoned");

        let mut size = aligned_len(4) + aligned_len(4);
        for e in events.iter() {
            size += aligned_len(4) + aligned_len(2) + aligned_len(e.fqn.len()) + aligned_len(2) + aligned_len(e.body.len());
        }
        for (_, fqns) in queries.iter() {
            size += aligned_len(4) + aligned_len(2);
            for fqn in fqns {
                size += aligned_len(2) + aligned_len(fqn.len());
            }
        }
        size
    }

    fn serialize_request(
        &self,
        services: &ExtensionServices,
        writer: &mut MessageWriter,
        _request_id: u32,
    ) -> Result<()> {
        let events: Vec<PendingEvent> = self.outbox.lock().expect("event mutex poisoned").drain(..).collect();
        let queries: Vec<(u32, Vec<String>)> =
            self.pending_queries.lock().expect("event mutex poisoned").iter().map(|(k, v)| (*k, v.clone())).collect();

        let payload_len = self.request_size(services).max(aligned_len(4) + aligned_len(4));
        writer.extension_header_write(extension_type::EVENT, 0, payload_len as u32)?;

        // Sequence numbers are assigned here so the request is
        // self-describing, but `status.advance_service_seq` only runs once
        // the server has acknowledged the delta, in `handle_server_sync`
        // (§3: a counter only advances on acknowledgment).
        let mut numbered = Vec::with_capacity(events.len());
        let mut seq = services.status.service_seq(extension_type::EVENT);
        for event in events {
            seq += 1;
            numbered.push((seq, event));
        }

        writer.write_u32(numbered.len() as u32)?;
        for (seq, event) in &numbered {
            writer.write_u32(*seq)?;
            write_str(writer, &event.fqn)?;
            writer.write_u16(event.body.len() as u16)?;
            writer.write_aligned(&event.body)?;
        }

        writer.write_u32(queries.len() as u32)?;
        for (id, fqns) in &queries {
            writer.write_u32(*id)?;
            writer.write_u16(fqns.len() as u16)?;
            for fqn in fqns {
                write_str(writer, fqn)?;
            }
        }

        *self.in_flight_events.lock().expect("event mutex poisoned") = numbered;
        *self.in_flight_queries.lock().expect("event mutex poisoned") = queries.clone();
        for (id, _) in &queries {
            self.pending_queries.lock().expect("event mutex poisoned").remove(id);
        }
        Ok(())
    }

    fn handle_server_sync(
        &self,
        services: &ExtensionServices,
        reader: &mut MessageReader,
        _options: u32,
        _length: u32,
        _request_id: u32,
    ) -> Result<()> {
        // The request landed: promote the provisional sequence numbers and
        // forget the in-flight snapshot. A failed send would have aborted
        // before this point (§4.5 step 3), so anything still in-flight here
        // was accepted.
        let acked_events = std::mem::take(&mut *self.in_flight_events.lock().expect("event mutex poisoned"));
        self.in_flight_queries.lock().expect("event mutex poisoned").clear();
        if let Some(max_seq) = acked_events.iter().map(|(seq, _)| *seq).max() {
            services.status.advance_service_seq(extension_type::EVENT, max_seq)?;
        }

        let incoming_count = reader.read_u32()?;
        let mut incoming = Vec::with_capacity(incoming_count as usize);
        for _ in 0..incoming_count {
            let seq = reader.read_u32()?;
            let fqn = read_str(reader)?;
            let body_len = reader.read_u16()? as usize;
            let body = reader.read_aligned(body_len)?.to_vec();
            incoming.push(Event { seq, fqn, body });
        }
        incoming.sort_by_key(|e| e.seq);
        for event in &incoming {
            self.dispatch(event);
        }

        let result_count = reader.read_u32()?;
        for _ in 0..result_count {
            let query_id = reader.read_u32()?;
            let fqn_count = reader.read_u16()?;
            let mut fqns = Vec::with_capacity(fqn_count as usize);
            for _ in 0..fqn_count {
                fqns.push(read_str(reader)?);
            }
            if let Some(handler) = self.listener_result_handler.lock().expect("event mutex poisoned").as_ref() {
                handler.on_listeners_found(query_id, fqns);
            }
        }
        Ok(())
    }

    /// Returns the last serialized events and listener queries to the
    /// pending queues, ahead of whatever was produced in the meantime, so a
    /// timed-out or abandoned request doesn't silently drop them (§4.6).
    fn on_sync_failed(&self, _services: &ExtensionServices) {
        let in_flight = std::mem::take(&mut *self.in_flight_events.lock().expect("event mutex poisoned"));
        if !in_flight.is_empty() {
            let mut outbox = self.outbox.lock().expect("event mutex poisoned");
            let mut restored: Vec<PendingEvent> = in_flight.into_iter().map(|(_, event)| event).collect();
            restored.extend(outbox.drain(..));
            *outbox = restored;
        }

        let in_flight_queries = std::mem::take(&mut *self.in_flight_queries.lock().expect("event mutex poisoned"));
        if !in_flight_queries.is_empty() {
            let mut pending = self.pending_queries.lock().expect("event mutex poisoned");
            for (id, fqns) in in_flight_queries {
                pending.entry(id).or_insert(fqns);
            }
        }
    }
}
