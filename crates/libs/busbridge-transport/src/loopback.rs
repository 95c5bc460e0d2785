//! In-memory, single-threaded implementation of [`Transport`].
//!
//! Every object is a reference-counted slot in one table. Messages sent on a
//! connection wait in its outgoing queue until `flush` (or `read_write`)
//! copies them into each recipient's incoming queue. Nothing ever blocks, so
//! timeouts are accepted and ignored.
//!
//! Routing follows the bus daemon closely enough for binding tests:
//!
//! - a peer connection delivers to its other end;
//! - a bus connection delivers to the connection whose unique name is the
//!   message destination, and to every other connection on that bus holding
//!   a match rule the message satisfies.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU64;

use busbridge_protocol::{
    BusType, DispatchStatus, HandlerResult, MatchRule, MessageHeader, MessageType,
};

use crate::{FilterHook, NativeHandle, Transport, TransportError};

struct Slot {
    refs: usize,
    entity: Entity,
}

enum Entity {
    Connection(ConnectionState),
    Server(ServerState),
    Message(MessageState),
}

struct ConnectionState {
    bus: Option<BusType>,
    /// The per-bus connection handed out by `bus_get`.
    shared: bool,
    unique_name: Option<String>,
    server_id: String,
    peer: Option<NativeHandle>,
    connected: bool,
    outgoing: VecDeque<NativeHandle>,
    /// A borrowed message stays at the head of this queue.
    incoming: VecDeque<NativeHandle>,
    borrowed: Option<NativeHandle>,
    hook: Option<FilterHook>,
    rules: Vec<(String, MatchRule)>,
}

impl ConnectionState {
    fn new(server_id: String) -> Self {
        Self {
            bus: None,
            shared: false,
            unique_name: None,
            server_id,
            peer: None,
            connected: true,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            borrowed: None,
            hook: None,
            rules: Vec::new(),
        }
    }

    fn status(&self) -> DispatchStatus {
        if self.incoming.is_empty() {
            DispatchStatus::Complete
        } else {
            DispatchStatus::DataRemains
        }
    }
}

struct ServerState {
    /// Normalized listen address, the key into `listeners`.
    key: String,
    id: String,
    listening: bool,
    pending: VecDeque<NativeHandle>,
}

struct MessageState {
    header: MessageHeader,
    error_message: Option<String>,
}

impl MessageState {
    fn new(header: MessageHeader) -> Self {
        Self { header, error_message: None }
    }
}

struct LoopbackState {
    next_handle: NonZeroU64,
    last_serial: u32,
    next_unique: u64,
    next_guid: u64,
    entities: HashMap<NativeHandle, Slot>,
    buses: HashMap<BusType, NativeHandle>,
    bus_ids: HashMap<BusType, String>,
    listeners: HashMap<String, NativeHandle>,
    release_faults: usize,
}

impl LoopbackState {
    fn new() -> Self {
        Self {
            next_handle: NonZeroU64::MIN,
            last_serial: 0,
            next_unique: 1,
            next_guid: 1,
            entities: HashMap::new(),
            buses: HashMap::new(),
            bus_ids: HashMap::new(),
            listeners: HashMap::new(),
            release_faults: 0,
        }
    }

    fn allocate(&mut self, entity: Entity) -> NativeHandle {
        let handle = NativeHandle::from(self.next_handle);
        self.next_handle = self.next_handle.saturating_add(1);
        self.entities.insert(handle, Slot { refs: 1, entity });
        handle
    }

    fn guid(&mut self) -> String {
        let guid = format!("{:032x}", self.next_guid);
        self.next_guid += 1;
        guid
    }

    fn new_bus_connection(&mut self, bus: BusType, shared: bool) -> NativeHandle {
        let server_id = match self.bus_ids.get(&bus) {
            Some(id) => id.clone(),
            None => {
                let id = self.guid();
                self.bus_ids.insert(bus, id.clone());
                id
            }
        };
        let unique_name = format!(":1.{}", self.next_unique);
        self.next_unique += 1;
        let mut connection = ConnectionState::new(server_id);
        connection.bus = Some(bus);
        connection.shared = shared;
        connection.unique_name = Some(unique_name);
        self.allocate(Entity::Connection(connection))
    }

    fn connection(&self, handle: NativeHandle) -> Result<&ConnectionState, TransportError> {
        match self.entities.get(&handle).map(|slot| &slot.entity) {
            Some(Entity::Connection(conn)) => Ok(conn),
            Some(_) => Err(TransportError::invalid_args(format!("{handle} is not a connection"))),
            None => Err(TransportError::unknown_handle(handle)),
        }
    }

    fn connection_mut(
        &mut self,
        handle: NativeHandle,
    ) -> Result<&mut ConnectionState, TransportError> {
        match self.entities.get_mut(&handle).map(|slot| &mut slot.entity) {
            Some(Entity::Connection(conn)) => Ok(conn),
            Some(_) => Err(TransportError::invalid_args(format!("{handle} is not a connection"))),
            None => Err(TransportError::unknown_handle(handle)),
        }
    }

    fn server(&self, handle: NativeHandle) -> Result<&ServerState, TransportError> {
        match self.entities.get(&handle).map(|slot| &slot.entity) {
            Some(Entity::Server(server)) => Ok(server),
            Some(_) => Err(TransportError::invalid_args(format!("{handle} is not a server"))),
            None => Err(TransportError::unknown_handle(handle)),
        }
    }

    fn server_mut(&mut self, handle: NativeHandle) -> Result<&mut ServerState, TransportError> {
        match self.entities.get_mut(&handle).map(|slot| &mut slot.entity) {
            Some(Entity::Server(server)) => Ok(server),
            Some(_) => Err(TransportError::invalid_args(format!("{handle} is not a server"))),
            None => Err(TransportError::unknown_handle(handle)),
        }
    }

    fn message(&self, handle: NativeHandle) -> Result<&MessageState, TransportError> {
        match self.entities.get(&handle).map(|slot| &slot.entity) {
            Some(Entity::Message(message)) => Ok(message),
            Some(_) => Err(TransportError::invalid_args(format!("{handle} is not a message"))),
            None => Err(TransportError::unknown_handle(handle)),
        }
    }

    fn message_mut(&mut self, handle: NativeHandle) -> Result<&mut MessageState, TransportError> {
        match self.entities.get_mut(&handle).map(|slot| &mut slot.entity) {
            Some(Entity::Message(message)) => Ok(message),
            Some(_) => Err(TransportError::invalid_args(format!("{handle} is not a message"))),
            None => Err(TransportError::unknown_handle(handle)),
        }
    }

    fn retain(&mut self, handle: NativeHandle) -> Result<(), TransportError> {
        let slot = self
            .entities
            .get_mut(&handle)
            .ok_or_else(|| TransportError::unknown_handle(handle))?;
        slot.refs += 1;
        Ok(())
    }

    /// Drops one reference. Objects reaching zero are removed along with
    /// the references they held, and are returned so the caller can drop
    /// them after releasing its borrow of the state.
    fn release(&mut self, handle: NativeHandle) -> Result<Vec<Entity>, TransportError> {
        let Some(slot) = self.entities.get_mut(&handle) else {
            self.release_faults += 1;
            return Err(TransportError::unknown_handle(handle));
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return Ok(Vec::new());
        }

        let mut freed = Vec::new();
        let mut doomed = vec![handle];
        while let Some(handle) = doomed.pop() {
            let Some(slot) = self.entities.remove(&handle) else {
                continue;
            };
            match &slot.entity {
                Entity::Connection(conn) => {
                    for child in conn.incoming.iter().chain(conn.outgoing.iter()) {
                        if self.drop_ref(*child) {
                            doomed.push(*child);
                        }
                    }
                    if conn.shared {
                        if let Some(bus) = conn.bus {
                            self.buses.remove(&bus);
                        }
                    }
                    if let Some(peer) = conn.peer {
                        if let Ok(peer) = self.connection_mut(peer) {
                            peer.peer = None;
                            peer.connected = false;
                        }
                    }
                }
                Entity::Server(server) => {
                    if self.listeners.get(&server.key) == Some(&handle) {
                        self.listeners.remove(&server.key);
                    }
                    for child in &server.pending {
                        if self.drop_ref(*child) {
                            doomed.push(*child);
                        }
                    }
                }
                Entity::Message(_) => {}
            }
            log::trace!("loopback: freed {handle}");
            freed.push(slot.entity);
        }
        Ok(freed)
    }

    /// Decrements without freeing; returns true when the count hit zero.
    fn drop_ref(&mut self, handle: NativeHandle) -> bool {
        match self.entities.get_mut(&handle) {
            Some(slot) => {
                slot.refs = slot.refs.saturating_sub(1);
                slot.refs == 0
            }
            None => false,
        }
    }

    fn recipients(&self, sender: NativeHandle, header: &MessageHeader) -> Vec<NativeHandle> {
        let Ok(source) = self.connection(sender) else {
            return Vec::new();
        };
        if let Some(peer) = source.peer {
            let reachable = self.connection(peer).is_ok_and(|conn| conn.connected);
            return if reachable { vec![peer] } else { Vec::new() };
        }
        let Some(bus) = source.bus else {
            return Vec::new();
        };

        let mut recipients: Vec<NativeHandle> = self
            .entities
            .iter()
            .filter_map(|(handle, slot)| match &slot.entity {
                Entity::Connection(conn) if conn.bus == Some(bus) && conn.connected => {
                    let addressed =
                        header.destination.is_some() && conn.unique_name == header.destination;
                    let subscribed = *handle != sender
                        && conn.rules.iter().any(|(_, rule)| rule.matches(header));
                    (addressed || subscribed).then_some(*handle)
                }
                _ => None,
            })
            .collect();
        recipients.sort();
        recipients
    }

    /// Moves everything queued on `conn` to its recipients.
    fn deliver(&mut self, conn: NativeHandle) -> Result<(), TransportError> {
        let outgoing: Vec<NativeHandle> = self.connection_mut(conn)?.outgoing.drain(..).collect();
        for message in outgoing {
            let (header, error_message) = match self.message(message) {
                Ok(state) => (state.header.clone(), state.error_message.clone()),
                Err(_) => continue,
            };
            let recipients = self.recipients(conn, &header);
            log::trace!("loopback: {message} from {conn} -> {} recipient(s)", recipients.len());
            for recipient in recipients {
                let copy = self.allocate(Entity::Message(MessageState {
                    header: header.clone(),
                    error_message: error_message.clone(),
                }));
                if let Ok(target) = self.connection_mut(recipient) {
                    target.incoming.push_back(copy);
                }
            }
            self.release(message)?;
        }
        Ok(())
    }

    fn disconnect(&mut self, conn: NativeHandle) -> Result<(), TransportError> {
        let connection = self.connection_mut(conn)?;
        if !connection.connected {
            return Ok(());
        }
        connection.connected = false;
        let peer = connection.peer.take();
        let outgoing: Vec<NativeHandle> = connection.outgoing.drain(..).collect();
        if let Some(peer) = peer {
            if let Ok(peer) = self.connection_mut(peer) {
                peer.peer = None;
                peer.connected = false;
            }
        }
        for message in outgoing {
            self.release(message)?;
        }
        Ok(())
    }
}

/// Splits a server address into its transport and key/value pairs and
/// returns the canonical spelling used to match listeners. `guid` is not
/// part of the identity of an address.
fn normalize_address(address: &str) -> Result<String, TransportError> {
    let (method, params) = address.split_once(':').ok_or_else(|| {
        TransportError::bad_address(format!("address '{address}' has no transport prefix"))
    })?;

    let mut pairs: Vec<(&str, &str)> = Vec::new();
    for pair in params.split(',').filter(|pair| !pair.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                if key != "guid" {
                    pairs.push((key, value));
                }
            }
            _ => {
                return Err(TransportError::bad_address(format!(
                    "malformed parameter '{pair}' in address '{address}'"
                )))
            }
        }
    }

    let has = |wanted: &str| pairs.iter().any(|(key, _)| *key == wanted);
    let valid = match method {
        "unix" => pairs.len() == 1 && (has("path") || has("abstract")),
        "tcp" => {
            has("host")
                && pairs.iter().any(|(key, value)| *key == "port" && value.parse::<u16>().is_ok())
                && pairs.iter().all(|(key, _)| matches!(*key, "host" | "port" | "family"))
        }
        _ => false,
    };
    if !valid {
        return Err(TransportError::bad_address(format!("unsupported address '{address}'")));
    }

    pairs.sort_unstable();
    let params: Vec<String> = pairs.iter().map(|(key, value)| format!("{key}={value}")).collect();
    Ok(format!("{method}:{}", params.join(",")))
}

/// In-memory bus. See the module docs for routing rules.
pub struct LoopbackTransport {
    state: RefCell<LoopbackState>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self { state: RefCell::new(LoopbackState::new()) }
    }

    // ── Inspection helpers ────────────────────────────────────────────────

    /// Current reference count, or `None` once the object has been freed.
    pub fn ref_count(&self, handle: NativeHandle) -> Option<usize> {
        self.state.borrow().entities.get(&handle).map(|slot| slot.refs)
    }

    /// Number of `release` calls that named no live object.
    pub fn release_faults(&self) -> usize {
        self.state.borrow().release_faults
    }

    pub fn live_entities(&self) -> usize {
        self.state.borrow().entities.len()
    }

    pub fn has_filter_hook(&self, conn: NativeHandle) -> bool {
        self.state.borrow().connection(conn).is_ok_and(|conn| conn.hook.is_some())
    }

    /// Rules registered on a bus connection, in registration order.
    pub fn match_rules(&self, conn: NativeHandle) -> Vec<String> {
        self.state
            .borrow()
            .connection(conn)
            .map(|conn| conn.rules.iter().map(|(text, _)| text.clone()).collect())
            .unwrap_or_default()
    }

    pub fn incoming_len(&self, conn: NativeHandle) -> usize {
        self.state.borrow().connection(conn).map_or(0, |conn| conn.incoming.len())
    }

    /// Text attached by `message_new_error`.
    pub fn error_message(&self, msg: NativeHandle) -> Option<String> {
        self.state.borrow().message(msg).ok().and_then(|message| message.error_message.clone())
    }

    // ── Test drivers ──────────────────────────────────────────────────────

    /// Places a message with `header` directly into the incoming queue of
    /// `conn`, as if the transport had read it. The queue owns the message.
    pub fn inject(
        &self,
        conn: NativeHandle,
        header: MessageHeader,
    ) -> Result<NativeHandle, TransportError> {
        let mut state = self.state.borrow_mut();
        state.connection(conn)?;
        let message = state.allocate(Entity::Message(MessageState::new(header)));
        state.connection_mut(conn)?.incoming.push_back(message);
        Ok(message)
    }

    /// Opens a private (non-shared) connection to `bus`. The caller owns it.
    pub fn open_bus_peer(&self, bus: BusType) -> NativeHandle {
        let handle = self.state.borrow_mut().new_bus_connection(bus, false);
        log::debug!("loopback: opened private {bus} connection {handle}");
        handle
    }

    fn new_message(
        &self,
        state: MessageState,
    ) -> Result<NativeHandle, TransportError> {
        Ok(self.state.borrow_mut().allocate(Entity::Message(state)))
    }

    fn reply_to(
        &self,
        call: NativeHandle,
        msg_type: MessageType,
    ) -> Result<MessageHeader, TransportError> {
        let state = self.state.borrow();
        let call = &state.message(call)?.header;
        Ok(MessageHeader {
            reply_serial: (call.serial != 0).then_some(call.serial),
            destination: call.sender.clone(),
            ..MessageHeader::new(msg_type)
        })
    }
}

impl Transport for LoopbackTransport {
    fn bus_get(&self, bus: BusType) -> Result<NativeHandle, TransportError> {
        let mut state = self.state.borrow_mut();
        if let Some(&handle) = state.buses.get(&bus) {
            state.retain(handle)?;
            return Ok(handle);
        }
        let handle = state.new_bus_connection(bus, true);
        state.buses.insert(bus, handle);
        log::debug!("loopback: connected to {bus} bus as {handle}");
        Ok(handle)
    }

    fn connection_open(&self, address: &str) -> Result<NativeHandle, TransportError> {
        let key = normalize_address(address)?;
        let mut state = self.state.borrow_mut();
        let server = *state
            .listeners
            .get(&key)
            .ok_or_else(|| TransportError::no_server(address))?;
        let server_id = state.server(server)?.id.clone();

        let client = state.allocate(Entity::Connection(ConnectionState::new(server_id.clone())));
        let accepted = state.allocate(Entity::Connection(ConnectionState::new(server_id)));
        state.connection_mut(client)?.peer = Some(accepted);
        state.connection_mut(accepted)?.peer = Some(client);
        state.server_mut(server)?.pending.push_back(accepted);
        log::debug!("loopback: {client} connected to {key} (server side {accepted})");
        Ok(client)
    }

    fn server_listen(&self, address: &str) -> Result<NativeHandle, TransportError> {
        let key = normalize_address(address)?;
        let mut state = self.state.borrow_mut();
        if state.listeners.contains_key(&key) {
            return Err(TransportError::address_in_use(address));
        }
        let id = state.guid();
        let handle = state.allocate(Entity::Server(ServerState {
            key: key.clone(),
            id,
            listening: true,
            pending: VecDeque::new(),
        }));
        state.listeners.insert(key, handle);
        Ok(handle)
    }

    fn message_new(&self, msg_type: MessageType) -> Result<NativeHandle, TransportError> {
        if msg_type == MessageType::Invalid {
            return Err(TransportError::invalid_args("cannot create a message of invalid type"));
        }
        self.new_message(MessageState::new(MessageHeader::new(msg_type)))
    }

    fn message_new_method_call(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        method: &str,
    ) -> Result<NativeHandle, TransportError> {
        let header = MessageHeader::method_call(destination, path, interface, method);
        self.new_message(MessageState::new(header))
    }

    fn message_new_method_return(
        &self,
        call: NativeHandle,
    ) -> Result<NativeHandle, TransportError> {
        let header = self.reply_to(call, MessageType::MethodReturn)?;
        self.new_message(MessageState::new(header))
    }

    fn message_new_signal(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<NativeHandle, TransportError> {
        self.new_message(MessageState::new(MessageHeader::signal(path, interface, name)))
    }

    fn message_new_error(
        &self,
        reply_to: NativeHandle,
        error_name: &str,
        error_message: Option<&str>,
    ) -> Result<NativeHandle, TransportError> {
        let header = MessageHeader {
            error_name: Some(error_name.to_string()),
            ..self.reply_to(reply_to, MessageType::Error)?
        };
        self.new_message(MessageState {
            header,
            error_message: error_message.map(str::to_string),
        })
    }

    fn retain(&self, handle: NativeHandle) -> Result<(), TransportError> {
        self.state.borrow_mut().retain(handle)
    }

    fn release(&self, handle: NativeHandle) -> Result<(), TransportError> {
        let freed = self.state.borrow_mut().release(handle)?;
        // Freed connections may own filter hooks; drop them outside the borrow.
        drop(freed);
        Ok(())
    }

    fn connection_close(&self, conn: NativeHandle) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if state.connection(conn)?.shared {
            return Err(TransportError::failed(
                "applications must not close shared bus connections",
            ));
        }
        state.disconnect(conn)?;
        log::debug!("loopback: closed {conn}");
        Ok(())
    }

    fn is_connected(&self, conn: NativeHandle) -> bool {
        self.state.borrow().connection(conn).is_ok_and(|conn| conn.connected)
    }

    fn is_authenticated(&self, conn: NativeHandle) -> bool {
        self.is_connected(conn)
    }

    fn is_anonymous(&self, _conn: NativeHandle) -> bool {
        // Every loopback connection authenticates as the local user.
        false
    }

    fn server_id(&self, conn: NativeHandle) -> Option<String> {
        self.state.borrow().connection(conn).ok().map(|conn| conn.server_id.clone())
    }

    fn unique_name(&self, conn: NativeHandle) -> Option<String> {
        self.state.borrow().connection(conn).ok().and_then(|conn| conn.unique_name.clone())
    }

    fn flush(&self, conn: NativeHandle) -> Result<(), TransportError> {
        self.state.borrow_mut().deliver(conn)
    }

    fn dispatch_status(&self, conn: NativeHandle) -> Result<DispatchStatus, TransportError> {
        Ok(self.state.borrow().connection(conn)?.status())
    }

    fn dispatch(&self, conn: NativeHandle) -> Result<DispatchStatus, TransportError> {
        let (message, hook) = {
            let mut state = self.state.borrow_mut();
            let connection = state.connection_mut(conn)?;
            if connection.borrowed.is_some() {
                return Err(TransportError::failed("cannot dispatch while a message is borrowed"));
            }
            let Some(message) = connection.incoming.pop_front() else {
                return Ok(DispatchStatus::Complete);
            };
            (message, connection.hook.clone())
        };

        let verdict = match hook {
            Some(hook) => hook(conn, message),
            None => HandlerResult::NotYetHandled,
        };
        log::trace!("loopback: dispatched {message} on {conn}: {verdict}");

        let mut state = self.state.borrow_mut();
        if verdict == HandlerResult::NeedMemory {
            if let Ok(connection) = state.connection_mut(conn) {
                connection.incoming.push_front(message);
                return Ok(DispatchStatus::NeedMemory);
            }
        }
        state.release(message)?;
        Ok(state.connection(conn).map_or(DispatchStatus::Complete, ConnectionState::status))
    }

    fn pop_message(&self, conn: NativeHandle) -> Result<Option<NativeHandle>, TransportError> {
        let mut state = self.state.borrow_mut();
        let connection = state.connection_mut(conn)?;
        if connection.borrowed.is_some() {
            return Err(TransportError::failed("cannot pop while a message is borrowed"));
        }
        Ok(connection.incoming.pop_front())
    }

    fn borrow_message(&self, conn: NativeHandle) -> Result<Option<NativeHandle>, TransportError> {
        let mut state = self.state.borrow_mut();
        let connection = state.connection_mut(conn)?;
        if connection.borrowed.is_some() {
            return Err(TransportError::failed("a message is already borrowed"));
        }
        connection.borrowed = connection.incoming.front().copied();
        Ok(connection.borrowed)
    }

    fn return_message(&self, conn: NativeHandle, msg: NativeHandle) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let connection = state.connection_mut(conn)?;
        if connection.borrowed != Some(msg) {
            return Err(TransportError::failed(format!("{msg} is not the borrowed message")));
        }
        connection.borrowed = None;
        Ok(())
    }

    fn steal_borrowed_message(
        &self,
        conn: NativeHandle,
        msg: NativeHandle,
    ) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let connection = state.connection_mut(conn)?;
        if connection.borrowed != Some(msg) {
            return Err(TransportError::failed(format!("{msg} is not the borrowed message")));
        }
        connection.borrowed = None;
        connection.incoming.pop_front();
        Ok(())
    }

    fn send(&self, conn: NativeHandle, msg: NativeHandle) -> Result<u32, TransportError> {
        let mut state = self.state.borrow_mut();
        let connection = state.connection(conn)?;
        if !connection.connected {
            return Err(TransportError::disconnected(format!("{conn} is not connected")));
        }
        let sender = connection.unique_name.clone();
        state.message(msg)?;

        state.last_serial = state.last_serial.wrapping_add(1).max(1);
        let serial = state.last_serial;
        let header = &mut state.message_mut(msg)?.header;
        header.serial = serial;
        if sender.is_some() {
            header.sender = sender;
        }
        state.retain(msg)?;
        state.connection_mut(conn)?.outgoing.push_back(msg);
        Ok(serial)
    }

    fn read_write(&self, conn: NativeHandle, _timeout_ms: i32) -> Result<bool, TransportError> {
        let mut state = self.state.borrow_mut();
        if !state.connection(conn)?.connected {
            return Ok(false);
        }
        state.deliver(conn)?;
        Ok(true)
    }

    fn read_write_dispatch(
        &self,
        conn: NativeHandle,
        timeout_ms: i32,
    ) -> Result<bool, TransportError> {
        self.read_write(conn, timeout_ms)?;
        if self.dispatch_status(conn)? == DispatchStatus::DataRemains {
            self.dispatch(conn)?;
        }
        Ok(self.is_connected(conn))
    }

    fn set_filter_hook(
        &self,
        conn: NativeHandle,
        hook: Option<FilterHook>,
    ) -> Result<(), TransportError> {
        let previous = {
            let mut state = self.state.borrow_mut();
            std::mem::replace(&mut state.connection_mut(conn)?.hook, hook)
        };
        drop(previous);
        Ok(())
    }

    fn add_match(&self, conn: NativeHandle, rule: &str) -> Result<(), TransportError> {
        let parsed =
            MatchRule::parse(rule).map_err(|err| TransportError::match_rule_invalid(err.to_string()))?;
        let mut state = self.state.borrow_mut();
        let connection = state.connection_mut(conn)?;
        if connection.bus.is_none() {
            return Err(TransportError::failed(format!("{conn} is not a bus connection")));
        }
        connection.rules.push((rule.to_string(), parsed));
        Ok(())
    }

    fn remove_match(&self, conn: NativeHandle, rule: &str) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let connection = state.connection_mut(conn)?;
        let position = connection
            .rules
            .iter()
            .position(|(text, _)| text == rule)
            .ok_or_else(|| TransportError::match_rule_not_found(rule))?;
        connection.rules.remove(position);
        Ok(())
    }

    fn server_disconnect(&self, server: NativeHandle) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let listener = state.server_mut(server)?;
        listener.listening = false;
        let key = listener.key.clone();
        if state.listeners.get(&key) == Some(&server) {
            state.listeners.remove(&key);
        }
        Ok(())
    }

    fn server_is_connected(&self, server: NativeHandle) -> bool {
        self.state.borrow().server(server).is_ok_and(|server| server.listening)
    }

    fn server_address(&self, server: NativeHandle) -> Option<String> {
        self.state
            .borrow()
            .server(server)
            .ok()
            .map(|server| format!("{},guid={}", server.key, server.id))
    }

    fn server_accept(&self, server: NativeHandle) -> Result<Option<NativeHandle>, TransportError> {
        Ok(self.state.borrow_mut().server_mut(server)?.pending.pop_front())
    }

    fn message_header(&self, msg: NativeHandle) -> Result<MessageHeader, TransportError> {
        Ok(self.state.borrow().message(msg)?.header.clone())
    }
}
