//! Live stream bindings of one connection handler.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::host::{ConnectionId, StreamId};
use crate::stream::RpcStream;

/// Why a stream could not be bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BindRefusal {
    /// The connection already carries the maximum number of calls.
    ConnectionFull { limit: u32 },
    /// A live stream already uses this id on the connection.
    Duplicate,
}

/// One binding per live `(connection, stream id)`, plus per-connection counts
/// for admission.
#[derive(Default)]
pub(crate) struct StreamBindings {
    streams: DashMap<(ConnectionId, StreamId), Arc<RpcStream>>,
    per_connection: DashMap<ConnectionId, u32>,
}

impl StreamBindings {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Bind `stream`, enforcing `limit` calls per connection.
    pub(crate) fn bind(&self, stream: Arc<RpcStream>, limit: Option<u32>) -> Result<(), BindRefusal> {
        let connection = stream.connection_id();
        let key = (connection, stream.id());

        // Count first; the connection entry guard serializes admission per connection.
        let mut count = self.per_connection.entry(connection).or_insert(0);
        match limit {
            Some(limit) if *count >= limit => return Err(BindRefusal::ConnectionFull { limit }),
            _ => {}
        }
        match self.streams.entry(key) {
            Entry::Occupied(_) => return Err(BindRefusal::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(stream);
            }
        }
        *count += 1;
        Ok(())
    }

    /// Remove a binding. Returns the stream if it was bound.
    pub(crate) fn unbind(&self, connection: ConnectionId, id: StreamId) -> Option<Arc<RpcStream>> {
        let (_, stream) = self.streams.remove(&(connection, id))?;
        if let Entry::Occupied(mut count) = self.per_connection.entry(connection) {
            *count.get_mut() = count.get().saturating_sub(1);
            if *count.get() == 0 {
                count.remove();
            }
        }
        Some(stream)
    }

    /// Unbind and return every stream on `connection`.
    pub(crate) fn drain_connection(&self, connection: ConnectionId) -> Vec<Arc<RpcStream>> {
        let keys: Vec<_> = self
            .streams
            .iter()
            .map(|entry| *entry.key())
            .filter(|(conn, _)| *conn == connection)
            .collect();
        self.unbind_all(keys)
    }

    /// Unbind and return every stream.
    pub(crate) fn drain(&self) -> Vec<Arc<RpcStream>> {
        let keys: Vec<_> = self.streams.iter().map(|entry| *entry.key()).collect();
        self.unbind_all(keys)
    }

    fn unbind_all(&self, keys: Vec<(ConnectionId, StreamId)>) -> Vec<Arc<RpcStream>> {
        keys.into_iter()
            .filter_map(|(connection, id)| self.unbind(connection, id))
            .collect()
    }

    pub(crate) fn get(&self, connection: ConnectionId, id: StreamId) -> Option<Arc<RpcStream>> {
        self.streams.get(&(connection, id)).map(|entry| entry.value().clone())
    }

    pub(crate) fn active_on(&self, connection: ConnectionId) -> u32 {
        self.per_connection.get(&connection).map_or(0, |count| *count)
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }
}
