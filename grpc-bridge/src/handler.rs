//! [`ConnectionHandler`] - the bridge's content handler on the host.
//!
//! The host dispatches every new `application/grpc` stream here. The handler
//! admits it, binds an [`RpcStream`] to it and announces the call to the
//! engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use grpc_bridge_core::{GRPC_ENCODING_HEADER, IDENTITY_ENCODING, Status, codec_for_encoding};

use crate::bindings::{BindRefusal, StreamBindings};
use crate::config::ServerConfig;
use crate::engine::{ServerTransportListener, StreamSink};
use crate::host::{
    BufferPool, ConnectionId, ContentHandler, HostStream, RequestHead, StreamEvents, StreamId,
};
use crate::metadata::{GRPC_CONTENT_TYPE, metadata_from_headers};
use crate::stream::RpcStream;

/// The bridge's content handler for `application/grpc` streams.
///
/// Each admitted host stream becomes an [`RpcStream`] that is bound under
/// `(connection, stream id)` until it ends, and announced to the engine's
/// transport listener.
pub struct ConnectionHandler {
    listener: Arc<dyn ServerTransportListener>,
    config: Arc<ServerConfig>,
    pool: Arc<dyn BufferPool>,
    bindings: Arc<StreamBindings>,
    accepting: AtomicBool,
}

impl ConnectionHandler {
    pub fn new(
        listener: Arc<dyn ServerTransportListener>,
        config: Arc<ServerConfig>,
        pool: Arc<dyn BufferPool>,
    ) -> Self {
        Self {
            listener,
            config,
            pool,
            bindings: Arc::new(StreamBindings::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Number of live streams across all connections.
    pub fn active_streams(&self) -> usize {
        self.bindings.len()
    }

    /// Live streams on one connection.
    pub fn active_streams_on(&self, connection: ConnectionId) -> u32 {
        self.bindings.active_on(connection)
    }

    pub fn stream(&self, connection: ConnectionId, id: StreamId) -> Option<Arc<RpcStream>> {
        self.bindings.get(connection, id)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Refuse new streams and tell the engine the transport is gone.
    /// Returns true on the first call.
    pub fn shutdown(&self) -> bool {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.listener.transport_terminated();
        true
    }

    /// Cancel every live stream with `status`.
    pub fn cancel_all(&self, status: &Status) -> usize {
        let streams = self.bindings.drain();
        for stream in &streams {
            stream.cancel(status);
        }
        streams.len()
    }

    fn refuse(&self, stream: &dyn HostStream, status: Status) -> Option<Arc<dyn StreamEvents>> {
        tracing::debug!(
            connection = %stream.connection_id(),
            stream_id = stream.id(),
            status = %status,
            "refusing stream"
        );
        if let Err(e) = stream.cancel(status.code().value()) {
            tracing::debug!(stream_id = stream.id(), error = %e, "failed to reset refused stream");
        }
        None
    }
}

impl ContentHandler for ConnectionHandler {
    fn content_type(&self) -> &str {
        GRPC_CONTENT_TYPE
    }

    fn connection_settings(&self) -> &ServerConfig {
        &self.config
    }

    fn on_new_stream(
        &self,
        stream: Arc<dyn HostStream>,
        head: RequestHead,
    ) -> Option<Arc<dyn StreamEvents>> {
        if !self.is_accepting() {
            return self.refuse(stream.as_ref(), Status::unavailable("server is shutting down"));
        }

        let header_size = head.headers.encoded_size();
        let max_header_size = self.config.max_header_list_size() as usize;
        if header_size > max_header_size {
            return self.refuse(
                stream.as_ref(),
                Status::resource_exhausted(format!(
                    "header list of {header_size} bytes exceeds limit of {max_header_size} bytes"
                )),
            );
        }

        let decompressor = match head.headers.get_str(GRPC_ENCODING_HEADER) {
            None | Some(IDENTITY_ENCODING) => None,
            Some(encoding) => match codec_for_encoding(encoding) {
                Some(codec) => Some(codec),
                None => {
                    return self.refuse(
                        stream.as_ref(),
                        Status::unimplemented(format!("unsupported grpc-encoding {encoding:?}")),
                    );
                }
            },
        };

        let path = head.uri.path();
        let method = path.strip_prefix('/').unwrap_or(path).to_owned();
        let metadata = metadata_from_headers(&head.headers);

        let rpc = Arc::new(
            RpcStream::new(stream.clone(), self.pool.clone(), &self.config)
                .with_method(method.clone())
                .with_decompressor(decompressor)
                .with_bindings(&self.bindings),
        );
        match self
            .bindings
            .bind(rpc.clone(), self.config.max_concurrent_calls_per_connection())
        {
            Ok(()) => {}
            Err(BindRefusal::ConnectionFull { limit }) => {
                return self.refuse(
                    stream.as_ref(),
                    Status::resource_exhausted(format!(
                        "connection is at its limit of {limit} concurrent calls"
                    )),
                );
            }
            Err(BindRefusal::Duplicate) => {
                tracing::warn!(
                    connection = %rpc.connection_id(),
                    stream_id = rpc.id(),
                    "host dispatched a stream id that is already bound"
                );
                return self.refuse(stream.as_ref(), Status::internal("duplicate stream id"));
            }
        }

        tracing::debug!(
            connection = %rpc.connection_id(),
            stream_id = rpc.id(),
            method = %method,
            "stream created"
        );
        self.listener.stream_created(rpc.clone(), &method, metadata);
        Some(rpc)
    }

    fn on_connection_closed(&self, connection: ConnectionId) {
        let streams = self.bindings.drain_connection(connection);
        tracing::debug!(
            connection = %connection,
            streams = streams.len(),
            "connection closed"
        );
        for stream in streams {
            stream.on_closed(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HeaderList, PooledBuffer};
    use crate::stream::Phase;
    use crate::testing::{CountingPool, HostWrite, RecordingHostStream, RecordingTransportListener};
    use grpc_bridge_core::{Code, MetadataValue, encode_frame};
    use http::{Method, Uri};

    fn handler(config: ServerConfig) -> (ConnectionHandler, Arc<RecordingTransportListener>, Arc<CountingPool>) {
        let listener = Arc::new(RecordingTransportListener::default());
        let pool = Arc::new(CountingPool::new());
        let handler = ConnectionHandler::new(listener.clone(), Arc::new(config), pool.clone());
        (handler, listener, pool)
    }

    fn head(path: &str, headers: HeaderList) -> RequestHead {
        RequestHead {
            method: Method::POST,
            uri: Uri::try_from(path).unwrap(),
            headers,
        }
    }

    fn open(
        handler: &ConnectionHandler,
        connection: u64,
        id: StreamId,
        headers: HeaderList,
    ) -> (Arc<RecordingHostStream>, Option<Arc<dyn StreamEvents>>) {
        let host = Arc::new(RecordingHostStream::new(ConnectionId(connection), id));
        let events = handler.on_new_stream(host.clone(), head("/orders.Orders/Get", headers));
        (host, events)
    }

    #[test]
    fn test_new_stream_announced_to_engine() {
        let (handler, listener, _) = handler(ServerConfig::default());
        let headers = HeaderList::new()
            .with("content-type", "application/grpc")
            .with("trace-bin", vec![1u8, 2]);
        let (_, events) = open(&handler, 1, 1, headers);

        assert!(events.is_some());
        assert_eq!(handler.active_streams(), 1);
        let calls = listener.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "orders.Orders/Get");
        assert!(matches!(
            calls[0].headers.get("trace-bin"),
            Some(MetadataValue::Binary(b)) if b[..] == [1, 2]
        ));
    }

    #[test]
    fn test_concurrent_call_limit_refuses_with_resource_exhausted() {
        let config = crate::GrpcServerBuilder::new()
            .max_concurrent_calls_per_connection(1)
            .unwrap()
            .config()
            .clone();
        let (handler, listener, _) = handler(config);
        let (_, first) = open(&handler, 1, 1, HeaderList::new());
        let (refused, second) = open(&handler, 1, 3, HeaderList::new());

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(refused.writes(), vec![HostWrite::Cancel(Code::ResourceExhausted.value())]);
        assert_eq!(listener.calls().len(), 1);
    }

    #[test]
    fn test_oversized_header_list_refused() {
        let config = crate::GrpcServerBuilder::new()
            .max_header_list_size(64)
            .unwrap()
            .config()
            .clone();
        let (handler, listener, _) = handler(config);
        let headers = HeaderList::new().with("x-large", vec![b'a'; 100]);
        let (host, events) = open(&handler, 1, 1, headers);

        assert!(events.is_none());
        assert_eq!(host.writes(), vec![HostWrite::Cancel(Code::ResourceExhausted.value())]);
        assert!(listener.calls().is_empty());
    }

    #[test]
    fn test_unknown_encoding_refused() {
        let (handler, _, _) = handler(ServerConfig::default());
        let headers = HeaderList::new().with("grpc-encoding", "snappy-9000");
        let (host, events) = open(&handler, 1, 1, headers);
        assert!(events.is_none());
        assert_eq!(host.writes(), vec![HostWrite::Cancel(Code::Unimplemented.value())]);
    }

    #[test]
    fn test_shutdown_refuses_new_streams() {
        let (handler, listener, _) = handler(ServerConfig::default());
        assert!(handler.shutdown());
        assert!(!handler.shutdown());
        assert_eq!(listener.terminations(), 1);

        let (host, events) = open(&handler, 1, 1, HeaderList::new());
        assert!(events.is_none());
        assert_eq!(host.writes(), vec![HostWrite::Cancel(Code::Unavailable.value())]);
    }

    #[test]
    fn test_deframe_failure_isolated_to_one_stream() {
        let config = crate::GrpcServerBuilder::new()
            .max_inbound_message_size(8)
            .config()
            .clone();
        let (handler, _, pool) = handler(config);
        let (bad_host, bad) = open(&handler, 1, 1, HeaderList::new());
        let (good_host, good) = open(&handler, 1, 3, HeaderList::new());

        let mut buf = pool.acquire(32).unwrap();
        buf.extend_from_slice(&encode_frame(&[0u8; 32], false));
        bad.unwrap().on_data(PooledBuffer::new(buf, pool.clone()), false);

        assert_eq!(bad_host.writes(), vec![HostWrite::Cancel(Code::ResourceExhausted.value())]);
        assert!(handler.stream(ConnectionId(1), 1).is_none());

        let sibling = handler.stream(ConnectionId(1), 3).unwrap();
        assert_eq!(sibling.phase(), Phase::Created);
        let mut ok = pool.acquire(8).unwrap();
        ok.extend_from_slice(&encode_frame(b"fine", false));
        good.unwrap().on_data(PooledBuffer::new(ok, pool.clone()), false);
        assert_eq!(sibling.phase(), Phase::Active);
        assert!(good_host.writes().is_empty());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_connection_close_cancels_only_that_connection() {
        let (handler, listener, _) = handler(ServerConfig::default());
        open(&handler, 1, 1, HeaderList::new());
        open(&handler, 2, 1, HeaderList::new());

        handler.on_connection_closed(ConnectionId(1));
        assert_eq!(handler.active_streams(), 1);
        assert_eq!(handler.active_streams_on(ConnectionId(2)), 1);
        let calls = listener.calls();
        assert_eq!(
            calls[0].listener.closed_status().map(|s| s.code()),
            Some(Code::Cancelled)
        );
        assert!(calls[1].listener.closed_status().is_none());
    }

    #[test]
    fn test_completed_stream_unbinds() {
        let (handler, _, _) = handler(ServerConfig::default());
        let (_, events) = open(&handler, 1, 1, HeaderList::new());
        let stream = handler.stream(ConnectionId(1), 1).unwrap();

        stream.cancel(&Status::cancelled("done"));
        assert_eq!(handler.active_streams(), 0);
        drop(events);
    }
}
