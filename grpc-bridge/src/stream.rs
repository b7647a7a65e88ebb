//! [`RpcStream`] - one engine call bound to one host stream.
//!
//! Inbound frames arrive from the host through [`StreamEvents`], are
//! deframed and handed to the engine's [`StreamListener`] as it requests
//! them. Outbound writes arrive from the engine through [`StreamSink`] and
//! become host header, data and trailer writes.
//!
//! ```text
//! Created -> Active -> HalfClosedRemote | HalfClosedLocal -> Closed
//!     \__________________________________________________/
//!                          cancel -> Cancelled
//! ```

mod gate;
mod state;

pub use gate::InboundGate;
pub use state::Phase;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use grpc_bridge_core::{
    BoxedCodec, DeframeError, Metadata, MessageDeframer, ReadableBuffer, Status, WritableBuffer,
    WritableBufferAllocator,
};

use crate::bindings::StreamBindings;
use crate::buffer::{PooledBufferAllocator, PooledReadableBuffer};
use crate::config::ServerConfig;
use crate::engine::{StreamListener, StreamSink};
use crate::error::{BridgeError, HostError};
use crate::host::{BufferPool, ConnectionId, HostStream, PooledBuffer, StreamEvents, StreamId};
use crate::metadata::{response_headers, response_trailers, trailers_only};
use state::StreamState;

/// The bridge's per-stream object: the engine's sink and the host's event target.
pub struct RpcStream {
    host: Arc<dyn HostStream>,
    connection: ConnectionId,
    id: StreamId,
    method: OnceLock<String>,
    allocator: Arc<dyn WritableBufferAllocator>,
    state: StreamState,
    gate_timeout: Option<Duration>,
    bindings: OnceLock<Weak<StreamBindings>>,
}

impl RpcStream {
    /// Bind a new stream to `host`, using `pool` for outbound frames.
    pub fn new(host: Arc<dyn HostStream>, pool: Arc<dyn BufferPool>, config: &ServerConfig) -> Self {
        let deframer = MessageDeframer::new(Some(config.max_inbound_message_size()));
        Self {
            connection: host.connection_id(),
            id: host.id(),
            host,
            method: OnceLock::new(),
            allocator: Arc::new(PooledBufferAllocator::new(pool)),
            state: StreamState::new(deframer),
            gate_timeout: config.inbound_gate_timeout(),
            bindings: OnceLock::new(),
        }
    }

    /// Full method name this stream was opened for.
    pub fn with_method(self, method: impl Into<String>) -> Self {
        let _ = self.method.set(method.into());
        self
    }

    /// Decompressor for inbound messages flagged as compressed.
    pub fn with_decompressor(self, codec: Option<BoxedCodec>) -> Self {
        self.state.with_deframer(|deframer| deframer.set_decompressor(codec));
        self
    }

    pub(crate) fn with_bindings(self, bindings: &Arc<StreamBindings>) -> Self {
        let _ = self.bindings.set(Arc::downgrade(bindings));
        self
    }

    /// Host stream id, unique within its connection.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Connection carrying this stream.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Full method name without the leading `/`, or empty if not set.
    pub fn method(&self) -> &str {
        self.method.get().map_or("", String::as_str)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Bytes handed to the host as data frames, for flow-control accounting.
    pub fn outbound_bytes(&self) -> u64 {
        self.state.outbound_bytes()
    }

    /// Messages carried by those data frames, as reported by the engine.
    pub fn outbound_messages(&self) -> u64 {
        self.state.outbound_messages()
    }

    /// Deliver whatever the listener may now receive, failing the stream on a
    /// deframe error.
    fn deliver(&self) -> Result<(), Status> {
        match self.state.deliver() {
            Ok(true) => {
                self.finish(&Status::ok());
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(self.deframe_failed(e)),
        }
    }

    fn deframe_failed(&self, error: DeframeError) -> Status {
        let status = error.to_status();
        tracing::debug!(
            connection = %self.connection,
            stream_id = self.id,
            method = self.method(),
            error = %error,
            "failed to deframe inbound data, cancelling stream"
        );
        self.terminate(&status, true);
        status
    }

    /// Enter `Cancelled`, reset the host stream when asked, and report `status`.
    fn terminate(&self, status: &Status, reset_host: bool) {
        if !self.state.cancel() {
            return;
        }
        self.state.gate.abandon();
        if reset_host && let Err(e) = self.host.cancel(status.code().value()) {
            tracing::debug!(
                connection = %self.connection,
                stream_id = self.id,
                error = %e,
                "failed to reset host stream"
            );
        }
        self.report_closed(status);
        self.unbind();
    }

    /// The stream reached `Closed` through both half-closes.
    fn finish(&self, status: &Status) {
        self.state.gate.abandon();
        self.report_closed(status);
        self.unbind();
    }

    fn report_closed(&self, status: &Status) {
        if let Some((listener, status)) = self.state.record_close(status) {
            listener.closed(&status);
        }
    }

    fn unbind(&self) {
        if let Some(bindings) = self.bindings.get().and_then(Weak::upgrade) {
            bindings.unbind(self.connection, self.id);
        }
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.state.is_terminal() {
            return Err(BridgeError::StreamTerminated { stream_id: self.id });
        }
        Ok(())
    }

    fn write_failed(&self, what: &'static str, error: HostError) -> BridgeError {
        tracing::warn!(
            connection = %self.connection,
            stream_id = self.id,
            write = what,
            error = %error,
            "host write failed"
        );
        error.into()
    }
}

impl StreamSink for RpcStream {
    fn stream_id(&self) -> StreamId {
        self.id
    }

    fn authority(&self) -> Option<String> {
        self.host.authority()
    }

    fn set_listener(&self, listener: Arc<dyn StreamListener>) {
        if let Some((listener, status)) = self.state.set_listener(listener) {
            tracing::debug!(
                connection = %self.connection,
                stream_id = self.id,
                status = %status,
                "stream ended before its listener was installed"
            );
            listener.closed(&status);
            return;
        }
        // Deliver anything requested before the listener was installed.
        let _ = self.deliver();
    }

    fn allocator(&self) -> Arc<dyn WritableBufferAllocator> {
        self.allocator.clone()
    }

    fn request(&self, n: u32) -> BoxFuture<'_, Result<(), BridgeError>> {
        Box::pin(async move {
            if let Err(e) = self.state.gate.wait(self.gate_timeout).await {
                tracing::debug!(
                    connection = %self.connection,
                    stream_id = self.id,
                    requested = n,
                    error = %e,
                    "request abandoned before the first inbound frame"
                );
                return Err(e.into());
            }
            if self.state.is_terminal() {
                return Ok(());
            }
            self.state.with_deframer(|deframer| deframer.request(n));
            self.deliver().map_err(BridgeError::Status)
        })
    }

    fn write_headers(&self, headers: Metadata) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.host
            .write_headers(response_headers(headers), false)
            .map_err(|e| self.write_failed("headers", e))
    }

    fn write_frame(
        &self,
        frame: Option<Box<dyn WritableBuffer>>,
        _flush: bool,
        num_messages: u32,
    ) -> Result<(), BridgeError> {
        let Some(mut frame) = frame else {
            return Ok(());
        };
        if let Err(e) = self.ensure_open() {
            frame.release();
            return Err(e);
        }

        let data = Bytes::copy_from_slice(frame.written());
        frame.release();
        self.state.record_outbound(data.len(), num_messages);
        self.host
            .write_data(data, false)
            .map_err(|e| self.write_failed("data", e))
    }

    fn write_trailers(
        &self,
        trailers: Option<Metadata>,
        headers_sent: bool,
        status: &Status,
    ) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let Some(mut block) = response_trailers(trailers, status) else {
            tracing::debug!(
                connection = %self.connection,
                stream_id = self.id,
                "no trailers to write"
            );
            return Ok(());
        };
        if !headers_sent {
            block = trailers_only(block);
        }
        self.host
            .write_trailers(block)
            .map_err(|e| self.write_failed("trailers", e))?;

        if self.state.half_close(true) {
            self.finish(status);
        }
        Ok(())
    }

    fn cancel(&self, status: &Status) {
        tracing::debug!(
            connection = %self.connection,
            stream_id = self.id,
            status = %status,
            "stream cancelled by engine"
        );
        self.terminate(status, true);
    }
}

impl StreamEvents for RpcStream {
    fn on_data(&self, data: PooledBuffer, end_of_stream: bool) {
        self.state.gate.open();
        let mut buffer = PooledReadableBuffer::new(data);

        if self.state.is_terminal() {
            tracing::debug!(
                connection = %self.connection,
                stream_id = self.id,
                bytes = buffer.readable_bytes(),
                "inbound frame after stream ended, dropped"
            );
            buffer.close();
            return;
        }
        self.state.activate();

        let deframed = self
            .state
            .with_deframer(|deframer| deframer.deframe(Box::new(buffer), end_of_stream));
        match deframed {
            Ok(()) => {
                let _ = self.deliver();
            }
            Err(e) => {
                self.deframe_failed(e);
            }
        }
    }

    fn on_closed(&self, reset_code: Option<u32>) {
        let status = match (reset_code, self.state.phase()) {
            (None, Phase::HalfClosedLocal | Phase::Closed) => Status::ok(),
            (None, _) => Status::cancelled("stream closed before the call completed"),
            (Some(code), _) => Status::cancelled(format!("stream reset with code {code}")),
        };
        tracing::debug!(
            connection = %self.connection,
            stream_id = self.id,
            reset_code = ?reset_code,
            status = %status,
            "host stream closed"
        );

        if status.is_ok() {
            self.state.close();
            self.finish(&status);
        } else {
            self.terminate(&status, false);
        }
    }
}
