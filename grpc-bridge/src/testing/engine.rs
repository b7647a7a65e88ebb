//! Engine-side doubles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use grpc_bridge_core::{Metadata, Status};

use super::lock;
use crate::engine::{
    BindableService, RpcEngine, ServerListener, ServerTransport, ServerTransportListener,
    StreamListener, StreamSink,
};

/// A service that only has a name.
#[derive(Clone, Debug)]
pub struct NamedService {
    name: String,
}

impl NamedService {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl BindableService for NamedService {
    fn service_name(&self) -> &str {
        &self.name
    }
}

/// Records what one stream delivered to the engine.
#[derive(Debug, Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<Bytes>>,
    half_closed: AtomicBool,
    closed: Mutex<Option<Status>>,
}

impl RecordingListener {
    pub fn messages(&self) -> Vec<Bytes> {
        lock(&self.messages).clone()
    }

    pub fn is_half_closed(&self) -> bool {
        self.half_closed.load(Ordering::SeqCst)
    }

    pub fn closed_status(&self) -> Option<Status> {
        lock(&self.closed).clone()
    }
}

impl StreamListener for RecordingListener {
    fn message_available(&self, message: Bytes) {
        lock(&self.messages).push(message);
    }

    fn half_closed(&self) {
        self.half_closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self, status: &Status) {
        *lock(&self.closed) = Some(status.clone());
    }
}

/// A call announced through [`ServerTransportListener::stream_created`].
#[derive(Clone)]
pub struct CreatedCall {
    pub stream: Arc<dyn StreamSink>,
    pub method: String,
    pub headers: Metadata,
    pub listener: Arc<RecordingListener>,
}

/// Installs a [`RecordingListener`] on every created stream.
#[derive(Default)]
pub struct RecordingTransportListener {
    calls: Mutex<Vec<CreatedCall>>,
    terminations: AtomicUsize,
}

impl RecordingTransportListener {
    pub fn calls(&self) -> Vec<CreatedCall> {
        lock(&self.calls).clone()
    }

    /// How many times the transport reported termination.
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl ServerTransportListener for RecordingTransportListener {
    fn stream_created(&self, stream: Arc<dyn StreamSink>, method: &str, headers: Metadata) {
        let listener = Arc::new(RecordingListener::default());
        stream.set_listener(listener.clone());
        lock(&self.calls).push(CreatedCall {
            stream,
            method: method.to_owned(),
            headers,
            listener,
        });
    }

    fn transport_terminated(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Server listener for one set of bound services.
pub struct RecordingServerListener {
    services: Vec<String>,
    transports: Mutex<Vec<Arc<dyn ServerTransport>>>,
    transport_listener: Arc<RecordingTransportListener>,
    shut_down: AtomicBool,
}

impl RecordingServerListener {
    pub fn services(&self) -> Vec<String> {
        self.services.clone()
    }

    /// Number of transports created for this listener.
    pub fn transports(&self) -> usize {
        lock(&self.transports).len()
    }

    pub fn transport(&self, index: usize) -> Option<Arc<dyn ServerTransport>> {
        lock(&self.transports).get(index).cloned()
    }

    pub fn transport_listener(&self) -> Arc<RecordingTransportListener> {
        self.transport_listener.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl ServerListener for RecordingServerListener {
    fn transport_created(
        &self,
        transport: Arc<dyn ServerTransport>,
    ) -> Arc<dyn ServerTransportListener> {
        lock(&self.transports).push(transport);
        self.transport_listener.clone()
    }

    fn server_shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Engine that records the listeners it hands out, one per bound server.
#[derive(Default)]
pub struct RecordingEngine {
    listeners: Mutex<Vec<Arc<RecordingServerListener>>>,
}

impl RecordingEngine {
    /// The `index`-th listener handed out.
    ///
    /// # Panics
    ///
    /// Panics if fewer listeners were handed out.
    pub fn listener(&self, index: usize) -> Arc<RecordingServerListener> {
        lock(&self.listeners)[index].clone()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

impl RpcEngine for RecordingEngine {
    fn server_listener(&self, services: &[Arc<dyn BindableService>]) -> Arc<dyn ServerListener> {
        let listener = Arc::new(RecordingServerListener {
            services: services.iter().map(|s| s.service_name().to_owned()).collect(),
            transports: Mutex::new(Vec::new()),
            transport_listener: Arc::new(RecordingTransportListener::default()),
            shut_down: AtomicBool::new(false),
        });
        lock(&self.listeners).push(listener.clone());
        listener
    }
}
