//! The data publisher.
//!
//! `DataPublisher` is the server entry point: it binds a TCP listener, runs a
//! dedicated accept loop, owns the subscriber-connection set behind a
//! reader-writer lock, holds the authoritative metadata, fans published
//! measurement batches out to every connection, and drains all user callbacks
//! through one dispatcher task so user code never runs on socket tasks.
//!
//! # Ownership
//!
//! The publisher owns its connections; each connection holds a `Weak`
//! reference back to the publisher core for callback dispatch and policy
//! lookups. Connections therefore never outlive the publisher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info};
use tokio::net::{TcpListener, ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connection::SubscriberConnection;
use crate::error::Result;
use crate::measurement::Measurement;
use crate::metadata::{DataSet, DataSetFilterCompiler, FilterCompiler};

/// Bounds for the cipher-key rotation period, in milliseconds.
const MIN_ROTATION_PERIOD_MS: u64 = 1_000;
const MAX_ROTATION_PERIOD_MS: u64 = 86_400_000;
const DEFAULT_ROTATION_PERIOD_MS: u64 = 60_000;

/// Accept-failure retry backoff range.
const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Connection-level security policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Plain connections; no cipher exchange.
    #[default]
    None,
    /// Shared-secret AES cipher exchange with periodic rotation.
    Gateway,
}

pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ClientConnectedCallback = Arc<dyn Fn(Uuid, &str, &str) + Send + Sync>;
pub type ClientDisconnectedCallback = Arc<dyn Fn(Uuid, &str) + Send + Sync>;
pub type UserCommandCallback = Arc<dyn Fn(Uuid, u8, &[u8]) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    status_message: Option<MessageCallback>,
    error_message: Option<MessageCallback>,
    client_connected: Option<ClientConnectedCallback>,
    client_disconnected: Option<ClientDisconnectedCallback>,
    user_command: Option<UserCommandCallback>,
}

/// Events routed through the dispatcher task to user callbacks.
pub(crate) enum CallbackEvent {
    Status(String),
    Error(String),
    ClientConnected {
        subscriber_id: Uuid,
        connection_id: String,
        subscription_info: String,
    },
    ClientDisconnected {
        subscriber_id: Uuid,
        connection_id: String,
    },
    UserCommand {
        subscriber_id: Uuid,
        command: u8,
        payload: Vec<u8>,
    },
}

/// Shared publisher internals; connections reach these through `Weak` refs.
pub(crate) struct PublisherCore {
    node_id: Uuid,
    security_mode: SecurityMode,
    metadata: StdRwLock<Arc<DataSet>>,
    filtering_metadata: StdRwLock<Arc<DataSet>>,
    filter_compiler: StdRwLock<Arc<dyn FilterCompiler>>,
    connections: RwLock<HashMap<Uuid, Arc<SubscriberConnection>>>,
    allow_metadata_refresh: AtomicBool,
    allow_nan_value_filter: AtomicBool,
    force_nan_value_filter: AtomicBool,
    cipher_key_rotation_period: AtomicU64,
    callbacks: StdMutex<Callbacks>,
    dispatch_tx: mpsc::UnboundedSender<CallbackEvent>,
    data_channel: Mutex<Option<Arc<UdpSocket>>>,
    total_command_channel_bytes: AtomicU64,
    total_data_channel_bytes: AtomicU64,
    total_measurements: AtomicU64,
    stopped: AtomicBool,
}

impl PublisherCore {
    pub(crate) fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    pub(crate) fn dispatch(&self, event: CallbackEvent) {
        let _ = self.dispatch_tx.send(event);
    }

    pub(crate) fn filtering_dataset(&self) -> Arc<DataSet> {
        self.filtering_metadata.read().expect("metadata lock").clone()
    }

    pub(crate) fn metadata_version(&self) -> u32 {
        self.metadata.read().expect("metadata lock").version
    }

    pub(crate) fn filter_compiler(&self) -> Arc<dyn FilterCompiler> {
        self.filter_compiler.read().expect("compiler lock").clone()
    }

    pub(crate) fn metadata_refresh_allowed(&self) -> bool {
        self.allow_metadata_refresh.load(Ordering::Relaxed)
    }

    pub(crate) fn nan_value_filter_allowed(&self) -> bool {
        self.allow_nan_value_filter.load(Ordering::Relaxed)
    }

    pub(crate) fn nan_value_filter_forced(&self) -> bool {
        self.force_nan_value_filter.load(Ordering::Relaxed)
    }

    pub(crate) fn cipher_key_rotation_period(&self) -> u64 {
        self.cipher_key_rotation_period.load(Ordering::Relaxed)
    }

    pub(crate) fn add_command_channel_bytes(&self, count: u64) {
        self.total_command_channel_bytes.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_data_channel_bytes(&self, count: u64) {
        self.total_data_channel_bytes.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_measurements_sent(&self, count: u64) {
        self.total_measurements.fetch_add(count, Ordering::Relaxed);
    }

    /// The shared UDP data-channel socket, bound on first use.
    pub(crate) async fn data_channel_socket(&self) -> std::io::Result<Arc<UdpSocket>> {
        let mut guard = self.data_channel.lock().await;
        if let Some(socket) = guard.as_ref() {
            return Ok(socket.clone());
        }
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        *guard = Some(socket.clone());
        Ok(socket)
    }

    pub(crate) async fn remove_connection(&self, connection: &SubscriberConnection) {
        let removed = self
            .connections
            .write()
            .await
            .remove(&connection.subscriber_id())
            .is_some();

        if removed {
            self.dispatch(CallbackEvent::ClientDisconnected {
                subscriber_id: connection.subscriber_id(),
                connection_id: connection.connection_id().to_string(),
            });
            self.dispatch(CallbackEvent::Status(format!(
                "client \"{}\" disconnected",
                connection.connection_id()
            )));
        }
    }
}

/// Server-side GEP publisher.
pub struct DataPublisher {
    core: Arc<PublisherCore>,
    dispatch_rx: StdMutex<Option<mpsc::UnboundedReceiver<CallbackEvent>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl DataPublisher {
    pub fn new(security_mode: SecurityMode) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let dataset: Arc<DataSet> = Arc::new(DataSet::default());

        let core = Arc::new(PublisherCore {
            node_id: Uuid::new_v4(),
            security_mode,
            metadata: StdRwLock::new(dataset.clone()),
            filtering_metadata: StdRwLock::new(dataset.clone()),
            filter_compiler: StdRwLock::new(Arc::new(DataSetFilterCompiler::new(dataset))),
            connections: RwLock::new(HashMap::new()),
            allow_metadata_refresh: AtomicBool::new(true),
            allow_nan_value_filter: AtomicBool::new(true),
            force_nan_value_filter: AtomicBool::new(false),
            cipher_key_rotation_period: AtomicU64::new(DEFAULT_ROTATION_PERIOD_MS),
            callbacks: StdMutex::new(Callbacks::default()),
            dispatch_tx,
            data_channel: Mutex::new(None),
            total_command_channel_bytes: AtomicU64::new(0),
            total_data_channel_bytes: AtomicU64::new(0),
            total_measurements: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });

        Self {
            core,
            dispatch_rx: StdMutex::new(Some(dispatch_rx)),
            tasks: StdMutex::new(Vec::new()),
            local_addr: StdMutex::new(None),
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.core.node_id
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.core.security_mode
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("address lock")
    }

    /// Binds the command channel and starts the accept loop and the callback
    /// dispatcher. Returns the bound address.
    pub async fn start(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().expect("address lock") = Some(local_addr);

        let dispatcher = {
            let core = self.core.clone();
            let receiver = self
                .dispatch_rx
                .lock()
                .expect("dispatch receiver lock")
                .take()
                .expect("publisher started twice");
            tokio::spawn(async move { run_callback_dispatcher(core, receiver).await })
        };

        let acceptor = {
            let core = self.core.clone();
            tokio::spawn(async move { run_accept_loop(core, listener).await })
        };

        let mut tasks = self.tasks.lock().expect("task list lock");
        tasks.push(dispatcher);
        tasks.push(acceptor);

        info!("publisher {} listening on {local_addr}", self.core.node_id);
        Ok(local_addr)
    }

    /// Stops accepting, terminates every connection, and halts callback
    /// dispatch.
    pub async fn stop(&self) {
        if self.core.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let connections: Vec<Arc<SubscriberConnection>> =
            self.core.connections.read().await.values().cloned().collect();
        for connection in connections {
            connection.stop().await;
        }

        let tasks: Vec<JoinHandle<()>> =
            self.tasks.lock().expect("task list lock").drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    // ---- metadata --------------------------------------------------------

    /// Replaces the authoritative metadata atomically. Existing subscriptions
    /// keep their compiled caches; subscribed peers receive a
    /// `ConfigurationChanged` notification so they may refresh.
    pub async fn define_metadata(&self, dataset: DataSet) {
        let dataset = Arc::new(dataset);

        *self.core.metadata.write().expect("metadata lock") = dataset.clone();
        *self.core.filtering_metadata.write().expect("metadata lock") = dataset.clone();
        *self.core.filter_compiler.write().expect("compiler lock") =
            Arc::new(DataSetFilterCompiler::new(dataset.clone()));

        let connections: Vec<Arc<SubscriberConnection>> =
            self.core.connections.read().await.values().cloned().collect();
        for connection in connections {
            if connection.is_subscribed().await {
                connection.send_configuration_changed();
            }
        }

        self.core.dispatch(CallbackEvent::Status(format!(
            "metadata defined: version {}, {} measurements",
            dataset.version,
            dataset.measurements.len()
        )));
    }

    pub fn metadata(&self) -> Arc<DataSet> {
        self.core.metadata.read().expect("metadata lock").clone()
    }

    /// Installs a custom filter-expression compiler in place of the built-in
    /// metadata-backed one.
    pub fn set_filter_compiler(&self, compiler: Arc<dyn FilterCompiler>) {
        *self.core.filter_compiler.write().expect("compiler lock") = compiler;
    }

    // ---- measurement fan-out ---------------------------------------------

    /// Forwards a batch to every connection concurrently.
    ///
    /// Each connection filters the batch by its own signal-index cache and
    /// encodes its own packets; per-connection failures are absorbed and this
    /// call never fails.
    pub async fn publish_measurements(&self, measurements: &[Measurement]) {
        if measurements.is_empty() {
            return;
        }

        let connections: Vec<Arc<SubscriberConnection>> =
            self.core.connections.read().await.values().cloned().collect();

        join_all(
            connections
                .iter()
                .map(|connection| connection.publish_measurements(measurements)),
        )
        .await;
    }

    // ---- policy ----------------------------------------------------------

    pub fn set_metadata_refresh_allowed(&self, allowed: bool) {
        self.core.allow_metadata_refresh.store(allowed, Ordering::Relaxed);
    }

    pub fn metadata_refresh_allowed(&self) -> bool {
        self.core.metadata_refresh_allowed()
    }

    pub fn set_nan_value_filter_allowed(&self, allowed: bool) {
        self.core.allow_nan_value_filter.store(allowed, Ordering::Relaxed);
    }

    pub fn nan_value_filter_allowed(&self) -> bool {
        self.core.nan_value_filter_allowed()
    }

    pub fn set_nan_value_filter_forced(&self, forced: bool) {
        self.core.force_nan_value_filter.store(forced, Ordering::Relaxed);
    }

    pub fn nan_value_filter_forced(&self) -> bool {
        self.core.nan_value_filter_forced()
    }

    /// Sets the automatic cipher-key rotation period, clamped to
    /// `[1000, 86_400_000]` ms. Applies to connections accepted afterwards.
    pub fn set_cipher_key_rotation_period(&self, period_ms: u64) {
        let clamped = period_ms.clamp(MIN_ROTATION_PERIOD_MS, MAX_ROTATION_PERIOD_MS);
        self.core.cipher_key_rotation_period.store(clamped, Ordering::Relaxed);
    }

    pub fn cipher_key_rotation_period(&self) -> u64 {
        self.core.cipher_key_rotation_period()
    }

    // ---- callbacks -------------------------------------------------------

    pub fn register_status_message_callback(&self, callback: MessageCallback) {
        self.core.callbacks.lock().expect("callback lock").status_message = Some(callback);
    }

    pub fn clear_status_message_callback(&self) {
        self.core.callbacks.lock().expect("callback lock").status_message = None;
    }

    pub fn register_error_message_callback(&self, callback: MessageCallback) {
        self.core.callbacks.lock().expect("callback lock").error_message = Some(callback);
    }

    pub fn clear_error_message_callback(&self) {
        self.core.callbacks.lock().expect("callback lock").error_message = None;
    }

    pub fn register_client_connected_callback(&self, callback: ClientConnectedCallback) {
        self.core.callbacks.lock().expect("callback lock").client_connected = Some(callback);
    }

    pub fn clear_client_connected_callback(&self) {
        self.core.callbacks.lock().expect("callback lock").client_connected = None;
    }

    pub fn register_client_disconnected_callback(&self, callback: ClientDisconnectedCallback) {
        self.core.callbacks.lock().expect("callback lock").client_disconnected = Some(callback);
    }

    pub fn clear_client_disconnected_callback(&self) {
        self.core.callbacks.lock().expect("callback lock").client_disconnected = None;
    }

    pub fn register_user_command_callback(&self, callback: UserCommandCallback) {
        self.core.callbacks.lock().expect("callback lock").user_command = Some(callback);
    }

    pub fn clear_user_command_callback(&self) {
        self.core.callbacks.lock().expect("callback lock").user_command = None;
    }

    // ---- statistics ------------------------------------------------------

    pub async fn connection_count(&self) -> usize {
        self.core.connections.read().await.len()
    }

    pub async fn connections(&self) -> Vec<Arc<SubscriberConnection>> {
        self.core.connections.read().await.values().cloned().collect()
    }

    pub fn total_command_channel_bytes_sent(&self) -> u64 {
        self.core.total_command_channel_bytes.load(Ordering::Relaxed)
    }

    pub fn total_data_channel_bytes_sent(&self) -> u64 {
        self.core.total_data_channel_bytes.load(Ordering::Relaxed)
    }

    pub fn total_measurements_sent(&self) -> u64 {
        self.core.total_measurements.load(Ordering::Relaxed)
    }
}

async fn run_accept_loop(core: Arc<PublisherCore>, listener: TcpListener) {
    let mut backoff = ACCEPT_BACKOFF_START;

    loop {
        if core.stopped.load(Ordering::SeqCst) {
            return;
        }

        match listener.accept().await {
            Ok((socket, peer)) => {
                backoff = ACCEPT_BACKOFF_START;
                socket.set_nodelay(true).ok();

                let connection = SubscriberConnection::new(peer, Arc::downgrade(&core));
                core.connections
                    .write()
                    .await
                    .insert(connection.subscriber_id(), connection.clone());
                connection.start(socket);

                debug!("accepted subscriber connection from {peer}");
                core.dispatch(CallbackEvent::ClientConnected {
                    subscriber_id: connection.subscriber_id(),
                    connection_id: connection.connection_id().to_string(),
                    subscription_info: String::new(),
                });
                core.dispatch(CallbackEvent::Status(format!(
                    "client connected: \"{}\"",
                    connection.connection_id()
                )));
            }
            Err(error) => {
                core.dispatch(CallbackEvent::Error(format!(
                    "accept failed: {error}; retrying in {}ms",
                    backoff.as_millis()
                )));
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(ACCEPT_BACKOFF_CAP);
            }
        }
    }
}

/// Drains callback events serially so user code observes a stable order and
/// never runs on socket tasks.
async fn run_callback_dispatcher(
    core: Arc<PublisherCore>,
    mut receiver: mpsc::UnboundedReceiver<CallbackEvent>,
) {
    while let Some(event) = receiver.recv().await {
        match event {
            CallbackEvent::Status(message) => {
                debug!("{message}");
                let callback = core.callbacks.lock().expect("callback lock").status_message.clone();
                if let Some(callback) = callback {
                    callback(&message);
                }
            }
            CallbackEvent::Error(message) => {
                log::error!("{message}");
                let callback = core.callbacks.lock().expect("callback lock").error_message.clone();
                if let Some(callback) = callback {
                    callback(&message);
                }
            }
            CallbackEvent::ClientConnected {
                subscriber_id,
                connection_id,
                subscription_info,
            } => {
                let callback = core.callbacks.lock().expect("callback lock").client_connected.clone();
                if let Some(callback) = callback {
                    callback(subscriber_id, &connection_id, &subscription_info);
                }
            }
            CallbackEvent::ClientDisconnected {
                subscriber_id,
                connection_id,
            } => {
                let callback = core
                    .callbacks
                    .lock()
                    .expect("callback lock")
                    .client_disconnected
                    .clone();
                if let Some(callback) = callback {
                    callback(subscriber_id, &connection_id);
                }
            }
            CallbackEvent::UserCommand {
                subscriber_id,
                command,
                payload,
            } => {
                let callback = core.callbacks.lock().expect("callback lock").user_command.clone();
                if let Some(callback) = callback {
                    callback(subscriber_id, command, &payload);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_period_clamped() {
        let publisher = DataPublisher::new(SecurityMode::None);

        publisher.set_cipher_key_rotation_period(10);
        assert_eq!(publisher.cipher_key_rotation_period(), 1_000);

        publisher.set_cipher_key_rotation_period(120_000);
        assert_eq!(publisher.cipher_key_rotation_period(), 120_000);

        publisher.set_cipher_key_rotation_period(u64::MAX);
        assert_eq!(publisher.cipher_key_rotation_period(), 86_400_000);
    }

    #[test]
    fn test_callback_registration_replaces_and_clears() {
        let publisher = DataPublisher::new(SecurityMode::None);

        publisher.register_status_message_callback(Arc::new(|_message| {}));
        assert!(publisher
            .core
            .callbacks
            .lock()
            .unwrap()
            .status_message
            .is_some());

        publisher.clear_status_message_callback();
        assert!(publisher
            .core
            .callbacks
            .lock()
            .unwrap()
            .status_message
            .is_none());
    }

    #[tokio::test]
    async fn test_define_metadata_swaps_dataset() {
        let publisher = DataPublisher::new(SecurityMode::None);
        assert_eq!(publisher.metadata().version, 0);

        publisher
            .define_metadata(DataSet {
                version: 7,
                ..Default::default()
            })
            .await;
        assert_eq!(publisher.metadata().version, 7);
    }

    #[tokio::test]
    async fn test_publish_with_no_connections_is_noop() {
        let publisher = DataPublisher::new(SecurityMode::None);
        publisher.publish_measurements(&[Measurement::default()]).await;
        assert_eq!(publisher.total_measurements_sent(), 0);
    }
}
