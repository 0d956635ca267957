//! Per-subscriber connection state machine.
//!
//! Each accepted socket becomes a `SubscriberConnection`. A reader task
//! processes framed commands in arrival order; a writer task drains a bounded
//! send queue so concurrent publishers never block on a slow peer beyond the
//! queue bound; timer tasks drive the heartbeat and automatic cipher-key
//! rotation. Data packets travel over a UDP data channel when the subscriber
//! requested one, otherwise they multiplex onto the command channel.

use std::collections::HashMap;
use std::io::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::SignalIndexCache;
use crate::cipher::{CipherEngine, CipherKeys};
use crate::codec::{self, ByteReader, Encoding};
use crate::compact::{self, BaseTimeWindows, CompactMeasurementCodec};
use crate::constants::{
    data_packet_flags, operational_modes, ServerCommand, ServerResponse, MAX_PACKET_SIZE,
};
use crate::error::{PublisherError, Result};
use crate::measurement::Measurement;
use crate::publisher::{CallbackEvent, PublisherCore, SecurityMode};
use crate::settings;
use crate::ticks;

/// Largest command payload a peer may send.
const MAX_COMMAND_PAYLOAD: usize = 4 * 1024 * 1024;

/// Depth of the per-connection send queue, in frames.
const SEND_QUEUE_DEPTH: usize = 512;

/// Heartbeat cadence; three silent intervals terminate the connection.
const PING_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Command,
    Data,
}

enum OutboundFrame {
    Write { channel: ChannelKind, bytes: Vec<u8> },
    /// Drains the queue and closes the socket; lets already-enqueued
    /// responses flush before termination.
    Shutdown,
}

/// Mutable negotiated and subscription state, guarded by one async mutex.
struct ConnectionState {
    operational_modes: u32,
    encoding: Encoding,
    use_compact_format: bool,
    use_payload_compression: bool,
    compress_cache_and_metadata: bool,
    include_time: bool,
    use_millisecond_resolution: bool,
    is_nan_filtered: bool,
    is_subscribed: bool,
    start_time_sent: bool,
    signal_index_cache: Option<std::sync::Arc<SignalIndexCache>>,
    base_times: Option<BaseTimeWindows>,
    processing_interval: i32,
    throttled: bool,
    publish_interval_ticks: i64,
    last_publish_time: i64,
    subscription_info: String,
    pending_notifications: HashMap<u32, String>,
    next_notification_id: u32,
    pending_buffer_blocks: HashMap<u32, Vec<u8>>,
    next_buffer_block_sequence: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            operational_modes: 0,
            encoding: Encoding::Utf8,
            use_compact_format: true,
            use_payload_compression: false,
            compress_cache_and_metadata: false,
            include_time: true,
            use_millisecond_resolution: false,
            is_nan_filtered: false,
            is_subscribed: false,
            start_time_sent: false,
            signal_index_cache: None,
            base_times: None,
            processing_interval: -1,
            throttled: false,
            publish_interval_ticks: ticks::PER_SECOND,
            last_publish_time: 0,
            subscription_info: String::new(),
            pending_notifications: HashMap::new(),
            next_notification_id: 0,
            pending_buffer_blocks: HashMap::new(),
            next_buffer_block_sequence: 0,
        }
    }
}

/// One subscriber's server-side session.
pub struct SubscriberConnection {
    subscriber_id: Uuid,
    connection_id: String,
    ip_address: IpAddr,
    host_name: String,
    parent: Weak<PublisherCore>,
    state: Mutex<ConnectionState>,
    cipher: CipherEngine,
    send_tx: mpsc::Sender<OutboundFrame>,
    send_rx: StdMutex<Option<mpsc::Receiver<OutboundFrame>>>,
    writer_task: StdMutex<Option<JoinHandle<()>>>,
    udp_target: StdMutex<Option<(std::sync::Arc<UdpSocket>, SocketAddr)>>,
    stopped: AtomicBool,
    last_receive: StdMutex<Instant>,
    command_channel_bytes_sent: AtomicU64,
    data_channel_bytes_sent: AtomicU64,
    measurements_sent: AtomicU64,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SubscriberConnection {
    pub(crate) fn new(peer: SocketAddr, parent: Weak<PublisherCore>) -> std::sync::Arc<Self> {
        let connection_id = match peer.ip() {
            IpAddr::V6(ip) => format!("[{ip}]:{}", peer.port()),
            IpAddr::V4(ip) => format!("{ip}:{}", peer.port()),
        };
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);

        std::sync::Arc::new(Self {
            subscriber_id: Uuid::new_v4(),
            connection_id,
            ip_address: peer.ip(),
            // Reverse resolution is best effort in the protocol; the address
            // text stands in when it is unavailable.
            host_name: peer.ip().to_string(),
            parent,
            state: Mutex::new(ConnectionState::default()),
            cipher: CipherEngine::new(),
            send_tx,
            send_rx: StdMutex::new(Some(send_rx)),
            writer_task: StdMutex::new(None),
            udp_target: StdMutex::new(None),
            stopped: AtomicBool::new(false),
            last_receive: StdMutex::new(Instant::now()),
            command_channel_bytes_sent: AtomicU64::new(0),
            data_channel_bytes_sent: AtomicU64::new(0),
            measurements_sent: AtomicU64::new(0),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    pub fn subscriber_id(&self) -> Uuid {
        self.subscriber_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn ip_address(&self) -> IpAddr {
        self.ip_address
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn is_subscribed(&self) -> bool {
        self.state.lock().await.is_subscribed
    }

    pub async fn operational_modes(&self) -> u32 {
        self.state.lock().await.operational_modes
    }

    pub async fn subscription_info(&self) -> String {
        self.state.lock().await.subscription_info.clone()
    }

    /// Per-connection publish throttle, in milliseconds; negative means
    /// publish at the incoming rate.
    pub async fn processing_interval(&self) -> i32 {
        self.state.lock().await.processing_interval
    }

    pub fn command_channel_bytes_sent(&self) -> u64 {
        self.command_channel_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn data_channel_bytes_sent(&self) -> u64 {
        self.data_channel_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn measurements_sent(&self) -> u64 {
        self.measurements_sent.load(Ordering::Relaxed)
    }

    fn parent(&self) -> Option<std::sync::Arc<PublisherCore>> {
        self.parent.upgrade()
    }

    /// Spawns the reader, writer, and timer tasks for an accepted socket.
    pub(crate) fn start(self: &std::sync::Arc<Self>, socket: TcpStream) {
        let (read_half, write_half) = socket.into_split();

        let reader = {
            let connection = self.clone();
            tokio::spawn(async move { connection.run_command_channel(read_half).await })
        };

        let writer = {
            let connection = self.clone();
            let receiver = connection
                .send_rx
                .lock()
                .expect("send queue lock")
                .take()
                .expect("writer started twice");
            tokio::spawn(async move { connection.run_write_queue(write_half, receiver).await })
        };

        let ping = {
            let connection = self.clone();
            tokio::spawn(async move { connection.run_ping_timer().await })
        };

        *self.writer_task.lock().expect("writer task lock") = Some(writer);

        let mut tasks = self.tasks.lock().expect("task list lock");
        tasks.push(reader);
        tasks.push(ping);

        if let Some(parent) = self.parent() {
            if parent.security_mode() == SecurityMode::Gateway {
                if let Some(keys) = self.cipher.initialize() {
                    self.send_cipher_keys(self.cipher.active_index(), &keys);
                }

                let connection = self.clone();
                let period = parent.cipher_key_rotation_period();
                tasks.push(tokio::spawn(async move {
                    connection.run_rotation_timer(period).await
                }));
            }
        }

        // A task that raced through stop() before these handles were recorded
        // would otherwise leave them running.
        if self.is_stopped() {
            for task in tasks.drain(..) {
                task.abort();
            }
            drop(tasks);
            self.shut_down_writer();
        }
    }

    /// Stops the connection: flags it, removes it from the publisher, lets
    /// the write queue drain, and cancels the remaining tasks. Safe to call
    /// from any of the connection's own tasks.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(parent) = self.parent() {
            parent.remove_connection(self).await;
        }

        self.shut_down_writer();

        // Cancelling our own caller task last: everything above has completed
        // by the time the abort lands.
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().expect("task list lock").drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    /// Asks the writer to flush pending frames and close; a full queue falls
    /// back to cancellation.
    fn shut_down_writer(&self) {
        let flushed = self.send_tx.try_send(OutboundFrame::Shutdown).is_ok();
        if !flushed {
            if let Some(task) = self.writer_task.lock().expect("writer task lock").take() {
                task.abort();
            }
        }
    }

    // ---- command channel -------------------------------------------------

    async fn run_command_channel(self: std::sync::Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut header = [0u8; 5];

        loop {
            if self.is_stopped() {
                return;
            }

            if let Err(error) = read_half.read_exact(&mut header).await {
                self.report_read_error(error);
                break;
            }

            let command_code = header[0];
            let payload_length =
                u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

            if payload_length > MAX_COMMAND_PAYLOAD {
                self.send_failed(
                    command_code,
                    &format!("command payload of {payload_length} bytes exceeds limit"),
                )
                .await;
                break;
            }

            let mut payload = vec![0u8; payload_length];
            if let Err(error) = read_half.read_exact(&mut payload).await {
                self.report_read_error(error);
                break;
            }

            *self.last_receive.lock().expect("receive clock lock") = Instant::now();

            match ServerCommand::from_u8(command_code) {
                Some(command) => {
                    if let Err(error) = self.handle_command(command, &payload).await {
                        let terminal = matches!(error, PublisherError::ProtocolViolation(_));
                        self.send_failed(command_code, &error.to_string()).await;
                        if let Some(parent) = self.parent() {
                            parent.dispatch(CallbackEvent::Error(format!(
                                "\"{}\" command {command:?} failed: {error}",
                                self.connection_id
                            )));
                        }
                        if terminal {
                            break;
                        }
                    }
                }
                None => {
                    let message =
                        format!("\"{}\" sent an unrecognized command: {command_code:#04x}", self.connection_id);
                    self.send_failed(command_code, &message).await;
                    if let Some(parent) = self.parent() {
                        parent.dispatch(CallbackEvent::Error(message));
                    }
                    break;
                }
            }
        }

        self.stop().await;
    }

    fn report_read_error(&self, error: std::io::Error) {
        use std::io::ErrorKind;

        if self.is_stopped() {
            return;
        }

        // EOF and reset are a clean remote close, not a reportable fault.
        if !matches!(
            error.kind(),
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
        ) {
            if let Some(parent) = self.parent() {
                parent.dispatch(CallbackEvent::Error(format!(
                    "error reading from client \"{}\" command channel: {error}",
                    self.connection_id
                )));
            }
        }
    }

    async fn handle_command(&self, command: ServerCommand, payload: &[u8]) -> Result<()> {
        debug!("\"{}\" received {command:?}", self.connection_id);

        match command {
            ServerCommand::DefineOperationalModes => self.handle_define_operational_modes(payload).await,
            ServerCommand::Subscribe => self.handle_subscribe(payload).await,
            ServerCommand::Unsubscribe => self.handle_unsubscribe().await,
            ServerCommand::MetadataRefresh => self.handle_metadata_refresh().await,
            ServerCommand::RotateCipherKeys => self.handle_rotate_cipher_keys().await,
            ServerCommand::UpdateProcessingInterval => {
                self.handle_update_processing_interval(payload).await
            }
            ServerCommand::ConfirmNotification => self.handle_confirm_notification(payload).await,
            ServerCommand::ConfirmBufferBlock => self.handle_confirm_buffer_block(payload).await,
            ServerCommand::PublishCommandMeasurements => {
                self.handle_publish_command_measurements(payload).await
            }
            ServerCommand::UserCommand(code) => self.handle_user_command(code, payload).await,
        }
    }

    async fn handle_define_operational_modes(&self, payload: &[u8]) -> Result<()> {
        let modes = ByteReader::new(payload).read_u32()?;

        let mut state = self.state.lock().await;
        state.operational_modes = modes;
        state.encoding = Encoding::from_operational_modes(modes);
        state.use_payload_compression = modes & operational_modes::COMPRESS_PAYLOAD != 0;
        state.compress_cache_and_metadata = modes & operational_modes::COMPRESS_METADATA != 0;

        debug!(
            "\"{}\" defined operational modes {modes:#010x} (encoding {:?})",
            self.connection_id, state.encoding
        );
        Ok(())
    }

    async fn handle_subscribe(&self, payload: &[u8]) -> Result<()> {
        let parent = match self.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        };

        let mut state = self.state.lock().await;

        let connection_string = ByteReader::new(payload).read_string(state.encoding)?;
        let subscription = settings::parse_key_value_pairs(&connection_string)?;

        let filter_expression = subscription.get("filterExpression").unwrap_or_default();
        let signal_ids = parent.filter_compiler().compile(filter_expression)?;

        // Compiled IDs the metadata does not carry are unauthorized; a
        // subscription consisting only of those is refused outright.
        let dataset = parent.filtering_dataset();
        let mut cache = SignalIndexCache::new();
        for signal_id in &signal_ids {
            match dataset.measurement_by_signal_id(signal_id) {
                Some(record) => {
                    cache.add(*signal_id, &record.source, record.id, &record.point_tag);
                }
                None => cache.add_unauthorized(*signal_id),
            }
        }

        if cache.is_empty() {
            if cache.unauthorized_ids().is_empty() {
                return Err(PublisherError::Configuration(format!(
                    "filter expression \"{filter_expression}\" matched no signals"
                )));
            }
            return Err(PublisherError::AuthorizationDenied(
                "filter expression matched only non-authorized signals".to_string(),
            ));
        }

        state.include_time = subscription.get_bool("includeTime").unwrap_or(true);
        state.use_millisecond_resolution = subscription
            .get_bool("useMillisecondResolution")
            .unwrap_or(false);
        state.throttled = subscription.get_bool("throttled").unwrap_or(false);
        if let Some(interval_ms) = subscription.get_i64("publishInterval") {
            state.publish_interval_ticks = interval_ms.max(0) * ticks::PER_MILLISECOND;
        }

        let nan_filter_requested = subscription
            .get_bool("requestNaNValueFilter")
            .unwrap_or(false);
        state.is_nan_filtered = parent.nan_value_filter_forced()
            || (nan_filter_requested && parent.nan_value_filter_allowed());

        if let Some(info) = subscription.get("assemblyInfo") {
            state.subscription_info = parse_subscription_info(info);
        }

        if let Some(data_channel) = subscription.get("dataChannel") {
            let inner = settings::parse_key_value_pairs(data_channel)?;
            if let Some(port) = inner.get_u16("port") {
                let socket = parent
                    .data_channel_socket()
                    .await
                    .map_err(PublisherError::Transport)?;
                let target = SocketAddr::new(self.ip_address, port);
                *self.udp_target.lock().expect("udp target lock") = Some((socket, target));
            }
        }

        let cache = std::sync::Arc::new(cache);
        state.signal_index_cache = Some(cache.clone());
        state.base_times = Some(BaseTimeWindows::new(ticks::now()));
        state.is_subscribed = true;
        state.start_time_sent = false;
        state.last_publish_time = 0;

        // Cache, base times, then the success acknowledgment: the cache must
        // precede any data packet it governs.
        let mut cache_payload = cache.serialize();
        if state.compress_cache_and_metadata {
            cache_payload = gzip_compress(&cache_payload)?;
        }
        self.send_response(
            ServerResponse::UpdateSignalIndexCache,
            ServerCommand::Subscribe.as_u8(),
            cache_payload,
        );
        self.send_base_times(&state);

        let message = format!(
            "Client subscribed as {} with {} signals.",
            if state.use_compact_format { "compact" } else { "fixed" },
            cache.len()
        );
        let mut response = Vec::new();
        codec::write_u32(&mut response, parent.metadata_version());
        codec::write_string(&mut response, &message, state.encoding);
        self.send_response(
            ServerResponse::Succeeded,
            ServerCommand::Subscribe.as_u8(),
            response,
        );

        parent.dispatch(CallbackEvent::Status(format!(
            "\"{}\" subscribed to {} signals",
            self.connection_id,
            cache.len()
        )));
        Ok(())
    }

    async fn handle_unsubscribe(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.is_subscribed = false;
        state.start_time_sent = false;
        state.signal_index_cache = None;
        state.base_times = None;

        let message = "Client unsubscribed.";
        let payload = state.encoding.encode(message);
        self.send_response(
            ServerResponse::Succeeded,
            ServerCommand::Unsubscribe.as_u8(),
            payload,
        );

        if let Some(parent) = self.parent() {
            parent.dispatch(CallbackEvent::Status(format!(
                "\"{}\" unsubscribed",
                self.connection_id
            )));
        }
        Ok(())
    }

    async fn handle_metadata_refresh(&self) -> Result<()> {
        let parent = match self.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        };

        if !parent.metadata_refresh_allowed() {
            return Err(PublisherError::AuthorizationDenied(
                "metadata refresh is not allowed".to_string(),
            ));
        }

        let state = self.state.lock().await;
        let mut payload = parent.filtering_dataset().serialize_json()?;
        if state.compress_cache_and_metadata {
            payload = gzip_compress(&payload)?;
        }
        self.send_response(
            ServerResponse::Succeeded,
            ServerCommand::MetadataRefresh.as_u8(),
            payload,
        );

        parent.dispatch(CallbackEvent::Status(format!(
            "metadata sent to \"{}\"",
            self.connection_id
        )));
        Ok(())
    }

    async fn handle_rotate_cipher_keys(&self) -> Result<()> {
        self.rotate_cipher_keys();
        Ok(())
    }

    /// Generates material into the inactive slot, delivers it, then flips the
    /// active index. Packets already queued keep the slot they were encrypted
    /// with.
    pub fn rotate_cipher_keys(&self) {
        let (new_index, keys) = self.cipher.rotate();
        self.send_cipher_keys(new_index, &keys);
        self.cipher.commit();

        if let Some(parent) = self.parent() {
            parent.dispatch(CallbackEvent::Status(format!(
                "cipher keys rotated for \"{}\"",
                self.connection_id
            )));
        }
    }

    fn send_cipher_keys(&self, index: usize, keys: &CipherKeys) {
        let mut payload = Vec::with_capacity(1 + 8 + keys.key.len() + keys.iv.len());
        payload.push(index as u8);
        codec::write_u32(&mut payload, keys.key.len() as u32);
        payload.extend_from_slice(&keys.key);
        codec::write_u32(&mut payload, keys.iv.len() as u32);
        payload.extend_from_slice(&keys.iv);

        self.send_response(
            ServerResponse::UpdateCipherKeys,
            ServerCommand::Subscribe.as_u8(),
            payload,
        );
    }

    async fn handle_update_processing_interval(&self, payload: &[u8]) -> Result<()> {
        let interval = ByteReader::new(payload).read_i32()?;

        let mut state = self.state.lock().await;
        state.processing_interval = interval;
        // Non-negative intervals retune the publish throttle; negative means
        // publish at the incoming rate.
        if interval >= 0 {
            state.throttled = interval > 0;
            state.publish_interval_ticks = i64::from(interval) * ticks::PER_MILLISECOND;
        } else {
            state.throttled = false;
        }

        let message = "New processing interval applied.";
        let payload = state.encoding.encode(message);
        self.send_response(
            ServerResponse::Succeeded,
            ServerCommand::UpdateProcessingInterval.as_u8(),
            payload,
        );
        Ok(())
    }

    async fn handle_confirm_notification(&self, payload: &[u8]) -> Result<()> {
        let notification_id = ByteReader::new(payload).read_u32()?;
        let mut state = self.state.lock().await;
        if state.pending_notifications.remove(&notification_id).is_none() {
            warn!(
                "\"{}\" confirmed unknown notification {notification_id}",
                self.connection_id
            );
        }
        Ok(())
    }

    async fn handle_confirm_buffer_block(&self, payload: &[u8]) -> Result<()> {
        let sequence = ByteReader::new(payload).read_u32()?;
        let mut state = self.state.lock().await;
        if state.pending_buffer_blocks.remove(&sequence).is_none() {
            warn!(
                "\"{}\" confirmed unknown buffer block {sequence}",
                self.connection_id
            );
        }
        Ok(())
    }

    async fn handle_publish_command_measurements(&self, payload: &[u8]) -> Result<()> {
        let state = self.state.lock().await;
        let cache = state.signal_index_cache.clone();
        drop(state);

        let mut reader = ByteReader::new(payload);
        let count = reader.read_u32()?;
        let mut measurements = Vec::with_capacity(count as usize);
        for _ in 0..count {
            measurements.push(compact::parse_fixed(&mut reader, cache.as_deref())?);
        }

        if let Some(parent) = self.parent() {
            parent.dispatch(CallbackEvent::Status(format!(
                "\"{}\" published {} command measurements",
                self.connection_id,
                measurements.len()
            )));
        }
        Ok(())
    }

    async fn handle_user_command(&self, code: u8, payload: &[u8]) -> Result<()> {
        if let Some(parent) = self.parent() {
            parent.dispatch(CallbackEvent::UserCommand {
                subscriber_id: self.subscriber_id,
                command: code,
                payload: payload.to_vec(),
            });
        }
        self.send_response(ServerResponse::Succeeded, code, Vec::new());
        Ok(())
    }

    // ---- notifications and buffer blocks ---------------------------------

    /// Sends a `Notify` response; the peer acknowledges with
    /// `ConfirmNotification` carrying the returned id.
    pub async fn send_notification(&self, message: &str) -> u32 {
        let mut state = self.state.lock().await;
        let notification_id = state.next_notification_id;
        state.next_notification_id = state.next_notification_id.wrapping_add(1);
        state
            .pending_notifications
            .insert(notification_id, message.to_string());

        let mut payload = Vec::new();
        codec::write_u32(&mut payload, notification_id);
        codec::write_string(&mut payload, message, state.encoding);
        self.send_response(
            ServerResponse::Notify,
            ServerCommand::Subscribe.as_u8(),
            payload,
        );
        notification_id
    }

    /// Sends a `BufferBlock` response; the peer acknowledges with
    /// `ConfirmBufferBlock` carrying the returned sequence number.
    pub async fn send_buffer_block(&self, block: &[u8]) -> u32 {
        let mut state = self.state.lock().await;
        let sequence = state.next_buffer_block_sequence;
        state.next_buffer_block_sequence = state.next_buffer_block_sequence.wrapping_add(1);
        state.pending_buffer_blocks.insert(sequence, block.to_vec());

        let mut payload = Vec::with_capacity(block.len() + 4);
        codec::write_u32(&mut payload, sequence);
        payload.extend_from_slice(block);
        self.send_response(
            ServerResponse::BufferBlock,
            ServerCommand::Subscribe.as_u8(),
            payload,
        );
        sequence
    }

    pub async fn pending_notification_count(&self) -> usize {
        self.state.lock().await.pending_notifications.len()
    }

    pub async fn pending_buffer_block_count(&self) -> usize {
        self.state.lock().await.pending_buffer_blocks.len()
    }

    pub(crate) fn send_configuration_changed(&self) {
        self.send_response(
            ServerResponse::ConfigurationChanged,
            ServerCommand::Subscribe.as_u8(),
            Vec::new(),
        );
    }

    // ---- measurement publication -----------------------------------------

    /// Filters, encodes, and enqueues a batch for this subscriber.
    ///
    /// Failures are absorbed: a slow or broken peer never propagates an error
    /// to the publishing caller.
    pub async fn publish_measurements(&self, measurements: &[Measurement]) {
        if self.is_stopped() || measurements.is_empty() {
            return;
        }

        let mut state = self.state.lock().await;
        if !state.is_subscribed {
            return;
        }
        let cache = match state.signal_index_cache.clone() {
            Some(cache) => cache,
            None => return,
        };

        let now = ticks::now();
        if state.throttled && now - state.last_publish_time < state.publish_interval_ticks {
            return;
        }

        let rotated = match state.base_times.as_mut() {
            Some(base_times) => base_times.rotate_if_needed(now),
            None => false,
        };
        if rotated {
            debug!(
                "\"{}\" base time offsets rotated to index {}",
                self.connection_id,
                state.base_times.map(|b| b.index).unwrap_or_default()
            );
            self.send_base_times(&state);
        }

        if !state.start_time_sent {
            let mut payload = Vec::new();
            codec::write_i64(&mut payload, measurements[0].timestamp);
            self.send_response(
                ServerResponse::DataStartTime,
                ServerCommand::Subscribe.as_u8(),
                payload,
            );
            state.start_time_sent = true;
            if let Some(parent) = self.parent() {
                parent.dispatch(CallbackEvent::Status(format!(
                    "start time sent to \"{}\"",
                    self.connection_id
                )));
            }
        }

        let base_times = state.base_times;
        let include_time = state.include_time;
        let use_millisecond_resolution = state.use_millisecond_resolution;
        let use_compact_format = state.use_compact_format;
        let use_payload_compression = state.use_payload_compression;
        let is_nan_filtered = state.is_nan_filtered;
        state.last_publish_time = now;
        // The state lock stays held through encoding and enqueue: concurrent
        // publish calls on one connection are linearized.

        let serializer = CompactMeasurementCodec::new(
            &cache,
            base_times.as_ref(),
            include_time,
            use_millisecond_resolution,
        );

        let mut packet = Vec::with_capacity(MAX_PACKET_SIZE);
        let mut record = Vec::with_capacity(64);
        let mut count = 0u32;
        let mut sent = 0u64;

        for measurement in measurements {
            if is_nan_filtered && !measurement.value.is_finite() {
                continue;
            }

            let runtime_index = match cache.runtime_index(&measurement.signal_id) {
                Some(index) => index,
                None => continue,
            };

            record.clear();
            if use_compact_format {
                serializer.serialize(measurement, runtime_index, &mut record);
            } else {
                compact::serialize_fixed(measurement, u32::from(runtime_index), &mut record);
            }

            if packet.len() + record.len() > MAX_PACKET_SIZE {
                self.publish_data_packet(&packet, count, use_compact_format, use_payload_compression);
                packet.clear();
                count = 0;
            }

            packet.extend_from_slice(&record);
            count += 1;
            sent += 1;
        }

        if count > 0 {
            self.publish_data_packet(&packet, count, use_compact_format, use_payload_compression);
        }

        if sent > 0 {
            self.measurements_sent.fetch_add(sent, Ordering::Relaxed);
            if let Some(parent) = self.parent() {
                parent.add_measurements_sent(sent);
            }
        }
    }

    fn publish_data_packet(
        &self,
        records: &[u8],
        count: u32,
        compact_format: bool,
        compress: bool,
    ) {
        let mut body = Vec::with_capacity(records.len() + 4);
        codec::write_u32(&mut body, count);
        body.extend_from_slice(records);

        let mut flags = 0u8;
        if compact_format {
            flags |= data_packet_flags::COMPACT;
        }

        if compress {
            match gzip_compress(&body) {
                Ok(compressed) => {
                    body = compressed;
                    flags |= data_packet_flags::COMPRESSED;
                }
                Err(error) => {
                    warn!("\"{}\" payload compression failed: {error}", self.connection_id);
                }
            }
        }

        if self.cipher.keys_defined() {
            match self.cipher.encrypt(&body) {
                Ok((ciphertext, index)) => {
                    body = ciphertext;
                    if index == 1 {
                        flags |= data_packet_flags::CIPHER_INDEX;
                    }
                }
                Err(error) => {
                    warn!("\"{}\" payload encryption failed: {error}", self.connection_id);
                    return;
                }
            }
        }

        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(flags);
        payload.extend_from_slice(&body);

        let channel = if self.udp_target.lock().expect("udp target lock").is_some() {
            ChannelKind::Data
        } else {
            ChannelKind::Command
        };
        self.enqueue(channel, self.frame(ServerResponse::DataPacket, ServerCommand::Subscribe.as_u8(), payload));
    }

    fn send_base_times(&self, state: &ConnectionState) {
        let base_times = match state.base_times {
            Some(base_times) => base_times,
            None => return,
        };

        let mut payload = Vec::with_capacity(20);
        codec::write_i32(&mut payload, base_times.index as i32);
        codec::write_i64(&mut payload, base_times.offsets[0]);
        codec::write_i64(&mut payload, base_times.offsets[1]);
        self.send_response(
            ServerResponse::UpdateBaseTimes,
            ServerCommand::Subscribe.as_u8(),
            payload,
        );
    }

    // ---- send path -------------------------------------------------------

    fn frame(&self, response: ServerResponse, command_code: u8, payload: Vec<u8>) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 6);
        frame.push(response as u8);
        frame.push(command_code);
        codec::write_u32(&mut frame, payload.len() as u32);
        frame.extend_from_slice(&payload);
        frame
    }

    fn send_response(&self, response: ServerResponse, command_code: u8, payload: Vec<u8>) {
        self.enqueue(ChannelKind::Command, self.frame(response, command_code, payload));
    }

    async fn send_failed(&self, command_code: u8, message: &str) {
        let encoding = self.state.lock().await.encoding;
        self.send_response(ServerResponse::Failed, command_code, encoding.encode(message));
    }

    fn enqueue(&self, channel: ChannelKind, bytes: Vec<u8>) {
        if self.is_stopped() {
            return;
        }

        match self.send_tx.try_send(OutboundFrame::Write { channel, bytes }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let error = PublisherError::ResourceExhausted(format!(
                    "send queue full for \"{}\"; frame dropped",
                    self.connection_id
                ));
                if let Some(parent) = self.parent() {
                    parent.dispatch(CallbackEvent::Error(error.to_string()));
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn run_write_queue(
        self: std::sync::Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut receiver: mpsc::Receiver<OutboundFrame>,
    ) {
        while let Some(frame) = receiver.recv().await {
            let (channel, bytes) = match frame {
                OutboundFrame::Write { channel, bytes } => (channel, bytes),
                OutboundFrame::Shutdown => break,
            };
            let length = bytes.len() as u64;

            let udp = if channel == ChannelKind::Data {
                self.udp_target.lock().expect("udp target lock").clone()
            } else {
                None
            };

            let result = match &udp {
                Some((socket, target)) => socket.send_to(&bytes, *target).await.map(|_| ()),
                None => write_half.write_all(&bytes).await,
            };

            match result {
                Ok(()) => {
                    let parent = self.parent();
                    if udp.is_some() {
                        self.data_channel_bytes_sent.fetch_add(length, Ordering::Relaxed);
                        if let Some(parent) = parent {
                            parent.add_data_channel_bytes(length);
                        }
                    } else {
                        self.command_channel_bytes_sent.fetch_add(length, Ordering::Relaxed);
                        if let Some(parent) = parent {
                            parent.add_command_channel_bytes(length);
                        }
                    }
                }
                Err(error) => {
                    if !self.is_stopped() {
                        if let Some(parent) = self.parent() {
                            parent.dispatch(CallbackEvent::Error(format!(
                                "error writing to client \"{}\": {error}",
                                self.connection_id
                            )));
                        }
                    }
                    let _ = write_half.shutdown().await;
                    self.stop().await;
                    return;
                }
            }
        }

        let _ = write_half.shutdown().await;
    }

    // ---- timers ----------------------------------------------------------

    async fn run_ping_timer(self: std::sync::Arc<Self>) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await; // immediate first tick

        loop {
            interval.tick().await;
            if self.is_stopped() {
                return;
            }

            let idle = self.last_receive.lock().expect("receive clock lock").elapsed();

            if idle >= IDLE_TIMEOUT {
                if let Some(parent) = self.parent() {
                    parent.dispatch(CallbackEvent::Error(format!(
                        "no traffic from \"{}\" in {}s; terminating",
                        self.connection_id,
                        idle.as_secs()
                    )));
                }
                self.stop().await;
                return;
            }

            if idle >= PING_INTERVAL {
                self.send_response(
                    ServerResponse::NoOp,
                    ServerCommand::Subscribe.as_u8(),
                    Vec::new(),
                );
            }
        }
    }

    async fn run_rotation_timer(self: std::sync::Arc<Self>, period_ms: u64) {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
        interval.tick().await; // immediate first tick

        loop {
            interval.tick().await;
            if self.is_stopped() {
                return;
            }
            if self.cipher.keys_defined() {
                self.rotate_cipher_keys();
            }
        }
    }
}

/// Builds the human-readable subscription description from an
/// `assemblyInfo`-style connection string.
fn parse_subscription_info(value: &str) -> String {
    let parsed = settings::parse_key_value_pairs(value).unwrap_or_default();

    let source = parsed.get("source").filter(|s| !s.is_empty()).unwrap_or("unknown source");
    let version = parsed.get("version").filter(|s| !s.is_empty()).unwrap_or("?.?.?.?");
    let build_date = parsed.get("buildDate").filter(|s| !s.is_empty()).unwrap_or("undefined date");

    format!("{source} version {version} built on {build_date}")
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_info_defaults() {
        assert_eq!(
            parse_subscription_info(""),
            "unknown source version ?.?.?.? built on undefined date"
        );
        assert_eq!(
            parse_subscription_info("source=GEP Tester; version=2.1.0; buildDate=2024-06-01"),
            "GEP Tester version 2.1.0 built on 2024-06-01"
        );
    }

    #[test]
    fn test_gzip_roundtrip() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let data = vec![7u8; 4096];
        let compressed = gzip_compress(&data).expect("compress");
        assert!(compressed.len() < data.len());

        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).expect("decompress");
        assert_eq!(decompressed, data);
    }
}
