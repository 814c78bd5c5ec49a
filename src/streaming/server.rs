//! OpenIGTLink broadcast server: acceptor thread, client registry,
//! disconnect path.
//!
//! Exactly one acceptor thread and one data-sender thread run while the
//! service is active. Each accepted connection gets a process-wide
//! monotonically increasing id, the default subscription, the configured
//! socket timeouts, and its own receiver thread.

use crate::core::{Clock, FrameBuffer};
use crate::error::{Error, Result};
use crate::igtl::factory::ClientSubscription;
use crate::igtl::OutboundMessage;
use crate::streaming::client::ClientRecord;
use crate::streaming::commands::{CommandHandler, CommandProcessor};
use crate::streaming::{receiver, sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default client socket timeout; the keep-alive default is half of it.
pub const CLIENT_SOCKET_TIMEOUT_SEC: f64 = 0.5;

/// Accept poll interval; bounds how fast a shutdown request is observed.
const ACCEPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Server configuration (see `config.rs` for the TOML keys).
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listening_port: u16,
    /// Channel to broadcast; empty means "first available"
    pub output_channel_id: String,
    pub missing_input_grace_period_sec: f64,
    pub max_time_spent_with_processing_ms: f64,
    pub max_number_of_igtl_messages_to_send: usize,
    pub number_of_retry_attempts: u32,
    pub delay_between_retry_attempts_sec: f64,
    pub keep_alive_interval_sec: f64,
    pub send_valid_transforms_only: bool,
    pub igtl_message_crc_check_enabled: bool,
    pub log_warning_on_no_data_available: bool,
    pub client_send_timeout_sec: f64,
    pub client_receive_timeout_sec: f64,
    pub default_subscription: ClientSubscription,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listening_port: 18944,
            output_channel_id: String::new(),
            missing_input_grace_period_sec: 0.0,
            max_time_spent_with_processing_ms: 50.0,
            max_number_of_igtl_messages_to_send: 100,
            number_of_retry_attempts: 10,
            delay_between_retry_attempts_sec: 0.05,
            keep_alive_interval_sec: CLIENT_SOCKET_TIMEOUT_SEC / 2.0,
            send_valid_transforms_only: true,
            igtl_message_crc_check_enabled: false,
            log_warning_on_no_data_available: true,
            client_send_timeout_sec: CLIENT_SOCKET_TIMEOUT_SEC,
            client_receive_timeout_sec: CLIENT_SOCKET_TIMEOUT_SEC,
            default_subscription: ClientSubscription::default(),
        }
    }
}

/// State shared by the acceptor, the sender, and every receiver thread.
pub(crate) struct ServerInner {
    pub settings: ServerSettings,
    pub buffer: Arc<FrameBuffer>,
    pub clock: Clock,
    pub clients: Mutex<Vec<ClientRecord>>,
    /// Pending outbound replies per client id. Lock order: never taken
    /// while holding the clients lock.
    pub response_queue: Mutex<HashMap<u64, Vec<OutboundMessage>>>,
    pub processor: CommandProcessor,
    pub active: AtomicBool,
    client_id_counter: AtomicU64,
    pub broadcast_start: Mutex<f64>,
}

impl ServerInner {
    pub fn number_of_connected_clients(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn has_grace_period_expired(&self) -> bool {
        let start = *self.broadcast_start.lock();
        self.clock.now_sec() - start > self.settings.missing_input_grace_period_sec
    }

    /// Queue a reply for delivery by the sender pump. Fails when the client
    /// is no longer connected.
    pub fn queue_message_response(&self, client_id: u64, message: OutboundMessage) -> Result<()> {
        let found = self.clients.lock().iter().any(|c| c.id == client_id);
        if !found {
            return Err(Error::Other(format!(
                "client {} not found in list",
                client_id
            )));
        }
        self.response_queue
            .lock()
            .entry(client_id)
            .or_default()
            .push(message);
        Ok(())
    }

    /// Remove a client: stop its receiver, close the socket, drop the
    /// record. The registry lock is released before joining the thread.
    pub fn disconnect_client(&self, client_id: u64) {
        let record = {
            let mut clients = self.clients.lock();
            let Some(index) = clients.iter().position(|c| c.id == client_id) else {
                return;
            };
            let record = clients.remove(index);
            record.receiver_active.store(false, Ordering::Relaxed);
            let _ = record.stream.shutdown(Shutdown::Both);
            record
        };

        let peer = record.peer();
        let mut record = record;
        while record.receiver_ack.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(200));
        }
        if let Some(handle) = record.receiver_handle.take() {
            let _ = handle.join();
        }
        self.response_queue.lock().remove(&client_id);

        log::info!(
            "Client disconnected ({}). Number of connected clients: {}",
            peer,
            self.number_of_connected_clients()
        );
    }
}

pub struct IgtlServer {
    inner: Arc<ServerInner>,
    port: u16,
    acceptor_handle: Option<JoinHandle<()>>,
    sender_handle: Option<JoinHandle<()>>,
    acceptor_ack: Arc<AtomicBool>,
    sender_ack: Arc<AtomicBool>,
}

impl IgtlServer {
    pub fn new(
        settings: ServerSettings,
        buffer: Arc<FrameBuffer>,
        clock: Clock,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(ServerInner {
                settings,
                buffer,
                clock,
                clients: Mutex::new(Vec::new()),
                response_queue: Mutex::new(HashMap::new()),
                processor: CommandProcessor::new(handler)?,
                active: AtomicBool::new(false),
                client_id_counter: AtomicU64::new(1),
                broadcast_start: Mutex::new(0.0),
            }),
            port: 0,
            acceptor_handle: None,
            sender_handle: None,
            acceptor_ack: Arc::new(AtomicBool::new(false)),
            sender_ack: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Actual listening port; differs from the configured one when it was 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn number_of_connected_clients(&self) -> usize {
        self.inner.number_of_connected_clients()
    }

    /// Bind the listening socket and spawn the acceptor and sender threads.
    pub fn start(&mut self) -> Result<()> {
        let settings = &self.inner.settings;
        if !settings.output_channel_id.is_empty()
            && settings.output_channel_id != self.inner.buffer.channel_id()
        {
            return Err(Error::Config(format!(
                "OutputChannelId not found: {}",
                settings.output_channel_id
            )));
        }

        let listener = TcpListener::bind(("0.0.0.0", settings.listening_port))?;
        self.port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        self.inner.active.store(true, Ordering::SeqCst);
        *self.inner.broadcast_start.lock() = self.inner.clock.now_sec();

        let inner = Arc::clone(&self.inner);
        let ack = Arc::clone(&self.acceptor_ack);
        self.acceptor_handle = Some(
            thread::Builder::new()
                .name("igtl-acceptor".to_string())
                .spawn(move || acceptor_loop(inner, listener, ack))
                .map_err(|e| Error::Other(format!("failed to spawn acceptor: {}", e)))?,
        );

        let inner = Arc::clone(&self.inner);
        let ack = Arc::clone(&self.sender_ack);
        self.sender_handle = Some(
            thread::Builder::new()
                .name("igtl-data-sender".to_string())
                .spawn(move || sender::sender_loop(inner, ack))
                .map_err(|e| Error::Other(format!("failed to spawn data sender: {}", e)))?,
        );

        log::info!("OpenIGTLink server listening on port {}", self.port);
        Ok(())
    }

    /// Cooperative shutdown: clear the active flag, wait for the acceptor
    /// and sender to acknowledge, then disconnect every client.
    pub fn stop(&mut self) {
        self.inner.active.store(false, Ordering::SeqCst);

        if let Some(handle) = self.acceptor_handle.take() {
            while self.acceptor_ack.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(200));
            }
            let _ = handle.join();
        }
        if let Some(handle) = self.sender_handle.take() {
            while self.sender_ack.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(200));
            }
            let _ = handle.join();
        }

        let client_ids: Vec<u64> = self.inner.clients.lock().iter().map(|c| c.id).collect();
        for id in client_ids {
            self.inner.disconnect_client(id);
        }

        log::info!("OpenIGTLink server stopped");
    }
}

impl Drop for IgtlServer {
    fn drop(&mut self) {
        if self.inner.active.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

fn acceptor_loop(inner: Arc<ServerInner>, listener: TcpListener, ack: Arc<AtomicBool>) {
    ack.store(true, Ordering::Relaxed);

    while inner.active.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => admit_client(&inner, stream),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_TIMEOUT);
            }
            Err(e) => {
                log::error!("Error accepting client connection: {}", e);
            }
        }
    }

    ack.store(false, Ordering::Relaxed);
    log::debug!("Acceptor thread stopped");
}

fn admit_client(inner: &Arc<ServerInner>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    if let Err(e) = stream.set_nonblocking(false) {
        log::warn!("Failed to configure socket for client {}: {}", peer, e);
        return;
    }
    let settings = &inner.settings;
    let _ = stream.set_read_timeout(Some(Duration::from_secs_f64(
        settings.client_receive_timeout_sec,
    )));
    let _ = stream.set_write_timeout(Some(Duration::from_secs_f64(
        settings.client_send_timeout_sec,
    )));
    let _ = stream.set_nodelay(true);

    let receiver_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            log::error!("Failed to clone client stream: {}", e);
            return;
        }
    };

    let client_id = inner.client_id_counter.fetch_add(1, Ordering::SeqCst);
    let receiver_active = Arc::new(AtomicBool::new(true));
    let receiver_ack = Arc::new(AtomicBool::new(false));

    let thread_inner = Arc::clone(inner);
    let thread_active = Arc::clone(&receiver_active);
    let thread_ack = Arc::clone(&receiver_ack);
    let handle = match thread::Builder::new()
        .name(format!("igtl-receiver-{}", client_id))
        .spawn(move || {
            receiver::receiver_loop(thread_inner, client_id, receiver_stream, thread_active, thread_ack)
        }) {
        Ok(h) => h,
        Err(e) => {
            log::error!("Failed to spawn receiver thread: {}", e);
            return;
        }
    };

    let count;
    {
        let mut clients = inner.clients.lock();
        clients.push(ClientRecord {
            id: client_id,
            stream,
            subscription: settings.default_subscription.clone(),
            receiver_active,
            receiver_ack,
            receiver_handle: Some(handle),
        });
        count = clients.len();
    }

    log::info!(
        "Received new client connection (client {} at {}). Number of connected clients: {}",
        client_id,
        peer,
        count
    );
}
