//! Connected-client records.

use crate::igtl::factory::ClientSubscription;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

/// One connected client: socket, subscription, and its receiver thread.
///
/// The liveness pair mirrors the rest of the daemon's threads: `active` is
/// the request flag the receiver observes, `ack` is true while the thread
/// runs. The registry owns the record; the receiver thread holds only the
/// id, a socket clone, and the flags.
pub struct ClientRecord {
    pub id: u64,
    pub stream: TcpStream,
    pub subscription: ClientSubscription,
    pub receiver_active: Arc<AtomicBool>,
    pub receiver_ack: Arc<AtomicBool>,
    pub receiver_handle: Option<JoinHandle<()>>,
}

impl ClientRecord {
    pub fn peer(&self) -> String {
        self.stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}
