/// Event publication for in-process consumers and the terminal monitor
use crate::types::ChatEvent;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct EventEmitter {
    tx: broadcast::Sender<ChatEvent>,
    monitor_port: u16,
}

impl EventEmitter {
    pub fn new(monitor_port: u16) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx, monitor_port }
    }

    /// Subscribe to the in-process event stream
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    /// Publish an event: broadcast in-process, then best-effort UDP datagram
    /// for the monitor. Neither path can fail the caller.
    pub async fn emit(&self, event: ChatEvent) {
        let _ = self.tx.send(event.clone());

        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(_) => return,
        };
        if let Ok(sock) = UdpSocket::bind("127.0.0.1:0").await {
            let _ = sock
                .send_to(payload.as_bytes(), ("127.0.0.1", self.monitor_port))
                .await;
        }
    }
}

impl Clone for EventEmitter {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            monitor_port: self.monitor_port,
        }
    }
}
