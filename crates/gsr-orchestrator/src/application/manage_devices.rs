//! Device registry: which device is connected over which connection.
//!
//! The `DeviceRegistry` is the controller's in-memory table of live device
//! connections, keyed by device id.  Each entry holds the identity reported
//! in HELLO plus the outbound queue feeding that connection's socket writer.
//!
//! # Reconnects (for beginners)
//!
//! A phone that drops off Wi-Fi often reconnects before the old TCP
//! connection has timed out.  At most one connection per device id may be
//! live, so registering a device that is already present *supersedes* the
//! old entry:
//!
//! ```text
//! conn #1 ── HELLO(dev-a) ──► registry[dev-a] = #1
//! conn #2 ── HELLO(dev-a) ──► registry[dev-a] = #2, #1 told to close
//! conn #1 closes          ──► remove_if_current(dev-a, #1) is a no-op
//! ```
//!
//! Teardown always goes through [`DeviceRegistry::remove_if_current`], so a
//! stale connection can never evict its replacement.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gsr_core::protocol::TimeSyncRequestPayload;
use gsr_core::{DeviceId, Envelope, Payload};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info};

use crate::application::time_sync::ProbeTransport;

/// Live connection of one device.
#[derive(Debug, Clone)]
pub struct DeviceConnection {
    pub connection_id: u64,
    pub device_id: DeviceId,
    pub name: String,
    pub capabilities: Vec<String>,
    pub battery_level: i32,
    pub protocol_version: String,
    pub peer_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub outbound: mpsc::Sender<Envelope>,
    pub closed: Arc<Notify>,
}

impl DeviceConnection {
    /// Asks the owning connection task to shut down.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.clone(),
            name: self.name.clone(),
            capabilities: self.capabilities.clone(),
            battery_level: self.battery_level,
            protocol_version: self.protocol_version.clone(),
            peer_addr: self.peer_addr.to_string(),
            connected_at: self.connected_at,
        }
    }
}

/// Serializable snapshot of a connected device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub name: String,
    pub capabilities: Vec<String>,
    pub battery_level: i32,
    pub protocol_version: String,
    pub peer_addr: String,
    pub connected_at: DateTime<Utc>,
}

/// In-memory registry of connected devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, DeviceConnection>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `conn`, returning the entry it superseded (already told to
    /// close).
    pub async fn register(&self, conn: DeviceConnection) -> Option<DeviceConnection> {
        let device_id = conn.device_id.clone();
        let connection_id = conn.connection_id;
        let previous = self.devices.write().await.insert(device_id.clone(), conn);

        match &previous {
            Some(old) if old.connection_id != connection_id => {
                info!(
                    "device {device_id} reconnected (connection {} supersedes {})",
                    connection_id, old.connection_id
                );
                old.close();
            }
            Some(_) => {}
            None => info!("device {device_id} registered on connection {connection_id}"),
        }
        previous.filter(|old| old.connection_id != connection_id)
    }

    /// Removes `device_id` only while it is still owned by `connection_id`.
    pub async fn remove_if_current(&self, device_id: &str, connection_id: u64) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get(device_id) {
            Some(conn) if conn.connection_id == connection_id => {
                devices.remove(device_id);
                debug!("device {device_id} unregistered (connection {connection_id})");
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceInfo> {
        self.devices.read().await.get(device_id).map(DeviceConnection::info)
    }

    /// All connected devices, sorted by device id.
    pub async fn list(&self) -> Vec<DeviceInfo> {
        let mut all: Vec<DeviceInfo> = self
            .devices
            .read()
            .await
            .values()
            .map(DeviceConnection::info)
            .collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    pub async fn sender(&self, device_id: &str) -> Option<mpsc::Sender<Envelope>> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|c| c.outbound.clone())
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

#[async_trait]
impl ProbeTransport for DeviceRegistry {
    async fn probe_targets(&self) -> Vec<DeviceId> {
        self.devices.read().await.keys().cloned().collect()
    }

    async fn send_probe(
        &self,
        device_id: &str,
        probe: TimeSyncRequestPayload,
    ) -> Result<(), String> {
        let sender = self
            .sender(device_id)
            .await
            .ok_or_else(|| format!("device {device_id} is not connected"))?;
        let envelope = Envelope::new(device_id, Payload::TimeSyncRequest(probe));
        sender.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => format!("outbound queue for {device_id} is full"),
            TrySendError::Closed(_) => format!("connection for {device_id} is closed"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsr_core::MessageType;

    fn make_connection(
        device_id: &str,
        connection_id: u64,
        capacity: usize,
    ) -> (DeviceConnection, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = DeviceConnection {
            connection_id,
            device_id: device_id.to_string(),
            name: format!("{device_id} phone"),
            capabilities: vec!["gsr".to_string()],
            battery_level: 80,
            protocol_version: "1.0".to_string(),
            peer_addr: "127.0.0.1:50000".parse().unwrap(),
            connected_at: Utc::now(),
            outbound: tx,
            closed: Arc::new(Notify::new()),
        };
        (conn, rx)
    }

    #[tokio::test]
    async fn test_registry_starts_empty() {
        let registry = DeviceRegistry::new();
        assert!(registry.is_empty().await);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_adds_device() {
        let registry = DeviceRegistry::new();
        let (conn, _rx) = make_connection("dev-a", 1, 4);

        let superseded = registry.register(conn).await;

        assert!(superseded.is_none());
        let info = registry.get("dev-a").await.unwrap();
        assert_eq!(info.name, "dev-a phone");
        assert_eq!(info.battery_level, 80);
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_and_notifies_old_connection() {
        // Arrange
        let registry = DeviceRegistry::new();
        let (old, _rx1) = make_connection("dev-a", 1, 4);
        let old_closed = Arc::clone(&old.closed);
        registry.register(old).await;
        let (new, _rx2) = make_connection("dev-a", 2, 4);

        // Act
        let superseded = registry.register(new).await;

        // Assert
        assert_eq!(superseded.map(|c| c.connection_id), Some(1));
        assert_eq!(registry.len().await, 1);
        tokio::time::timeout(std::time::Duration::from_secs(1), old_closed.notified())
            .await
            .expect("old connection should be told to close");
    }

    #[tokio::test]
    async fn test_stale_teardown_does_not_remove_replacement() {
        let registry = DeviceRegistry::new();
        let (old, _rx1) = make_connection("dev-a", 1, 4);
        let (new, _rx2) = make_connection("dev-a", 2, 4);
        registry.register(old).await;
        registry.register(new).await;

        let removed = registry.remove_if_current("dev-a", 1).await;

        assert!(!removed);
        assert!(registry.get("dev-a").await.is_some());
        assert!(registry.remove_if_current("dev-a", 2).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_is_sorted_by_device_id() {
        let registry = DeviceRegistry::new();
        let (c, _rc) = make_connection("dev-c", 3, 4);
        let (a, _ra) = make_connection("dev-a", 1, 4);
        let (b, _rb) = make_connection("dev-b", 2, 4);
        registry.register(c).await;
        registry.register(a).await;
        registry.register(b).await;

        let ids: Vec<_> = registry.list().await.into_iter().map(|d| d.device_id).collect();

        assert_eq!(ids, vec!["dev-a", "dev-b", "dev-c"]);
    }

    #[tokio::test]
    async fn test_send_probe_queues_time_sync_request() {
        // Arrange
        let registry = DeviceRegistry::new();
        let (conn, mut rx) = make_connection("dev-a", 1, 4);
        registry.register(conn).await;
        let probe = TimeSyncRequestPayload {
            probe_id: 7,
            reference_ns: 1_000,
        };

        // Act
        registry.send_probe("dev-a", probe).await.unwrap();

        // Assert
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.message_type(), MessageType::TimeSyncRequest);
        assert_eq!(envelope.device_id(), "dev-a");
        assert_eq!(envelope.payload(), &Payload::TimeSyncRequest(probe));
    }

    #[tokio::test]
    async fn test_send_probe_fails_when_queue_is_full() {
        let registry = DeviceRegistry::new();
        let (conn, _rx) = make_connection("dev-a", 1, 1);
        registry.register(conn).await;
        let probe = TimeSyncRequestPayload {
            probe_id: 1,
            reference_ns: 0,
        };

        registry.send_probe("dev-a", probe).await.unwrap();
        let second = registry.send_probe("dev-a", probe).await;

        assert!(second.unwrap_err().contains("full"));
    }

    #[tokio::test]
    async fn test_send_probe_to_unknown_device_fails() {
        let registry = DeviceRegistry::new();
        let probe = TimeSyncRequestPayload {
            probe_id: 1,
            reference_ns: 0,
        };
        assert!(registry.send_probe("ghost", probe).await.is_err());
    }
}
