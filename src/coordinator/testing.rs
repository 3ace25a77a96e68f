//! In-memory transport for coordinator tests.

use super::ReplicationNode;
use crate::config::NodeConfig;
use crate::network::{BoxFuture, NetworkError, PeerTransport, StaticPeerDirectory, TransactionStream};
use crate::types::{PeerRegisterInfo, RegisterSnapshot, TransactionNotification};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::Arc;

/// Records every notification sent; peers can be made to fail.
#[derive(Default)]
pub(super) struct RecordingTransport {
    sent: Mutex<Vec<(String, TransactionNotification)>>,
    failing: DashSet<String>,
    advertisements: DashMap<String, Vec<PeerRegisterInfo>>,
}

impl RecordingTransport {
    pub fn fail_peer(&self, peer_id: &str) {
        self.failing.insert(peer_id.to_string());
    }

    pub fn advertise(&self, peer_id: &str, infos: Vec<PeerRegisterInfo>) {
        self.advertisements.insert(peer_id.to_string(), infos);
    }

    pub fn sent(&self) -> Vec<(String, TransactionNotification)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.sent.lock().iter().map(|(p, _)| p.clone()).collect();
        peers.sort();
        peers
    }

    fn check(&self, peer_id: &str) -> Result<(), NetworkError> {
        if self.failing.contains(peer_id) {
            Err(NetworkError::new(format!("{} unreachable", peer_id)))
        } else {
            Ok(())
        }
    }
}

impl PeerTransport for RecordingTransport {
    fn send_notification(&self, peer_id: &str, notification: &TransactionNotification) -> BoxFuture<'_, ()> {
        let result = self.check(peer_id).map(|()| {
            self.sent
                .lock()
                .push((peer_id.to_string(), notification.clone()));
        });
        Box::pin(async move { result })
    }

    fn fetch_register(&self, peer_id: &str, _register_id: &str) -> BoxFuture<'_, RegisterSnapshot> {
        let msg = format!("{} serves no snapshots", peer_id);
        Box::pin(async move { Err(NetworkError(msg)) })
    }

    fn open_transaction_stream(&self, peer_id: &str, _register_id: &str, _from: u64) -> BoxFuture<'_, TransactionStream> {
        let msg = format!("{} serves no streams", peer_id);
        Box::pin(async move { Err(NetworkError(msg)) })
    }

    fn fetch_advertisements(&self, peer_id: &str) -> BoxFuture<'_, Vec<PeerRegisterInfo>> {
        let result = self.check(peer_id).map(|()| {
            self.advertisements
                .get(peer_id)
                .map(|infos| infos.value().clone())
                .unwrap_or_default()
        });
        Box::pin(async move { result })
    }
}

/// A node named "local" whose directory knows `peers`.
pub(super) fn node_with(
    peers: &[&str],
) -> (ReplicationNode, Arc<StaticPeerDirectory>, Arc<RecordingTransport>) {
    node_with_config(NodeConfig::for_testing("local"), peers)
}

pub(super) fn node_with_config(
    config: NodeConfig,
    peers: &[&str],
) -> (ReplicationNode, Arc<StaticPeerDirectory>, Arc<RecordingTransport>) {
    let directory = Arc::new(StaticPeerDirectory::with_peers(peers.iter().copied()));
    let transport = Arc::new(RecordingTransport::default());
    let node = ReplicationNode::new(
        config,
        directory.clone(),
        transport.clone(),
    );
    (node, directory, transport)
}
