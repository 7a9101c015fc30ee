/// Peer manager for catch-up.
///
/// Tracks which peers are serving block batches, whether they are still
/// connected, and how well they deliver.
use std::collections::{HashMap, HashSet};

use libp2p_identity::PeerId;

use crate::types::ConnectionState;

/// Catch-up specific peer state.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub peer_id: PeerId,
    pub connection_state: ConnectionState,
    pub batches_in_flight: usize,
    pub blocks_delivered: u64,
    pub blocks_missed: u64,
}

impl SyncPeer {
    pub fn new(peer_id: PeerId, connection_state: ConnectionState) -> Self {
        Self {
            peer_id,
            connection_state,
            batches_in_flight: 0,
            blocks_delivered: 0,
            blocks_missed: 0,
        }
    }

    /// Check if peer is connected.
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Mark that a batch has been sent to this peer.
    pub fn on_batch_start(&mut self) {
        self.batches_in_flight += 1;
    }

    /// Mark that a batch has settled, with `missed` blocks left unresolved.
    pub fn on_batch_complete(&mut self, missed: usize) {
        self.batches_in_flight = self.batches_in_flight.saturating_sub(1);
        self.blocks_missed += missed as u64;
    }

    pub fn on_block_delivered(&mut self) {
        self.blocks_delivered += 1;
    }
}

/// Peer manager for catch-up.
///
/// Shared between the batch fetchers and the message dispatchers, so the
/// catch-up keeps it behind a mutex.
#[derive(Debug, Default, Clone)]
pub struct PeerManager {
    peers: HashMap<PeerId, SyncPeer>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer to the manager.
    pub fn add_peer(
        &mut self,
        peer_id: PeerId,
        connection_state: ConnectionState,
    ) -> &mut SyncPeer {
        self.peers
            .entry(peer_id)
            .or_insert_with(|| SyncPeer::new(peer_id, connection_state))
    }

    /// Get a peer by ID.
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&SyncPeer> {
        self.peers.get(peer_id)
    }

    /// Update peer connection state.
    pub fn update_connection_state(&mut self, peer_id: &PeerId, state: ConnectionState) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.connection_state = state;
        }
    }

    pub fn mark_disconnected(&mut self, peer_id: &PeerId) {
        self.update_connection_state(peer_id, ConnectionState::Disconnected);
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|peer| peer.is_connected())
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &SyncPeer> {
        self.peers.values().filter(|peer| peer.is_connected())
    }

    /// True when no connected peer is left outside `tried`.
    ///
    /// A block in that situation cannot be fetched any more.
    pub fn all_tried(&self, tried: &HashSet<PeerId>) -> bool {
        self.connected_peers()
            .all(|peer| tried.contains(&peer.peer_id))
    }

    /// Mark that a batch has been sent to a peer.
    pub fn on_batch_start(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_batch_start();
        }
    }

    /// Mark that a batch sent to a peer has settled.
    pub fn on_batch_complete(&mut self, peer_id: &PeerId, missed: usize) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_batch_complete(missed);
        }
    }

    /// Credit a peer with a block that resolved a pending fetch.
    pub fn on_block_delivered(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_block_delivered();
        }
    }

    /// Get all tracked peers.
    pub fn get_all_peers(&self) -> impl Iterator<Item = &SyncPeer> {
        self.peers.values()
    }
}
