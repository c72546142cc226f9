//! Cluster peer snapshot consumed by the messenger.
//!
//! The peer list is immutable once constructed; each peer's role and
//! advertised command address are individually lock-protected so the
//! replication subsystem can update them while escalations read them.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Replication role a peer advertises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Searching,
    Following,
    Leading,
    StandingUp,
    StandingDown,
    Waiting,
}

impl PeerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Searching => "searching",
            PeerRole::Following => "following",
            PeerRole::Leading => "leading",
            PeerRole::StandingUp => "standing_up",
            PeerRole::StandingDown => "standing_down",
            PeerRole::Waiting => "waiting",
        }
    }
}

/// One cluster peer. Fields are atomically readable and updatable;
/// the containing list never changes.
#[derive(Debug)]
pub struct Peer {
    name: String,
    role: RwLock<PeerRole>,
    command_address: RwLock<String>,
}

impl Peer {
    pub fn new(
        name: impl Into<String>,
        role: PeerRole,
        command_address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: RwLock::new(role),
            command_address: RwLock::new(command_address.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> PeerRole {
        *self.role.read().expect("peer role lock poisoned")
    }

    pub fn set_role(&self, role: PeerRole) {
        *self.role.write().expect("peer role lock poisoned") = role;
    }

    pub fn command_address(&self) -> String {
        self.command_address
            .read()
            .expect("peer address lock poisoned")
            .clone()
    }

    pub fn set_command_address(&self, address: impl Into<String>) {
        *self
            .command_address
            .write()
            .expect("peer address lock poisoned") = address.into();
    }
}

/// Immutable list of peers with atomically updatable fields.
#[derive(Debug, Default)]
pub struct ClusterState {
    peers: Vec<Arc<Peer>>,
}

impl ClusterState {
    pub fn new(peers: Vec<Arc<Peer>>) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    /// Command address of the first peer that is leading and
    /// advertises one.
    pub fn leader_command_address(&self) -> Option<String> {
        self.peers.iter().find_map(|peer| {
            if peer.role() != PeerRole::Leading {
                return None;
            }
            let address = peer.command_address();
            if address.is_empty() { None } else { Some(address) }
        })
    }
}
