// src/core/cluster/mod.rs

//! Cluster membership, master election and failover.
//!
//! Every node runs the same process; the submodules here decide which node is
//! currently allowed to drive the shard pipeline:
//! - `registry` tracks known peers and their reusable connections,
//! - `client` is the internal RPC client used to talk to peers,
//! - `election` implements the follower/candidate/leader state machine,
//! - `announcer` broadcasts leader authority while this node is master,
//! - `monitor` watches the leader (and, on the master, all other nodes).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use strum_macros::{Display, EnumString};

pub mod announcer;
pub mod client;
pub mod election;
pub mod monitor;
pub mod registry;

/// The externally visible role of a node. Derived from cluster state, not
/// from configuration alone.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeRole {
    Master,
    BackupMaster,
    #[default]
    Worker,
}

/// The internal election state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

/// All mutable election bookkeeping for the local node.
///
/// Protected by a single mutex in `ServerState`; critical sections never span
/// an await point.
#[derive(Debug)]
pub struct ElectionState {
    pub role: NodeRole,
    pub state: NodeState,
    /// Monotonically non-decreasing election epoch.
    pub current_term: u64,
    /// The candidate granted a vote in `current_term`, if any.
    pub voted_for: Option<String>,
    /// Address of the leader this node currently follows (or is).
    pub leader_address: Option<String>,
    /// Address of the designated backup master, if announced.
    pub backup_address: Option<String>,
    /// Last valid leader contact.
    pub last_heartbeat: Instant,
    /// Consecutive failed election rounds; drives timeout backoff.
    pub election_attempts: u32,
    /// Current randomized election timeout.
    pub election_timeout: Duration,
}

impl ElectionState {
    pub fn new(role: NodeRole, base_timeout: Duration) -> Self {
        let base = base_timeout.as_secs_f64();
        let timeout = rand::thread_rng().gen_range(base..base * 1.5);
        Self {
            role,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            leader_address: None,
            backup_address: None,
            last_heartbeat: Instant::now(),
            election_attempts: 0,
            election_timeout: Duration::from_secs_f64(timeout),
        }
    }

    /// Adopts a higher term. Clears the per-term vote; terms never decrease.
    pub fn adopt_term(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
    }

    /// Re-arms the election timer with randomized exponential backoff:
    /// uniform over `[base * 1.5^min(attempts, 5), 1.5 * that]`.
    pub fn reset_election_timer(&mut self, base_timeout: Duration) {
        self.election_attempts += 1;
        let backoff = 1.5f64.powi(self.election_attempts.min(5) as i32);
        let min_timeout = base_timeout.as_secs_f64() * backoff;
        let timeout = rand::thread_rng().gen_range(min_timeout..min_timeout * 1.5);
        self.election_timeout = Duration::from_secs_f64(timeout);
        self.last_heartbeat = Instant::now();
    }

    /// Records a valid leader contact: the timeout is rewound and the
    /// backoff counter cleared.
    pub fn record_leader_contact(&mut self) {
        self.last_heartbeat = Instant::now();
        self.election_attempts = 0;
    }

    /// True while this node believes it leads the current term.
    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }
}
