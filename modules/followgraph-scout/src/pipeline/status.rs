//! Per-worker status, published over watch channels.
//!
//! Each worker owns a [`StatusReporter`] and writes its state as it moves
//! between accounts. Readers take a [`StatusSnapshot`] from the
//! [`StatusBoard`]; nothing in the pipeline reads it back.

use std::collections::BTreeMap;
use std::fmt;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerRole {
    Profile,
    Content,
    Followers,
    Following,
    Connections,
    FollowersQueue,
    FollowingQueue,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 7] = [
        WorkerRole::Profile,
        WorkerRole::Content,
        WorkerRole::Followers,
        WorkerRole::Following,
        WorkerRole::Connections,
        WorkerRole::FollowersQueue,
        WorkerRole::FollowingQueue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRole::Profile => "profile",
            WorkerRole::Content => "content",
            WorkerRole::Followers => "followers",
            WorkerRole::Following => "following",
            WorkerRole::Connections => "connections",
            WorkerRole::FollowersQueue => "followers_queue",
            WorkerRole::FollowingQueue => "following_queue",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WorkerState {
    #[default]
    Idle,
    /// Handling the account with this handle.
    Working { account: String },
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => f.write_str("idle"),
            WorkerState::Working { account } => write!(f, "working on @{account}"),
            WorkerState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Write side of one role's status.
pub struct StatusReporter {
    tx: watch::Sender<WorkerState>,
}

impl StatusReporter {
    pub fn working(&self, handle: &str) {
        self.tx.send_replace(WorkerState::Working {
            account: handle.to_string(),
        });
    }

    pub fn idle(&self) {
        self.tx.send_replace(WorkerState::Idle);
    }

    pub fn stopped(&self) {
        self.tx.send_replace(WorkerState::Stopped);
    }
}

/// Read side of every registered role.
#[derive(Default, Clone)]
pub struct StatusBoard {
    roles: BTreeMap<WorkerRole, watch::Receiver<WorkerState>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a role and hand back its reporter. Re-registering replaces the
    /// previous channel.
    pub fn reporter(&mut self, role: WorkerRole) -> StatusReporter {
        let (tx, rx) = watch::channel(WorkerState::Idle);
        self.roles.insert(role, rx);
        StatusReporter { tx }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            states: self
                .roles
                .iter()
                .map(|(role, rx)| (*role, rx.borrow().clone()))
                .collect(),
        }
    }
}

/// Point-in-time copy of every role's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    states: BTreeMap<WorkerRole, WorkerState>,
}

impl StatusSnapshot {
    pub fn get(&self, role: WorkerRole) -> Option<&WorkerState> {
        self.states.get(&role)
    }

    pub fn iter(&self) -> impl Iterator<Item = (WorkerRole, &WorkerState)> {
        self.states.iter().map(|(role, state)| (*role, state))
    }

    pub fn all_stopped(&self) -> bool {
        self.states.values().all(|s| *s == WorkerState::Stopped)
    }

    pub fn busy(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, WorkerState::Working { .. }))
            .count()
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (role, state) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}: {}", role.as_str(), state)?;
        }
        Ok(())
    }
}
