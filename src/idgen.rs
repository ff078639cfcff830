//! # ID Generation
//!
//! Snowflake-style 63-bit identifiers:
//!
//! ```text
//! 0 | timestamp (41 bits, ms since epoch) | node (10 bits) | sequence (12 bits)
//! ```
//!
//! IDs from one generator are strictly increasing. Distinct nodes never collide
//! because the node occupies its own bit range.

use crate::config::IdGenConfig;
use crate::model::{EntityId, Millis};
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use time::macros::format_description;
use time::Date;

pub const TIMESTAMP_BITS: u32 = 41;
pub const NODE_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;
pub const MAX_NODE: u16 = (1 << NODE_BITS) - 1;

const NODE_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = NODE_BITS + SEQUENCE_BITS;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const NODE_MASK: i64 = (1 << NODE_BITS) - 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdGenError {
    #[error("fails to parse epoch {epoch:?}: {reason}")]
    InvalidEpoch { epoch: String, reason: String },
    #[error("epoch {0} is in the future")]
    EpochInFuture(String),
    #[error("node id {0} exceeds the maximum of {max}", max = MAX_NODE)]
    NodeOutOfRange(u16),
    #[error("node id {0} is already bound by another generator")]
    NodeInUse(u16),
}

/// Node ids currently bound by live generators.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    bound: Arc<Mutex<HashSet<u16>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self, node: u16) -> bool {
        self.bound.lock().contains(&node)
    }

    fn bind(&self, node: u16) -> Result<NodeLease, IdGenError> {
        if !self.bound.lock().insert(node) {
            return Err(IdGenError::NodeInUse(node));
        }
        Ok(NodeLease {
            registry: self.clone(),
            node,
        })
    }
}

#[derive(Debug)]
struct NodeLease {
    registry: NodeRegistry,
    node: u16,
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.registry.bound.lock().remove(&self.node);
    }
}

/// Decomposed identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    /// Milliseconds since the generator epoch.
    pub elapsed_ms: i64,
    pub node: u16,
    pub sequence: u16,
}

#[derive(Debug)]
struct TickState {
    last_ms: i64,
    sequence: i64,
}

#[derive(Debug)]
pub struct IdGenerator {
    epoch: Millis,
    node: u16,
    state: Mutex<TickState>,
    _lease: Option<NodeLease>,
}

impl IdGenerator {
    /// Creates a generator without registering its node.
    pub fn new(epoch: &str, node: u16) -> Result<Self, IdGenError> {
        Self::build(epoch, node, None)
    }

    /// Creates a generator and binds `node` in `registry` for its lifetime.
    pub fn bind(registry: &NodeRegistry, epoch: &str, node: u16) -> Result<Self, IdGenError> {
        if node > MAX_NODE {
            return Err(IdGenError::NodeOutOfRange(node));
        }
        let lease = registry.bind(node)?;
        Self::build(epoch, node, Some(lease))
    }

    pub fn from_config(config: &IdGenConfig, registry: &NodeRegistry) -> Result<Self, IdGenError> {
        Self::bind(registry, &config.epoch, config.node)
    }

    fn build(epoch: &str, node: u16, lease: Option<NodeLease>) -> Result<Self, IdGenError> {
        if node > MAX_NODE {
            return Err(IdGenError::NodeOutOfRange(node));
        }
        let epoch_ms = parse_epoch(epoch)?;
        if epoch_ms > Millis::now() {
            return Err(IdGenError::EpochInFuture(epoch.to_string()));
        }
        Ok(Self {
            epoch: epoch_ms,
            node,
            state: Mutex::new(TickState {
                last_ms: -1,
                sequence: 0,
            }),
            _lease: lease,
        })
    }

    pub fn node(&self) -> u16 {
        self.node
    }

    pub fn epoch(&self) -> Millis {
        self.epoch
    }

    pub fn next_id(&self) -> EntityId {
        let mut state = self.state.lock();
        let mut now = self.elapsed_ms().max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this tick: wait for the clock to move.
                while now <= state.last_ms {
                    std::thread::yield_now();
                    now = self.elapsed_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;
        EntityId((now << TIMESTAMP_SHIFT) | ((self.node as i64) << NODE_SHIFT) | state.sequence)
    }

    /// Wall-clock time embedded in an id produced by this generator.
    pub fn timestamp_of(&self, id: EntityId) -> Millis {
        Millis(self.epoch.0 + decompose(id).elapsed_ms)
    }

    fn elapsed_ms(&self) -> i64 {
        Millis::now().0 - self.epoch.0
    }
}

pub fn decompose(id: EntityId) -> IdParts {
    IdParts {
        elapsed_ms: id.0 >> TIMESTAMP_SHIFT,
        node: ((id.0 >> NODE_SHIFT) & NODE_MASK) as u16,
        sequence: (id.0 & SEQUENCE_MASK) as u16,
    }
}

/// Parses a `YYYY-MM-DD` date as UTC midnight.
fn parse_epoch(epoch: &str) -> Result<Millis, IdGenError> {
    let date = Date::parse(epoch, format_description!("[year]-[month]-[day]")).map_err(|err| {
        IdGenError::InvalidEpoch {
            epoch: epoch.to_string(),
            reason: err.to_string(),
        }
    })?;
    Ok(Millis::from_datetime(date.midnight().assume_utc()))
}
