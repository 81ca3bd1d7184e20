//! Hybrid logical clocks.
//!
//! A hybrid logical clock (HLC) combines a wall-clock reading with a logical
//! counter so that timestamps stay close to physical time while still giving
//! a total order that respects causality: if a node observed a remote
//! timestamp before issuing its own, its own timestamp compares greater.
//!
//! The canonical textual form is `"<wallMs>:<counter>:<nodeId>"` and is the
//! form HLCs take on the wire and in storage.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use ripple_time::TimeProvider;
use snafu::{ensure, ResultExt, Snafu};
use std::{fmt::Display, str::FromStr, sync::Arc};

/// Errors raised when parsing HLC text or validating node identities.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display(
        "invalid HLC {text:?}: expected three colon-separated fields \"<wallMs>:<counter>:<nodeId>\""
    ))]
    MalformedHlc { text: String },

    #[snafu(display("invalid HLC {text:?}: wall-clock milliseconds are not a number"))]
    InvalidWallMillis {
        text: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("invalid HLC {text:?}: counter is not a number"))]
    InvalidCounter {
        text: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("invalid node id {id:?}: must be non-empty and must not contain ':'"))]
    InvalidNodeId { id: String },
}

/// The identity of the node that issued a timestamp.
///
/// Node ids are opaque, non-empty strings that never contain `:` (the HLC
/// field separator). They are cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Validate and wrap a node id.
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        ensure!(!id.is_empty() && !id.contains(':'), InvalidNodeIdSnafu { id });
        Ok(Self(id.into()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for NodeId {
    type Error = Error;

    fn try_from(id: &str) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

/// A hybrid logical clock timestamp.
///
/// Timestamps order by wall-clock milliseconds, then counter, then node id,
/// which the derived `Ord` implements directly via field order. Two
/// timestamps are equal only when all three components match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hlc {
    wall_ms: u64,
    counter: u64,
    node_id: NodeId,
}

impl Hlc {
    /// Assemble a timestamp from its components.
    pub fn new(wall_ms: u64, counter: u64, node_id: NodeId) -> Self {
        Self {
            wall_ms,
            counter,
            node_id,
        }
    }

    /// Wall-clock milliseconds since the Unix epoch.
    pub fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    /// Logical counter, disambiguating events within one millisecond.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// The issuing node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

impl Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.wall_ms, self.counter, self.node_id)
    }
}

impl FromStr for Hlc {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let fields: Vec<_> = text.split(':').collect();
        ensure!(fields.len() == 3, MalformedHlcSnafu { text });

        let wall_ms = fields[0]
            .parse::<u64>()
            .context(InvalidWallMillisSnafu { text })?;
        let counter = fields[1]
            .parse::<u64>()
            .context(InvalidCounterSnafu { text })?;
        let node_id = NodeId::new(fields[2])?;

        Ok(Self::new(wall_ms, counter, node_id))
    }
}

impl serde::Serialize for Hlc {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Hlc {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = <String as serde::Deserialize<'de>>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-node clock state issuing [`Hlc`] timestamps.
///
/// The clock is deliberately not internally synchronized: `tick` and
/// `observe` take `&mut self` and callers own the clock behind a single
/// writer or a mutex. Wall time comes from an injected
/// [`TimeProvider`] so tests can drive the clock deterministically.
#[derive(Debug)]
pub struct HlcClock {
    node_id: NodeId,
    time_provider: Arc<dyn TimeProvider>,
    last_wall_ms: u64,
    counter: u64,
}

impl HlcClock {
    /// Create a clock for `node_id` starting at `(0, 0)`.
    pub fn new(node_id: NodeId, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            node_id,
            time_provider,
            last_wall_ms: 0,
            counter: 0,
        }
    }

    /// The node this clock issues timestamps for.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Issue a timestamp for a local event.
    ///
    /// Successive ticks are strictly increasing, even when the wall clock
    /// stalls or steps backwards.
    pub fn tick(&mut self) -> Hlc {
        let now_ms = self.now_ms();
        self.tick_at(now_ms)
    }

    /// [`tick`](Self::tick) with an explicit wall-clock reading.
    pub fn tick_at(&mut self, now_ms: u64) -> Hlc {
        if now_ms > self.last_wall_ms {
            self.last_wall_ms = now_ms;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        Hlc::new(self.last_wall_ms, self.counter, self.node_id.clone())
    }

    /// Fold a remote timestamp into this clock and issue a timestamp that
    /// compares strictly greater than both the remote one and every
    /// previously issued local one.
    pub fn observe(&mut self, remote: &Hlc) -> Hlc {
        let now_ms = self.now_ms();
        self.observe_at(remote, now_ms)
    }

    /// [`observe`](Self::observe) with an explicit wall-clock reading.
    pub fn observe_at(&mut self, remote: &Hlc, now_ms: u64) -> Hlc {
        let wall_ms = now_ms.max(self.last_wall_ms).max(remote.wall_ms());

        let counter = if wall_ms == self.last_wall_ms && wall_ms == remote.wall_ms() {
            self.counter.max(remote.counter()) + 1
        } else if wall_ms == self.last_wall_ms {
            self.counter + 1
        } else if wall_ms == remote.wall_ms() {
            remote.counter() + 1
        } else {
            0
        };

        self.last_wall_ms = wall_ms;
        self.counter = counter;
        Hlc::new(wall_ms, counter, self.node_id.clone())
    }

    fn now_ms(&self) -> u64 {
        // the provider hands out an i64; clock readings before the epoch
        // clamp to 0 so the HLC wall component stays unsigned
        self.time_provider.now().timestamp_millis().max(0) as u64
    }
}
