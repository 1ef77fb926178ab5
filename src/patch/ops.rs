use serde::{Deserialize, Serialize};

use crate::clock::Dot;
use crate::patch::PropValue;

/// The target a [`Op::PropSet`] writes to.
///
/// A tagged variant rather than a raw composite-key string: the reducer is
/// responsible for turning this into the storage key (see
/// [`crate::keycodec`]), not the patch representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropTarget {
    /// A property on a node.
    Node {
        /// The node id.
        id: String,
    },
    /// A property on an edge.
    Edge {
        /// Source node id.
        from: String,
        /// Target node id.
        to: String,
        /// Edge label.
        label: String,
    },
}

/// A single typed CRDT operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Add a node, witnessed by a freshly minted dot.
    NodeAdd {
        /// The node id.
        id: String,
        /// The dot that witnesses this add.
        dot: Dot,
    },
    /// Remove a node, tombstoning the dots this writer had observed alive.
    NodeRemove {
        /// The node id.
        id: String,
        /// Dots observed live at the time of removal.
        observed: Vec<Dot>,
    },
    /// Add an edge, witnessed by a freshly minted dot.
    EdgeAdd {
        /// Source node id.
        from: String,
        /// Target node id.
        to: String,
        /// Edge label.
        label: String,
        /// The dot that witnesses this add.
        dot: Dot,
    },
    /// Remove an edge, tombstoning the dots this writer had observed alive.
    EdgeRemove {
        /// Source node id.
        from: String,
        /// Target node id.
        to: String,
        /// Edge label.
        label: String,
        /// Dots observed live at the time of removal.
        observed: Vec<Dot>,
    },
    /// Set a node or edge property via an LWW register write.
    PropSet {
        /// What the property belongs to.
        target: PropTarget,
        /// The property name.
        key: String,
        /// The new value.
        value: PropValue,
    },
}

impl Op {
    /// A human-readable operation name (`"NodeAdd"`, `"PropSet"`, ...), used
    /// in [`crate::reducer::TickReceipt`] and canonical ops JSON.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NodeAdd { .. } => "NodeAdd",
            Self::NodeRemove { .. } => "NodeRemove",
            Self::EdgeAdd { .. } => "EdgeAdd",
            Self::EdgeRemove { .. } => "EdgeRemove",
            Self::PropSet { .. } => "PropSet",
        }
    }
}
