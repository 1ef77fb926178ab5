use serde::{Deserialize, Serialize};

use crate::model::{PatchSha, WriterId};

/// `(lamport, writer, patch_sha, op_index)`.
///
/// Total order: lexicographic over the four fields in this order, with
/// strings compared byte-wise. Used to pick a deterministic winner between
/// two writes to the same [`crate::crdt::lww::LwwRegister`] — no two
/// `EventId`s can compare equal because `(writer, patch_sha, op_index)`
/// uniquely identifies one op within one patch, and a writer never reuses a
/// `patch_sha`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    /// Lamport timestamp of the patch that produced this op.
    pub lamport: u64,
    /// Writer that authored the patch.
    pub writer: WriterId,
    /// SHA of the commit carrying the patch.
    pub patch_sha: PatchSha,
    /// Index of the op within the patch's op list.
    pub op_index: u32,
}

impl EventId {
    /// Construct an event id.
    #[must_use]
    pub const fn new(lamport: u64, writer: WriterId, patch_sha: PatchSha, op_index: u32) -> Self {
        Self {
            lamport,
            writer,
            patch_sha,
            op_index,
        }
    }
}
