//! Global and thread-local variables injected by a patch session.

use ocelot_asm::{DataId, LabelId};

/// Identifier of an injected variable inside its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobVarId(pub u32);

/// Whether the variable existed in the original binary or was created
/// by the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarLife {
    /// The variable was already part of the binary.
    Existing,
    /// The variable is materialised by the commit.
    Created,
}

/// A global or thread-local variable managed by the planner.
#[derive(Clone, Debug)]
pub struct GlobVar {
    /// The session-unique identifier.
    pub id: GlobVarId,
    /// The size of the variable in bytes.
    pub size: usize,
    /// The initial contents; zero-filled when shorter than `size`.
    pub bytes: Vec<u8>,
    /// Whether the variable pre-existed.
    pub life: VarLife,
    /// Whether the variable lives in thread-local storage.
    pub tls: bool,
    /// The data entry backing the variable once materialised.
    pub data: Option<DataId>,
    /// The label naming the variable once materialised.
    pub label: Option<LabelId>,
    /// The address allocated to the variable once materialised.
    pub addr: Option<u64>,
}
