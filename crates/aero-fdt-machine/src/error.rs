use aero_fdt::FdtError;
use thiserror::Error;

use crate::backend::BackendError;
use crate::cells::CellError;

/// Conditions that abort a machine build.
///
/// Per-node construction problems never surface here; they degrade the node to "no device" and
/// the build continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("unusable device tree: {0}")]
    Document(#[from] FdtError),

    #[error("device tree has no /cpus node and no CPU type was configured")]
    NoCpu,

    #[error("CPU node {node} has no compatible string")]
    CpuMissingCompatible { node: String },

    #[error("unable to create CPU {model:?}")]
    CpuCreate { model: String },

    #[error("device tree declares more than {max} CPUs")]
    TooManyCpus { max: usize },

    #[error("device tree declares no memory region")]
    NoMemory,

    #[error("root node has no interrupt-parent")]
    NoRootInterruptParent,

    #[error("root interrupt-parent phandle {phandle:#x} does not resolve to a node")]
    UnresolvedRootInterruptParent { phandle: u32 },

    #[error("root interrupt controller {node} was not instantiated")]
    RootInterruptParentNotInstantiated { node: String },

    #[error("malformed cells in {node}: {source}")]
    Cells {
        node: String,
        #[source]
        source: CellError,
    },

    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BackendError,
    },
}
