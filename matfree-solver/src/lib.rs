//! `matfree-solver`: matrix-free Conjugate Gradient on the host device.
//!
//! The solver hides the device-to-host transfer of its residual norm behind
//! the solution update, and the local operator orders its element batches so
//! halo-independent work is queued around the elements that need halo data.

pub mod algorithms;
pub mod local_operator;
pub mod mesh;
pub mod operator;
pub mod reference;

pub use algorithms::{ConjugateGradient, LinearSolver, ReductionMode, SolveInfo, SolverState};
pub use local_operator::LocalOperator;
pub use mesh::{BoxMesh, ElementPartition, MeshGeometry};
pub use operator::{DiagonalOperator, IdentityOperator, Operator};
pub use reference::ReferenceElement;

// Re-export from matfree_core
pub use matfree_core::{
    Communicator, ComputeDevice, CoreError, DeviceVector, Platform, PlatformConfig, Result,
    SelfComm, ThreadComm, Vector,
};
