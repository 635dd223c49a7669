//! Parameter Tree - Sharded tensors addressed by structured paths
//!
//! Provides the in-memory model state exchanged with the checkpoint manager:
//! - Device meshes and per-tensor sharding specifications
//! - Tensors holding their locally addressable shards
//! - Ordered parameter trees with filtering and partial merge

pub mod dtype;
pub mod layout;
pub mod mesh;
pub mod tensor;
pub mod tree;

pub use dtype::DType;
pub use mesh::{Mesh, MeshAxis, ShardingSpec};
pub use tensor::{Shard, Tensor};
pub use tree::{filter_paths, merge, ParamPath, ParameterTree, PathFilter, PathKey};
