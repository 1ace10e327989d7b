//! Incremental 3-D k-d tree with lazy deletion, voxel downsampling and
//! background rebalancing.
//!
//! ```rust
//! use ikdtree::{IkdTree, Point3};
//!
//! let tree = IkdTree::new(0.5, 0.6, 0.2)?;
//! tree.add_points(&[Point3::new(1.0, 2.0, 3.0), Point3::new(4.0, 5.0, 6.0)], false)?;
//!
//! let (nearest, _) = tree.k_nearest(&Point3::new(1.1, 2.0, 3.0), 1, f32::INFINITY);
//! assert_eq!(nearest, vec![Point3::new(1.0, 2.0, 3.0)]);
//! assert!(tree.collision_check(&Point3::new(4.0, 5.0, 6.1), 0.2));
//! # Ok::<(), ikdtree::IkdError>(())
//! ```

mod build;
pub mod config;
pub mod error;
mod mutate;
mod node;
mod oplog;
mod query;
mod rebuild;
mod tree;
pub mod types;

pub use config::TreeConfig;
pub use error::{IkdError, Result};
pub use rebuild::RebuildStats;
pub use tree::IkdTree;
pub use types::{Axis, BoundingBox3D, KdPoint, POINT_EPSILON, Point3, VoxelKey, distance_sq, same_point};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::{BoundingBox3D, IkdError, IkdTree, KdPoint, Point3, Result, TreeConfig};
}
