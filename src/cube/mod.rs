//! Cubes, their time-partitioned segments, and the manager that keeps each
//! cube's segment list sorted and non-overlapping.

mod manager;
mod model;
mod update;

pub use manager::CubeManager;
pub use model::{
    parse_timestamp, Cube, CubeDescriptor, EngineType, Segment, SegmentRange, SegmentStatus,
    VersionedCube,
};
pub use update::CubeUpdate;
