use uuid::Uuid;

use crate::cube::{Segment, VersionedCube};

/// An atomic change to one cube's segment list, valid only against the
/// version it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubeUpdate {
    pub cube_name: String,
    pub expected_version: u64,
    pub to_add: Vec<Segment>,
    pub to_remove: Vec<Uuid>,
    pub to_modify: Vec<Segment>,
}

impl CubeUpdate {
    pub fn new(base: &VersionedCube) -> Self {
        Self {
            cube_name: base.cube.name.clone(),
            expected_version: base.version,
            to_add: Vec::new(),
            to_remove: Vec::new(),
            to_modify: Vec::new(),
        }
    }

    pub fn add(mut self, segment: Segment) -> Self {
        self.to_add.push(segment);
        self
    }

    pub fn remove(mut self, segment_id: Uuid) -> Self {
        self.to_remove.push(segment_id);
        self
    }

    pub fn modify(mut self, segment: Segment) -> Self {
        self.to_modify.push(segment);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_modify.is_empty()
    }
}
