use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::cube::{Cube, CubeDescriptor, CubeUpdate, Segment, SegmentStatus, VersionedCube};
use crate::error::{CubeForgeError, Result};
use crate::store::{self, MetadataStore, ABSENT};

const CUBE_PREFIX: &str = "cubes/";

/// Owns every cube's segment list. All changes go through
/// [`apply_update`](CubeManager::apply_update), which commits only if the
/// cube still has the version the update was built against.
pub struct CubeManager {
    store: Arc<dyn MetadataStore>,
}

impl CubeManager {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    fn key(name: &str) -> String {
        format!("{}{}", CUBE_PREFIX, name)
    }

    fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(CubeForgeError::Validation(format!(
                "invalid cube name '{}': use letters, digits, '_' or '-'",
                name
            )));
        }
        Ok(())
    }

    pub async fn create_cube(&self, name: &str, descriptor: CubeDescriptor) -> Result<VersionedCube> {
        Self::validate_name(name)?;
        let cube = Cube::new(name, descriptor);
        let version = match store::put_typed(self.store.as_ref(), &Self::key(name), &cube, ABSENT).await
        {
            Ok(version) => version,
            Err(e) if e.is_conflict() => return Err(CubeForgeError::CubeExists(name.to_string())),
            Err(e) => return Err(e),
        };
        tracing::info!(
            cube = %name,
            partition_start = cube.descriptor.partition_date_start,
            engine = %cube.descriptor.engine,
            "Cube created"
        );
        Ok(VersionedCube { cube, version })
    }

    pub async fn get_cube(&self, name: &str) -> Result<VersionedCube> {
        Self::validate_name(name)?;
        store::get_typed::<Cube>(self.store.as_ref(), &Self::key(name))
            .await?
            .map(|(cube, version)| VersionedCube { cube, version })
            .ok_or_else(|| CubeForgeError::CubeNotFound(name.to_string()))
    }

    pub async fn list_cubes(&self) -> Result<Vec<Cube>> {
        let mut cubes = Vec::new();
        for key in self.store.list_keys(CUBE_PREFIX).await? {
            if let Some((cube, _)) = store::get_typed::<Cube>(self.store.as_ref(), &key).await? {
                cubes.push(cube);
            }
        }
        Ok(cubes)
    }

    pub async fn drop_cube(&self, name: &str) -> Result<()> {
        store::retry_on_conflict("drop_cube", || async {
            let current = self.get_cube(name).await?;
            self.store.delete(&Self::key(name), current.version).await
        })
        .await?;
        tracing::info!(cube = %name, "Cube dropped");
        Ok(())
    }

    /// The segment that would follow the cube's current last one, in NEW
    /// status. Nothing is written.
    pub fn append_segment(&self, cube: &Cube, end: i64) -> Result<Segment> {
        cube.next_segment(end)
    }

    /// Append `[next start, end)` to the named cube and commit it, re-reading
    /// and retrying if another writer got there first.
    pub async fn append_and_commit(&self, name: &str, end: i64) -> Result<Segment> {
        let segment = store::retry_on_conflict("append_segment", || async {
            let current = self.get_cube(name).await?;
            let segment = self.append_segment(&current.cube, end)?;
            self.apply_update(CubeUpdate::new(&current).add(segment.clone()))
                .await?;
            Ok(segment)
        })
        .await?;

        tracing::info!(
            cube = %name,
            segment = %segment.name,
            segment_id = %segment.id,
            range = %segment.range,
            "Segment appended"
        );
        Ok(segment)
    }

    /// An update that removes every segment of `cube`.
    pub fn clear_segments(&self, cube: &VersionedCube) -> CubeUpdate {
        cube.cube
            .segments
            .iter()
            .fold(CubeUpdate::new(cube), |update, s| update.remove(s.id))
    }

    /// Validate and commit `update` atomically.
    ///
    /// Fails with `ConcurrencyConflict` if the cube changed since the update
    /// was built; the caller should re-read and rebuild it. Fails without
    /// writing anything if the result would contain overlapping segments.
    pub async fn apply_update(&self, update: CubeUpdate) -> Result<VersionedCube> {
        let key = Self::key(&update.cube_name);
        let current = self.get_cube(&update.cube_name).await?;
        if current.version != update.expected_version {
            return Err(store::conflict(&key, update.expected_version, current.version));
        }

        let mut cube = current.cube;
        cube.segments = Self::merge(&cube, &update)?;
        let version = store::put_typed(self.store.as_ref(), &key, &cube, update.expected_version).await?;

        tracing::debug!(
            cube = %cube.name,
            version,
            added = update.to_add.len(),
            removed = update.to_remove.len(),
            modified = update.to_modify.len(),
            "Cube update committed"
        );
        Ok(VersionedCube { cube, version })
    }

    fn merge(cube: &Cube, update: &CubeUpdate) -> Result<Vec<Segment>> {
        let existing: HashSet<Uuid> = cube.segments.iter().map(|s| s.id).collect();
        let removed: HashSet<Uuid> = update.to_remove.iter().copied().collect();

        for id in &update.to_remove {
            if !existing.contains(id) {
                return Err(CubeForgeError::Validation(format!(
                    "cannot remove unknown segment {} from cube {}",
                    id, cube.name
                )));
            }
        }
        for segment in &update.to_modify {
            if !existing.contains(&segment.id) || removed.contains(&segment.id) {
                return Err(CubeForgeError::Validation(format!(
                    "cannot modify segment {} of cube {}: not present",
                    segment.id, cube.name
                )));
            }
        }
        for segment in update.to_add.iter().chain(&update.to_modify) {
            if segment.cube_name != cube.name {
                return Err(CubeForgeError::Validation(format!(
                    "segment {} belongs to cube {}, not {}",
                    segment.id, segment.cube_name, cube.name
                )));
            }
            segment.range.validate()?;
        }

        let mut segments: Vec<Segment> = cube
            .segments
            .iter()
            .filter(|s| !removed.contains(&s.id))
            .map(|s| {
                update
                    .to_modify
                    .iter()
                    .find(|m| m.id == s.id)
                    .unwrap_or(s)
                    .clone()
            })
            .collect();

        let mut seen: HashSet<Uuid> = segments.iter().map(|s| s.id).collect();
        for segment in &update.to_add {
            if !seen.insert(segment.id) {
                return Err(CubeForgeError::Validation(format!(
                    "segment {} is already part of cube {}",
                    segment.id, cube.name
                )));
            }
            segments.push(segment.clone());
        }

        segments.sort_by_key(|s| (s.range.start, s.range.end));
        if let Some(pair) = segments.windows(2).find(|w| w[0].range.overlaps(&w[1].range)) {
            let clash = &pair[1];
            return Err(CubeForgeError::Overlap {
                cube: cube.name.clone(),
                segment: clash.name.clone(),
                start: clash.range.start,
                end: clash.range.end,
            });
        }
        Ok(segments)
    }

    /// Move a segment's status forward, optionally recording the job that
    /// built it. Re-applying the current status is a no-op so step bodies can
    /// be re-run safely.
    pub async fn update_segment_status(
        &self,
        cube_name: &str,
        segment_id: Uuid,
        status: SegmentStatus,
        build_job: Option<Uuid>,
    ) -> Result<Segment> {
        store::retry_on_conflict("update_segment_status", || async {
            let current = self.get_cube(cube_name).await?;
            let segment = current.cube.segment(&segment_id).cloned().ok_or_else(|| {
                CubeForgeError::SegmentNotFound {
                    cube: cube_name.to_string(),
                    segment: segment_id,
                }
            })?;

            if segment.status > status {
                return Err(CubeForgeError::Precondition(format!(
                    "segment {} is {} and cannot go back to {}",
                    segment.name, segment.status, status
                )));
            }
            if segment.status == status && (build_job.is_none() || segment.last_build_job == build_job)
            {
                return Ok(segment);
            }

            let mut updated = segment;
            updated.status = status;
            if build_job.is_some() {
                updated.last_build_job = build_job;
            }
            self.apply_update(CubeUpdate::new(&current).modify(updated.clone()))
                .await?;
            tracing::info!(
                cube = %cube_name,
                segment = %updated.name,
                status = %status,
                "Segment status updated"
            );
            Ok(updated)
        })
        .await
    }
}
