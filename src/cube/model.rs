use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CubeForgeError, Result};

/// Build engine a cube is configured with. Decides the step chain of its
/// build jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineType {
    #[default]
    Layered,
    InMemory,
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineType::Layered => write!(f, "LAYERED"),
            EngineType::InMemory => write!(f, "IN_MEMORY"),
        }
    }
}

impl std::str::FromStr for EngineType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "layered" => Ok(EngineType::Layered),
            "in_memory" | "inmemory" => Ok(EngineType::InMemory),
            other => Err(format!("unknown engine '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeDescriptor {
    /// Start of the first segment, epoch millis UTC.
    pub partition_date_start: i64,
    pub engine: EngineType,
}

/// Half-open `[start, end)` time range in epoch millis UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentRange {
    pub start: i64,
    pub end: i64,
}

impl SegmentRange {
    pub fn new(start: i64, end: i64) -> Result<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if self.end <= self.start {
            return Err(CubeForgeError::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    pub fn overlaps(&self, other: &SegmentRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// `yyyyMMddHHmmss_yyyyMMddHHmmss` in UTC.
    pub fn name(&self) -> String {
        format!("{}_{}", format_millis(self.start), format_millis(self.end))
    }
}

impl std::fmt::Display for SegmentRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

fn format_millis(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(ts) => ts.format("%Y%m%d%H%M%S").to_string(),
        None => ms.to_string(),
    }
}

/// Parse `2013-01-01`, `2013-01-01T08:00:00Z` or raw epoch millis.
pub fn parse_timestamp(value: &str) -> Result<i64> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.timestamp_millis());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight).timestamp_millis());
        }
    }
    Err(CubeForgeError::Validation(format!(
        "cannot parse '{}' as a date, RFC 3339 timestamp or epoch millis",
        value
    )))
}

/// Segment status only moves forward: `NEW -> READY -> ACTIVE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    New,
    Ready,
    Active,
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentStatus::New => write!(f, "NEW"),
            SegmentStatus::Ready => write!(f, "READY"),
            SegmentStatus::Active => write!(f, "ACTIVE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub cube_name: String,
    pub name: String,
    pub range: SegmentRange,
    pub status: SegmentStatus,
    pub created_at: DateTime<Utc>,
    /// Job that last brought this segment to ACTIVE.
    pub last_build_job: Option<Uuid>,
}

impl Segment {
    pub fn new(cube_name: impl Into<String>, range: SegmentRange) -> Self {
        Self {
            id: Uuid::new_v4(),
            cube_name: cube_name.into(),
            name: range.name(),
            range,
            status: SegmentStatus::New,
            created_at: Utc::now(),
            last_build_job: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cube {
    pub name: String,
    pub descriptor: CubeDescriptor,
    /// Sorted by start, never overlapping.
    pub segments: Vec<Segment>,
    pub created_at: DateTime<Utc>,
}

impl Cube {
    pub fn new(name: impl Into<String>, descriptor: CubeDescriptor) -> Self {
        Self {
            name: name.into(),
            descriptor,
            segments: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn segment(&self, id: &Uuid) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id == *id)
    }

    /// Where the next appended segment starts: the end of the latest
    /// segment, or the configured partition start for an empty cube.
    pub fn next_segment_start(&self) -> i64 {
        self.segments
            .iter()
            .map(|s| s.range.end)
            .max()
            .unwrap_or(self.descriptor.partition_date_start)
    }

    /// A NEW segment `[next_segment_start, end)`. The cube is not modified.
    pub fn next_segment(&self, end: i64) -> Result<Segment> {
        let range = SegmentRange::new(self.next_segment_start(), end)?;
        Ok(Segment::new(self.name.clone(), range))
    }
}

/// A cube together with the store version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedCube {
    pub cube: Cube,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn test_range_validation() {
        assert!(SegmentRange::new(0, 1).is_ok());
        assert!(matches!(
            SegmentRange::new(5, 5),
            Err(CubeForgeError::InvalidRange { start: 5, end: 5 })
        ));
        assert!(SegmentRange::new(5, 4).is_err());
    }

    #[test]
    fn test_half_open_overlap() {
        let a = SegmentRange::new(0, 10).unwrap();
        let b = SegmentRange::new(10, 20).unwrap();
        let c = SegmentRange::new(9, 11).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(a.overlaps(&a));
    }

    #[test]
    fn test_segment_name_format() {
        let range = SegmentRange::new(0, parse_timestamp("2013-01-01").unwrap()).unwrap();
        assert_eq!(range.name(), "19700101000000_20130101000000");
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_timestamp("86400000").unwrap(), DAY);
        assert_eq!(parse_timestamp("1970-01-02").unwrap(), DAY);
        assert_eq!(parse_timestamp("1970-01-02T00:00:00Z").unwrap(), DAY);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_next_segment_on_empty_cube_uses_partition_start() {
        let cube = Cube::new(
            "sales",
            CubeDescriptor {
                partition_date_start: 3 * DAY,
                engine: EngineType::Layered,
            },
        );
        let segment = cube.next_segment(10 * DAY).unwrap();
        assert_eq!(segment.range, SegmentRange { start: 3 * DAY, end: 10 * DAY });
        assert_eq!(segment.status, SegmentStatus::New);
        assert_eq!(segment.cube_name, "sales");
        assert!(cube.segments.is_empty());

        assert!(matches!(
            cube.next_segment(3 * DAY),
            Err(CubeForgeError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_next_segment_continues_from_latest_end() {
        let mut cube = Cube::new("sales", CubeDescriptor::default());
        cube.segments.push(Segment::new("sales", SegmentRange::new(0, DAY).unwrap()));
        cube.segments.push(Segment::new("sales", SegmentRange::new(DAY, 2 * DAY).unwrap()));
        assert_eq!(cube.next_segment_start(), 2 * DAY);
    }

    #[test]
    fn test_segment_status_order() {
        assert!(SegmentStatus::New < SegmentStatus::Ready);
        assert!(SegmentStatus::Ready < SegmentStatus::Active);
    }

    #[test]
    fn test_engine_parse() {
        assert_eq!("in-memory".parse::<EngineType>().unwrap(), EngineType::InMemory);
        assert_eq!("LAYERED".parse::<EngineType>().unwrap(), EngineType::Layered);
        assert!("spark".parse::<EngineType>().is_err());
    }
}
