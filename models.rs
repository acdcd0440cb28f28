use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSecondsWithFrac};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Fixed category taxonomy. `Other` is the sentinel for "nothing cleared its threshold".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    People,
    Animals,
    Food,
    Scenery,
    Document,
    #[serde(alias = "unknown")]
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::People,
        Category::Animals,
        Category::Food,
        Category::Scenery,
        Category::Document,
        Category::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::People => "people",
            Self::Animals => "animals",
            Self::Food => "food",
            Self::Scenery => "scenery",
            Self::Document => "document",
            Self::Other => "other",
        }
    }

    /// Tie-break rank used by the Category Mapper; higher wins.
    pub fn priority(self) -> u8 {
        match self {
            Self::People => 4,
            Self::Animals => 3,
            Self::Food => 2,
            Self::Document => 1,
            Self::Scenery | Self::Other => 0,
        }
    }

    /// Physical-object categories the detector is authoritative for.
    pub fn is_object(self) -> bool {
        matches!(self, Self::People | Self::Animals | Self::Food)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "people" | "person" => Ok(Self::People),
            "animals" | "animal" => Ok(Self::Animals),
            "food" => Ok(Self::Food),
            "scenery" => Ok(Self::Scenery),
            "document" | "documents" => Ok(Self::Document),
            "other" | "unknown" => Ok(Self::Other),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One detector hit, already lifted out of the model library's native output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub image_size: (u32, u32),
}

impl Detection {
    /// Box area as a fraction of the image area, 0 for a degenerate image size.
    pub fn normalized_area(&self) -> f32 {
        let (w, h) = self.image_size;
        let image_area = w as f32 * h as f32;
        if image_area <= 0.0 {
            return 0.0;
        }
        (self.bbox.area() / image_area).min(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredTag {
    pub category: Category,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub tags: Vec<Category>,
    pub all_detections: BTreeSet<String>,
}

impl ClassificationResult {
    pub fn other() -> Self {
        Self {
            tags: vec![Category::Other],
            all_detections: BTreeSet::from([Category::Other.as_str().to_string()]),
        }
    }

    pub fn tag_strings(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.as_str().to_string()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyMethod {
    FastPath,
    SemanticFallback,
    FallbackOther,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionDebug {
    pub label: String,
    pub class_id: u32,
    pub confidence: f32,
    pub box_percent: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedDebug {
    pub category: Category,
    pub from_class: String,
    pub confidence: f32,
    pub box_percent: f32,
    pub weighted_score: f32,
}

/// Category Mapper output: the dominant category plus what it was derived from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapperReport {
    pub dominant: Option<Category>,
    pub detections: Vec<DetectionDebug>,
    pub mapped: Vec<MappedDebug>,
    pub category_scores: BTreeMap<Category, f32>,
    pub all_objects: BTreeSet<String>,
    pub max_confidence: f32,
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageTiming {
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub fast: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub semantic: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub total: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOutcome {
    pub result: ClassificationResult,
    pub method: ClassifyMethod,
    pub timing: ImageTiming,
    pub report: Option<MapperReport>,
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub batch_id: String,
    pub total_images: usize,
    pub fast_success: usize,
    pub fallback: usize,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub fast_time: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub semantic_time: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub total_time: Duration,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub avg_per_image: Duration,
}

impl BatchStats {
    pub fn fast_success_percent(&self) -> f32 {
        if self.total_images == 0 {
            return 0.0;
        }
        100.0 * self.fast_success as f32 / self.total_images as f32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub results: Vec<ClassificationResult>,
    pub methods: Vec<ClassifyMethod>,
    pub stats: BatchStats,
}

/// Advisory output of the Validator; the caller decides whether to persist `override_tags`.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationDecision {
    pub agreement: bool,
    pub should_override: bool,
    pub override_tags: Vec<Category>,
    pub reason: String,
    pub semantic_tags: Vec<Category>,
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    #[serde(default)]
    pub photo_id: String,
    pub tags: Vec<String>,
    pub last_updated: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_detections: Option<Vec<String>>,
}
