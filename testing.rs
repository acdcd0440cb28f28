//! Path-keyed stand-ins for the detector and embedding models.

use crate::detector::Detector;
use crate::embedding::EmbeddingScorer;
use crate::error::{Error, Result};
use crate::mapper::COCO_LABELS;
use crate::models::{BoundingBox, Category, Detection};
use crate::semantic::{default_prompts, PromptKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Detection covering `fraction` of a 1000x1000 image.
pub fn detection(class_id: u32, confidence: f32, fraction: f32) -> Detection {
    Detection {
        class_id,
        label: COCO_LABELS[class_id as usize].to_string(),
        confidence,
        bbox: BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 1000.0,
            y2: 1000.0 * fraction,
        },
        image_size: (1000, 1000),
    }
}

#[derive(Default)]
pub struct StaticDetector {
    results: HashMap<PathBuf, Vec<Detection>>,
    failing: Vec<PathBuf>,
    pub calls: AtomicUsize,
}

impl StaticDetector {
    pub fn with(mut self, image: &str, detections: Vec<Detection>) -> Self {
        self.results.insert(PathBuf::from(image), detections);
        self
    }

    pub fn failing_on(mut self, image: &str) -> Self {
        self.failing.push(PathBuf::from(image));
        self
    }
}

impl Detector for StaticDetector {
    fn detect(&self, image: &Path) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.iter().any(|p| p == image) {
            return Err(Error::Inference(format!("detector crashed on {}", image.display())));
        }
        Ok(self.results.get(image).cloned().unwrap_or_default())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Returns scripted per-category probabilities laid out in default prompt order.
/// Unknown images fail to load.
#[derive(Default)]
pub struct ScriptedScorer {
    scores: HashMap<PathBuf, Vec<f32>>,
    batch_fails: bool,
    pub calls: AtomicUsize,
    pub batch_sizes: std::sync::Mutex<Vec<usize>>,
}

impl ScriptedScorer {
    pub fn with(self, image: &str, scores: &[(Category, f32)]) -> Self {
        let kinds: Vec<(PromptKind, f32)> = scores
            .iter()
            .map(|(c, s)| (PromptKind::Tag(*c), *s))
            .collect();
        self.with_kinds(image, &kinds)
    }

    pub fn with_kinds(mut self, image: &str, scores: &[(PromptKind, f32)]) -> Self {
        let row = default_prompts()
            .iter()
            .map(|prompt| {
                scores
                    .iter()
                    .find(|(kind, _)| *kind == prompt.kind)
                    .map(|(_, s)| *s)
                    .unwrap_or(0.0)
            })
            .collect();
        self.scores.insert(PathBuf::from(image), row);
        self
    }

    pub fn failing_batch(mut self) -> Self {
        self.batch_fails = true;
        self
    }
}

impl EmbeddingScorer for ScriptedScorer {
    fn score(&self, image: &Path, prompts: &[&str]) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let row = self
            .scores
            .get(image)
            .ok_or_else(|| Error::Path(format!("cannot open {}", image.display())))?;
        Ok(row.iter().copied().take(prompts.len()).collect())
    }

    fn score_batch(&self, images: &[&Path], prompts: &[&str]) -> Result<Vec<Option<Vec<f32>>>> {
        if let Ok(mut sizes) = self.batch_sizes.lock() {
            sizes.push(images.len());
        }
        if self.batch_fails {
            return Err(Error::Inference("batch call failed".into()));
        }
        Ok(images
            .iter()
            .map(|image| self.score(image, prompts).ok())
            .collect())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
