use crate::config::SemanticConfig;
use crate::detector::Detector;
use crate::error::Error;
use crate::mapper::CategoryMapper;
use crate::models::{
    BatchOutcome, BatchStats, Category, ClassificationResult, ClassifyMethod, ImageOutcome,
    ImageTiming, MapperReport,
};
use crate::semantic::SemanticClassifier;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyOptions {
    /// Semantic classifier threshold.
    pub threshold: f32,
    pub max_tags: Option<usize>,
    pub expected_tags: Option<Vec<Category>>,
    /// Cross-check fast-path results with the semantic classifier.
    pub validate: bool,
}

impl ClassifyOptions {
    pub fn from_config(config: &SemanticConfig) -> Self {
        Self {
            threshold: config.base_threshold,
            max_tags: config.max_tags,
            expected_tags: None,
            validate: false,
        }
    }
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self::from_config(&SemanticConfig::default())
    }
}

/// `Empty` and `Failed` both trigger the fallback.
#[derive(Debug)]
pub enum FastPath {
    Matched(Category, MapperReport),
    Empty(MapperReport),
    Failed(Error),
}

#[derive(Clone)]
pub struct HybridClassifier {
    detector: Arc<dyn Detector>,
    semantic: SemanticClassifier,
    mapper: CategoryMapper,
}

impl HybridClassifier {
    pub fn new(
        detector: Arc<dyn Detector>,
        semantic: SemanticClassifier,
        mapper: CategoryMapper,
    ) -> Self {
        Self {
            detector,
            semantic,
            mapper,
        }
    }

    pub fn semantic(&self) -> &SemanticClassifier {
        &self.semantic
    }

    pub fn fast_path(&self, image: &Path) -> FastPath {
        match self.detector.detect(image) {
            Ok(detections) => {
                let report = self.mapper.map(&detections);
                match report.dominant {
                    Some(category) => FastPath::Matched(category, report),
                    None => {
                        log::debug!(
                            "{} found objects but no category match: {:?}",
                            self.detector.name(),
                            report.detections
                        );
                        FastPath::Empty(report)
                    }
                }
            }
            Err(err) => {
                log::warn!("Detector error for {}: {err}", image.display());
                FastPath::Failed(err)
            }
        }
    }

    pub fn classify(&self, image: &Path, options: &ClassifyOptions) -> ImageOutcome {
        let started = Instant::now();
        let mut timing = ImageTiming::default();

        let fast = self.fast_path(image);
        timing.fast = started.elapsed();
        let report = match fast {
            FastPath::Matched(category, report) => {
                log::debug!(
                    "Fast path hit for {}: {category} ({:?})",
                    image.display(),
                    timing.fast
                );
                timing.total = started.elapsed();
                return ImageOutcome {
                    result: fast_result(category, &report),
                    method: ClassifyMethod::FastPath,
                    timing,
                    report: Some(report),
                };
            }
            FastPath::Empty(report) => Some(report),
            FastPath::Failed(_) => None,
        };
        let objects = report
            .as_ref()
            .map(|r| r.all_objects.clone())
            .unwrap_or_default();

        let semantic_started = Instant::now();
        let semantic = self.semantic.classify_tags(
            image,
            options.threshold,
            options.max_tags,
            options.expected_tags.as_deref(),
        );
        timing.semantic = semantic_started.elapsed();
        timing.total = started.elapsed();

        let (result, method) = match semantic {
            Ok(tags) => fallback_result(tags, objects),
            Err(err) => {
                log::error!("Semantic classifier error for {}: {err}", image.display());
                fallback_result(Vec::new(), objects)
            }
        };
        log::debug!(
            "Semantic fallback for {}: {:?} ({:?} total)",
            image.display(),
            result.tags,
            timing.total
        );
        ImageOutcome {
            result,
            method,
            timing,
            report,
        }
    }

    pub fn classify_batch(&self, images: &[&Path], options: &ClassifyOptions) -> BatchOutcome {
        let started = Instant::now();
        let mut stats = BatchStats {
            batch_id: Uuid::new_v4().to_string(),
            total_images: images.len(),
            ..Default::default()
        };
        let mut results: Vec<Option<ClassificationResult>> = vec![None; images.len()];
        let mut methods = vec![ClassifyMethod::FallbackOther; images.len()];
        let mut objects: Vec<BTreeSet<String>> = vec![BTreeSet::new(); images.len()];
        let mut pending: Vec<usize> = Vec::new();

        let fast_started = Instant::now();
        for (idx, image) in images.iter().enumerate() {
            match self.fast_path(image) {
                FastPath::Matched(category, report) => {
                    results[idx] = Some(fast_result(category, &report));
                    methods[idx] = ClassifyMethod::FastPath;
                    stats.fast_success += 1;
                }
                FastPath::Empty(report) => {
                    objects[idx] = report.all_objects;
                    pending.push(idx);
                }
                FastPath::Failed(_) => pending.push(idx),
            }
        }
        stats.fast_time = fast_started.elapsed();

        if !pending.is_empty() {
            let semantic_started = Instant::now();
            let paths: Vec<&Path> = pending.iter().map(|idx| images[*idx]).collect();
            match self
                .semantic
                .classify_batch_tags(
                    &paths,
                    options.threshold,
                    options.max_tags,
                    options.expected_tags.as_deref(),
                ) {
                Ok(batch) => {
                    for (tags, idx) in batch.into_iter().zip(pending.iter().copied()) {
                        let (result, method) =
                            fallback_result(tags, std::mem::take(&mut objects[idx]));
                        if method == ClassifyMethod::SemanticFallback {
                            stats.fallback += 1;
                        }
                        results[idx] = Some(result);
                        methods[idx] = method;
                    }
                }
                Err(err) => {
                    log::error!("Semantic batch error: {err}");
                }
            }
            stats.semantic_time = semantic_started.elapsed();
        }

        let results: Vec<ClassificationResult> = results
            .into_iter()
            .enumerate()
            .map(|(idx, result)| match result {
                Some(result) => result,
                None => {
                    methods[idx] = ClassifyMethod::FallbackOther;
                    fallback_result(Vec::new(), std::mem::take(&mut objects[idx])).0
                }
            })
            .collect();

        stats.total_time = started.elapsed();
        if !images.is_empty() {
            stats.avg_per_image = stats.total_time / images.len() as u32;
        }
        log_batch_summary(&stats);

        BatchOutcome {
            results,
            methods,
            stats,
        }
    }
}

fn fast_result(category: Category, report: &MapperReport) -> ClassificationResult {
    let mut all_detections = report.all_objects.clone();
    if all_detections.is_empty() {
        all_detections.insert(category.as_str().to_string());
    }
    ClassificationResult {
        tags: vec![category],
        all_detections,
    }
}

/// Result for an image that went past the fast path. Empty `tags` means both stages came
/// up with nothing and the image gets the `other` sentinel.
fn fallback_result(
    tags: Vec<Category>,
    objects: BTreeSet<String>,
) -> (ClassificationResult, ClassifyMethod) {
    let (tags, method) = if tags.is_empty() {
        (vec![Category::Other], ClassifyMethod::FallbackOther)
    } else {
        (tags, ClassifyMethod::SemanticFallback)
    };
    let all_detections = if objects.is_empty() {
        tags.iter().map(|t| t.as_str().to_string()).collect()
    } else {
        objects
    };
    (
        ClassificationResult {
            tags,
            all_detections,
        },
        method,
    )
}

fn log_batch_summary(stats: &BatchStats) {
    log::info!(
        "Hybrid batch {}: {} images in {:.1}ms ({:.1}ms/img)",
        stats.batch_id,
        stats.total_images,
        millis(stats.total_time),
        millis(stats.avg_per_image)
    );
    log::info!(
        "  fast path: {} hits ({:.1}%) in {:.1}ms",
        stats.fast_success,
        stats.fast_success_percent(),
        millis(stats.fast_time)
    );
    log::info!(
        "  semantic: {} fallbacks in {:.1}ms",
        stats.fallback,
        millis(stats.semantic_time)
    );
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
