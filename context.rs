use crate::config::Settings;
use crate::detector::{Detector, OnnxDetector};
use crate::embedding::{EmbeddingScorer, OnnxEmbeddingScorer};
use crate::error::{Error, Result};
use crate::hybrid::{ClassifyOptions, HybridClassifier};
use crate::mapper::CategoryMapper;
use crate::models::{BatchOutcome, BatchStats, ClassificationResult, ClassifyMethod, ValidationDecision};
use crate::onnx::OrtRuntimeConfig;
use crate::semantic::SemanticClassifier;
use crate::validator::Validator;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub type DetectorFactory = Box<dyn Fn(&Settings) -> Result<Arc<dyn Detector>> + Send + Sync>;
pub type ScorerFactory = Box<dyn Fn(&Settings) -> Result<Arc<dyn EmbeddingScorer>> + Send + Sync>;

#[derive(Clone)]
pub struct ModelContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    settings: Settings,
    detector: OnceCell<Arc<dyn Detector>>,
    scorer: OnceCell<Arc<dyn EmbeddingScorer>>,
    detector_factory: DetectorFactory,
    scorer_factory: ScorerFactory,
}

/// Per-image results of [`ModelContext::classify`], aligned with the input paths.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifyReport {
    pub results: Vec<ClassificationResult>,
    pub methods: Vec<ClassifyMethod>,
    pub stats: BatchStats,
    /// Present for fast-path images when validation was requested.
    pub validations: Vec<Option<ValidationDecision>>,
}

impl ModelContext {
    pub fn from_settings(settings: Settings) -> Self {
        Self::with_factories(settings, Box::new(onnx_detector), Box::new(onnx_scorer))
    }

    pub fn with_factories(
        settings: Settings,
        detector_factory: DetectorFactory,
        scorer_factory: ScorerFactory,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                settings,
                detector: OnceCell::new(),
                scorer: OnceCell::new(),
                detector_factory,
                scorer_factory,
            }),
        }
    }

    pub fn with_models(
        settings: Settings,
        detector: Arc<dyn Detector>,
        scorer: Arc<dyn EmbeddingScorer>,
    ) -> Self {
        let ctx = Self::with_factories(settings, Box::new(no_detector), Box::new(no_scorer));
        let _ = ctx.inner.detector.set(detector);
        let _ = ctx.inner.scorer.set(scorer);
        ctx
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Loads both models now so a bad model path fails at startup instead of on the
    /// first request.
    pub fn preload(&self) -> Result<()> {
        self.detector()?;
        self.scorer()?;
        Ok(())
    }

    pub fn detector(&self) -> Result<Arc<dyn Detector>> {
        self.inner
            .detector
            .get_or_try_init(|| (self.inner.detector_factory)(&self.inner.settings))
            .cloned()
    }

    pub fn scorer(&self) -> Result<Arc<dyn EmbeddingScorer>> {
        self.inner
            .scorer
            .get_or_try_init(|| (self.inner.scorer_factory)(&self.inner.settings))
            .cloned()
    }

    pub fn semantic(&self) -> Result<SemanticClassifier> {
        Ok(SemanticClassifier::new(
            self.scorer()?,
            self.inner.settings.semantic.clone(),
        ))
    }

    pub fn hybrid(&self) -> Result<HybridClassifier> {
        Ok(HybridClassifier::new(
            self.detector()?,
            self.semantic()?,
            CategoryMapper::new(self.inner.settings.mapper.clone()),
        ))
    }

    pub fn validator(&self) -> Result<Validator> {
        Ok(Validator::new(
            self.semantic()?,
            self.inner.settings.validation.clone(),
        ))
    }

    /// Every image gets at least one tag; only a model that cannot be loaded fails this.
    pub fn classify(&self, images: &[&Path], options: &ClassifyOptions) -> Result<ClassifyReport> {
        let hybrid = self.hybrid()?;
        let BatchOutcome {
            mut results,
            methods,
            stats,
        } = match images {
            [image] => {
                let outcome = hybrid.classify(image, options);
                BatchOutcome {
                    stats: BatchStats {
                        batch_id: Uuid::new_v4().to_string(),
                        total_images: 1,
                        fast_success: usize::from(outcome.method == ClassifyMethod::FastPath),
                        fallback: usize::from(outcome.method == ClassifyMethod::SemanticFallback),
                        fast_time: outcome.timing.fast,
                        semantic_time: outcome.timing.semantic,
                        total_time: outcome.timing.total,
                        avg_per_image: outcome.timing.total,
                    },
                    results: vec![outcome.result],
                    methods: vec![outcome.method],
                }
            }
            _ => hybrid.classify_batch(images, options),
        };

        let mut validations = vec![None; images.len()];
        if options.validate {
            let validator = self.validator()?;
            for (idx, image) in images.iter().enumerate() {
                if methods[idx] != ClassifyMethod::FastPath {
                    continue;
                }
                let decision = validator.validate(image, &results[idx].tags, options.threshold);
                if decision.should_override && !decision.override_tags.is_empty() {
                    log::info!(
                        "Validation updated {}: {:?} -> {:?}",
                        image.display(),
                        results[idx].tags,
                        decision.override_tags
                    );
                    results[idx].tags = decision.override_tags.clone();
                }
                validations[idx] = Some(decision);
            }
        }

        Ok(ClassifyReport {
            results,
            methods,
            stats,
            validations,
        })
    }
}

fn no_detector(_: &Settings) -> Result<Arc<dyn Detector>> {
    Err(Error::Init("no detector factory configured".into()))
}

fn no_scorer(_: &Settings) -> Result<Arc<dyn EmbeddingScorer>> {
    Err(Error::Init("no embedding factory configured".into()))
}

fn runtime(settings: &Settings) -> OrtRuntimeConfig {
    OrtRuntimeConfig {
        provider: settings.models.provider,
        device_id: settings.models.device_id,
    }
}

fn onnx_detector(settings: &Settings) -> Result<Arc<dyn Detector>> {
    let models = &settings.models;
    let path = models.detector_path();
    if !path.exists() {
        return Err(Error::Init(format!(
            "Detection model not found at {}",
            path.display()
        )));
    }
    let detector = OnnxDetector::load(
        &path,
        models.detector_input_size,
        models.detector_min_score,
        models.detector_iou_threshold,
        runtime(settings),
    )?;
    Ok(Arc::new(detector))
}

fn onnx_scorer(settings: &Settings) -> Result<Arc<dyn EmbeddingScorer>> {
    let models = &settings.models;
    let path = models.embedding_path();
    if !path.exists() {
        return Err(Error::Init(format!(
            "Embedding model not found at {}",
            path.display()
        )));
    }
    let scorer = OnnxEmbeddingScorer::load(
        &path,
        &models.prompt_embeddings(),
        models.embedding_input_size,
        runtime(settings),
    )?;
    Ok(Arc::new(scorer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;
    use crate::testing::{detection, ScriptedScorer, StaticDetector};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(detector: StaticDetector, scorer: ScriptedScorer) -> ModelContext {
        ModelContext::with_models(Settings::default(), Arc::new(detector), Arc::new(scorer))
    }

    #[test]
    fn single_image_reports_stats() {
        let ctx = context(
            StaticDetector::default().with("kid.jpg", vec![detection(0, 0.55, 0.15)]),
            ScriptedScorer::default(),
        );
        let report = ctx
            .classify(&[Path::new("kid.jpg")], &ClassifyOptions::default())
            .unwrap();
        assert_eq!(report.results[0].tags, vec![Category::People]);
        assert_eq!(report.stats.total_images, 1);
        assert_eq!(report.stats.fast_success, 1);
        assert_eq!(report.validations, vec![None]);
    }

    #[test]
    fn failed_single_image_is_not_a_semantic_fallback() {
        let ctx = context(
            StaticDetector::default().failing_on("x.jpg"),
            ScriptedScorer::default(),
        );
        let report = ctx
            .classify(&[Path::new("x.jpg")], &ClassifyOptions::default())
            .unwrap();
        assert_eq!(report.methods, vec![ClassifyMethod::FallbackOther]);
        assert_eq!(report.stats.fast_success, 0);
        assert_eq!(report.stats.fallback, 0);
    }

    #[test]
    fn expected_tags_match_between_single_and_batch() {
        let ctx = context(
            StaticDetector::default(),
            ScriptedScorer::default()
                .with("dim.jpg", &[(Category::Animals, 0.35)])
                .with("other.jpg", &[(Category::Scenery, 0.9)]),
        );
        let options = ClassifyOptions {
            expected_tags: Some(vec![Category::Animals]),
            ..Default::default()
        };
        let single = ctx.classify(&[Path::new("dim.jpg")], &options).unwrap();
        let batch = ctx
            .classify(&[Path::new("dim.jpg"), Path::new("other.jpg")], &options)
            .unwrap();
        assert_eq!(single.results[0].tags, vec![Category::Animals]);
        assert_eq!(batch.results[0].tags, single.results[0].tags);
        assert_eq!(batch.stats.fallback, 2);
    }

    #[test]
    fn validation_extends_fast_path_tags() {
        let ctx = context(
            StaticDetector::default()
                .with("dog.jpg", vec![detection(16, 0.8, 0.3)])
                .with("bowl.jpg", vec![detection(45, 0.9, 0.4)]),
            ScriptedScorer::default()
                .with("dog.jpg", &[(Category::Scenery, 0.75), (Category::Animals, 0.1)])
                .with("bowl.jpg", &[(Category::Food, 0.85)]),
        );
        let options = ClassifyOptions {
            validate: true,
            ..Default::default()
        };
        let report = ctx
            .classify(&[Path::new("dog.jpg"), Path::new("bowl.jpg")], &options)
            .unwrap();
        assert_eq!(report.results[0].tags, vec![Category::Animals, Category::Scenery]);
        assert!(report.validations[0].as_ref().unwrap().should_override);
        // fallback results are not validated
        assert_eq!(report.results[1].tags, vec![Category::Food]);
        assert!(report.validations[1].is_none());
    }

    #[test]
    fn models_load_once_and_are_shared() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let ctx = ModelContext::with_factories(
            Settings::default(),
            Box::new(move |_: &Settings| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(StaticDetector::default()) as Arc<dyn Detector>)
            }),
            Box::new(|_: &Settings| Ok(Arc::new(ScriptedScorer::default()) as Arc<dyn EmbeddingScorer>)),
        );
        let clone = ctx.clone();
        ctx.preload().unwrap();
        clone.detector().unwrap();
        ctx.hybrid().unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_models_fail_preload() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.models.models_dir = dir.path().to_path_buf();
        let ctx = ModelContext::from_settings(settings);
        assert!(matches!(ctx.preload(), Err(Error::Init(_))));
        assert!(ctx.classify(&[Path::new("a.jpg")], &ClassifyOptions::default()).is_err());
    }
}
