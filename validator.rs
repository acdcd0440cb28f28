// Detector tags for people/animals/food are never removed here; the semantic
// classifier can only add scene tags next to them.

use crate::config::ValidationConfig;
use crate::models::{Category, ValidationDecision};
use crate::semantic::SemanticClassifier;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;

#[derive(Clone)]
pub struct Validator {
    semantic: SemanticClassifier,
    config: ValidationConfig,
}

impl Validator {
    pub fn new(semantic: SemanticClassifier, config: ValidationConfig) -> Self {
        Self { semantic, config }
    }

    pub fn validate(&self, image: &Path, fast_tags: &[Category], threshold: f32) -> ValidationDecision {
        let started = Instant::now();
        let mut decision = match self.reconcile(image, fast_tags, threshold) {
            Ok(decision) => decision,
            Err(err) => {
                log::error!("Validation error for {}: {err}", image.display());
                ValidationDecision {
                    reason: format!("Validation error: {err}"),
                    ..Default::default()
                }
            }
        };
        decision.elapsed = started.elapsed();
        decision
    }

    pub fn validate_batch(
        &self,
        items: &[(&Path, &[Category])],
        threshold: f32,
    ) -> Vec<ValidationDecision> {
        items
            .iter()
            .map(|(image, tags)| self.validate(image, tags, threshold))
            .collect()
    }

    fn reconcile(
        &self,
        image: &Path,
        fast_tags: &[Category],
        threshold: f32,
    ) -> crate::error::Result<ValidationDecision> {
        let max_tags = self.semantic.config().max_tags;
        let relaxed = self.config.relaxed_threshold(threshold);
        let semantic_tags = self.semantic.classify_tags(image, relaxed, max_tags, None)?;

        let mut decision = ValidationDecision {
            semantic_tags: semantic_tags.clone(),
            ..Default::default()
        };

        let fast: BTreeSet<Category> = fast_tags.iter().copied().collect();
        let relaxed_set: BTreeSet<Category> = semantic_tags.iter().copied().collect();
        if fast == relaxed_set {
            decision.agreement = true;
            decision.reason = "Perfect agreement".into();
            return Ok(decision);
        }
        let overlap: Vec<Category> = fast.intersection(&relaxed_set).copied().collect();
        if !overlap.is_empty() && overlap.len() as f32 >= fast.len() as f32 * self.config.agreement_ratio {
            decision.agreement = true;
            decision.reason = format!("Partial agreement: {}", join(&overlap));
            return Ok(decision);
        }

        if is_nothing(&semantic_tags) {
            decision.reason = format!(
                "Semantic classifier found nothing, keeping fast-path tags: {}",
                join(fast_tags)
            );
            log::info!("{}: {}", image.display(), decision.reason);
            return Ok(decision);
        }

        let hinted = self
            .semantic
            .classify_tags(image, threshold, max_tags, Some(fast_tags))?;
        log::info!(
            "Validation check for {}: fast={:?} relaxed={:?} hinted={:?}",
            image.display(),
            fast_tags,
            semantic_tags,
            hinted
        );

        if is_nothing(&hinted) {
            decision.reason = format!(
                "Semantic classifier found nothing confident, keeping fast-path tags: {}",
                join(fast_tags)
            );
        } else if fast_tags.iter().any(|t| t.is_object()) {
            let scene: Vec<Category> = hinted
                .iter()
                .copied()
                .filter(|t| !t.is_object() && *t != Category::Other && !fast.contains(t))
                .collect();
            if scene.is_empty() {
                decision.reason = format!(
                    "Detector objects are authoritative, keeping: {}",
                    join(fast_tags)
                );
            } else {
                let mut combined = fast_tags.to_vec();
                combined.extend(scene.iter().copied());
                decision.should_override = true;
                decision.reason = format!(
                    "Adding scene tags to detector objects: {} + {}",
                    join(fast_tags),
                    join(&scene)
                );
                decision.override_tags = combined;
            }
        } else {
            decision.should_override = true;
            decision.reason = format!(
                "No detector objects, using semantic tags: {}",
                join(&hinted)
            );
            decision.override_tags = hinted;
        }
        log::info!("{}: {}", image.display(), decision.reason);
        Ok(decision)
    }
}

/// An empty list or the bare `other` sentinel carries no opinion.
fn is_nothing(tags: &[Category]) -> bool {
    tags.iter().all(|t| *t == Category::Other)
}

fn join(tags: &[Category]) -> String {
    tags.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SemanticConfig;
    use crate::testing::ScriptedScorer;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn validator(scorer: Arc<ScriptedScorer>) -> Validator {
        Validator::new(
            SemanticClassifier::new(scorer, SemanticConfig::default()),
            ValidationConfig::default(),
        )
    }

    fn image() -> &'static Path {
        Path::new("photo.jpg")
    }

    #[test]
    fn identical_sets_agree_without_second_run() {
        let scorer = Arc::new(ScriptedScorer::default().with("photo.jpg", &[(Category::Animals, 0.9)]));
        let decision = validator(scorer.clone()).validate(image(), &[Category::Animals], 0.70);
        assert!(decision.agreement);
        assert!(!decision.should_override);
        assert_eq!(decision.reason, "Perfect agreement");
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn half_overlap_counts_as_agreement() {
        let scorer = Arc::new(ScriptedScorer::default().with(
            "photo.jpg",
            &[(Category::People, 0.6), (Category::Scenery, 0.3)],
        ));
        let decision =
            validator(scorer).validate(image(), &[Category::People, Category::Food], 0.70);
        assert!(decision.agreement);
        assert!(decision.reason.starts_with("Partial agreement"));
    }

    #[test]
    fn scene_tags_are_added_to_object_tags() {
        // relaxed run (0.50) sees scenery only, hinted run keeps it at 0.70
        let scorer = Arc::new(ScriptedScorer::default().with(
            "photo.jpg",
            &[(Category::Scenery, 0.75), (Category::Animals, 0.1)],
        ));
        let decision = validator(scorer).validate(image(), &[Category::Animals], 0.70);
        assert!(!decision.agreement);
        assert!(decision.should_override);
        assert_eq!(decision.override_tags, vec![Category::Animals, Category::Scenery]);
        assert_eq!(decision.semantic_tags, vec![Category::Scenery]);
    }

    #[test]
    fn object_override_is_always_a_superset() {
        let cases: &[&[(Category, f32)]] = &[
            &[(Category::Scenery, 0.9)],
            &[(Category::Document, 0.8), (Category::Scenery, 0.15)],
            &[(Category::Food, 0.95)],
            &[(Category::People, 0.85), (Category::Scenery, 0.1)],
        ];
        for fast in [
            vec![Category::Animals],
            vec![Category::People],
            vec![Category::Food, Category::Scenery],
        ] {
            for scores in cases {
                let scorer = Arc::new(ScriptedScorer::default().with("photo.jpg", scores));
                let decision = validator(scorer).validate(image(), &fast, 0.70);
                if decision.should_override {
                    for tag in &fast {
                        assert!(
                            decision.override_tags.contains(tag),
                            "{fast:?} with {scores:?} dropped {tag}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn semantic_object_opinions_are_ignored_when_detector_found_objects() {
        let scorer = Arc::new(ScriptedScorer::default().with("photo.jpg", &[(Category::Food, 0.95)]));
        let decision = validator(scorer).validate(image(), &[Category::Animals], 0.70);
        assert!(!decision.agreement);
        assert!(!decision.should_override);
        assert!(decision.override_tags.is_empty());
    }

    #[test]
    fn nothing_at_relaxed_threshold_keeps_fast_tags() {
        let scorer = Arc::new(ScriptedScorer::default().with("photo.jpg", &[(Category::Scenery, 0.2)]));
        let decision = validator(scorer.clone()).validate(image(), &[Category::Document], 0.70);
        assert!(!decision.should_override);
        assert_eq!(decision.semantic_tags, vec![Category::Other]);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_hinted_run_keeps_fast_tags() {
        // scenery clears the relaxed 0.50 bar but not the 0.70 one; the hint (document)
        // never shows up in the progressive search either
        let scorer = Arc::new(ScriptedScorer::default().with("photo.jpg", &[(Category::Scenery, 0.55)]));
        let decision = validator(scorer.clone()).validate(image(), &[Category::Document], 0.70);
        assert!(!decision.agreement);
        assert!(!decision.should_override);
        assert!(decision.reason.contains("nothing confident"));
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn non_object_fast_tags_are_replaced() {
        let scorer = Arc::new(ScriptedScorer::default().with(
            "photo.jpg",
            &[(Category::Scenery, 0.85), (Category::Document, 0.1)],
        ));
        let decision = validator(scorer).validate(image(), &[Category::Document], 0.70);
        assert!(decision.should_override);
        assert_eq!(decision.override_tags, vec![Category::Scenery]);
    }

    #[test]
    fn scorer_failure_reports_validation_error() {
        let scorer = Arc::new(ScriptedScorer::default());
        let decision = validator(scorer).validate(image(), &[Category::People], 0.70);
        assert!(!decision.should_override);
        assert!(!decision.agreement);
        assert!(decision.reason.starts_with("Validation error"));
    }

    #[test]
    fn batch_validates_each_pair() {
        let scorer = Arc::new(
            ScriptedScorer::default()
                .with("a.jpg", &[(Category::People, 0.9)])
                .with("b.jpg", &[(Category::Scenery, 0.9)]),
        );
        let people = [Category::People];
        let document = [Category::Document];
        let decisions = validator(scorer).validate_batch(
            &[(Path::new("a.jpg"), &people[..]), (Path::new("b.jpg"), &document[..])],
            0.70,
        );
        assert_eq!(decisions.len(), 2);
        assert!(decisions[0].agreement);
        assert_eq!(decisions[1].override_tags, vec![Category::Scenery]);
    }
}
