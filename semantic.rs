use crate::config::SemanticConfig;
use crate::embedding::EmbeddingScorer;
use crate::error::Result;
use crate::models::{Category, ScoredTag};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PromptKind {
    Tag(Category),
    /// Scored alongside the categories but never emitted.
    Illustration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryPrompt {
    pub kind: PromptKind,
    pub text: String,
}

impl CategoryPrompt {
    pub fn new(kind: PromptKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

pub fn default_prompts() -> Vec<CategoryPrompt> {
    vec![
        CategoryPrompt::new(PromptKind::Tag(Category::People), "people"),
        CategoryPrompt::new(PromptKind::Tag(Category::Animals), "animals"),
        CategoryPrompt::new(PromptKind::Tag(Category::Food), "food"),
        CategoryPrompt::new(PromptKind::Tag(Category::Scenery), "scenery"),
        CategoryPrompt::new(
            PromptKind::Tag(Category::Document),
            "text document with visible writing",
        ),
        CategoryPrompt::new(
            PromptKind::Illustration,
            "cartoon, illustration, drawing, mascot, artwork",
        ),
    ]
}

#[derive(Clone)]
pub struct SemanticClassifier {
    scorer: Arc<dyn EmbeddingScorer>,
    prompts: Vec<CategoryPrompt>,
    config: SemanticConfig,
}

impl SemanticClassifier {
    pub fn new(scorer: Arc<dyn EmbeddingScorer>, config: SemanticConfig) -> Self {
        Self::with_prompts(scorer, default_prompts(), config)
    }

    pub fn with_prompts(
        scorer: Arc<dyn EmbeddingScorer>,
        prompts: Vec<CategoryPrompt>,
        config: SemanticConfig,
    ) -> Self {
        Self {
            scorer,
            prompts,
            config,
        }
    }

    pub fn config(&self) -> &SemanticConfig {
        &self.config
    }

    fn prompt_texts(&self) -> Vec<&str> {
        self.prompts.iter().map(|p| p.text.as_str()).collect()
    }

    /// Folds raw per-prompt scores into one score per prompt kind, sorted descending.
    /// Several prompts may describe the same kind; their probabilities add up.
    fn aggregate(&self, raw: &[f32]) -> Vec<(PromptKind, f32)> {
        let mut totals: BTreeMap<PromptKind, f32> = BTreeMap::new();
        for (prompt, score) in self.prompts.iter().zip(raw.iter()) {
            *totals.entry(prompt.kind).or_insert(0.0) += *score;
        }
        let mut scored: Vec<(PromptKind, f32)> = totals.into_iter().collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }

    /// Bar a category has to clear for caller threshold `threshold`. At or above the
    /// configured base the per-category bar applies unchanged (or the caller's, if higher);
    /// below it every bar is relaxed by the same amount.
    pub fn effective_threshold(&self, category: Category, threshold: f32) -> f32 {
        let Some(bar) = self.config.category_thresholds.for_category(category) else {
            return threshold;
        };
        let base = self.config.base_threshold;
        if threshold >= base {
            bar.max(threshold)
        } else {
            (bar - (base - threshold)).max(0.0)
        }
    }

    /// Applies the thresholding rules to one image's aggregated scores.
    pub fn select(
        &self,
        scored: &[(PromptKind, f32)],
        threshold: f32,
        max_tags: Option<usize>,
        expected: Option<&[Category]>,
    ) -> Vec<ScoredTag> {
        let limit = max_tags.unwrap_or(usize::MAX);

        if let Some(expected) = expected.filter(|e| !e.is_empty()) {
            for attempt in &self.config.progressive_thresholds {
                let found: Vec<ScoredTag> = scored
                    .iter()
                    .filter_map(|(kind, score)| match kind {
                        PromptKind::Tag(category)
                            if *score >= *attempt && expected.contains(category) =>
                        {
                            Some(ScoredTag {
                                category: *category,
                                confidence: *score,
                            })
                        }
                        _ => None,
                    })
                    .take(limit)
                    .collect();
                if !found.is_empty() {
                    log::info!("Found expected tags {expected:?} at threshold {attempt:.2}: {found:?}");
                    return found;
                }
            }
            log::warn!(
                "Expected tags {expected:?} not found down to the lowest threshold. Top scores: {:?}",
                &scored[..scored.len().min(3)]
            );
        }

        let illustration = scored
            .iter()
            .find(|(kind, _)| *kind == PromptKind::Illustration)
            .map(|(_, score)| *score)
            .unwrap_or(0.0);
        let looks_illustrated = illustration >= self.config.illustration_suppression;

        let mut results: Vec<ScoredTag> = Vec::new();
        for (kind, score) in scored {
            let PromptKind::Tag(category) = kind else {
                continue;
            };
            if *category == Category::Food && looks_illustrated {
                log::info!(
                    "Suppressing food (score={score:.2}); looks like an illustration (score={illustration:.2})"
                );
                continue;
            }
            if *score >= self.effective_threshold(*category, threshold) {
                results.push(ScoredTag {
                    category: *category,
                    confidence: *score,
                });
            }
        }
        if results.is_empty() {
            log::debug!(
                "No categories matched. Top scores: {:?}",
                &scored[..scored.len().min(3)]
            );
            results.push(ScoredTag {
                category: Category::Other,
                confidence: 0.0,
            });
        }
        results.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        results
    }

    pub fn classify(
        &self,
        image: &Path,
        threshold: f32,
        max_tags: Option<usize>,
        expected: Option<&[Category]>,
    ) -> Result<Vec<ScoredTag>> {
        let raw = self.scorer.score(image, &self.prompt_texts())?;
        let scored = self.aggregate(&raw);
        let results = self.select(&scored, threshold, max_tags, expected);
        log::info!("Classified {}: {:?}", image.display(), tag_names(&results));
        Ok(results)
    }

    /// Tag-only form of [`classify`](Self::classify) with the `other` sentinel stripped
    /// whenever a real category is present.
    pub fn classify_tags(
        &self,
        image: &Path,
        threshold: f32,
        max_tags: Option<usize>,
        expected: Option<&[Category]>,
    ) -> Result<Vec<Category>> {
        let results = self.classify(image, threshold, max_tags, expected)?;
        Ok(strip_other(results.into_iter().map(|t| t.category).collect()))
    }

    /// One tag list per input image, in input order. Images the scorer could not load get
    /// an empty list; an `Err` means the whole batch call failed.
    pub fn classify_batch(
        &self,
        images: &[&Path],
        threshold: f32,
        max_tags: Option<usize>,
        expected: Option<&[Category]>,
    ) -> Result<Vec<Vec<ScoredTag>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self.scorer.score_batch(images, &self.prompt_texts())?;
        let mut out = Vec::with_capacity(images.len());
        for (idx, image) in images.iter().enumerate() {
            match raw.get(idx).and_then(|r| r.as_ref()) {
                Some(scores) => {
                    let results = self.select(&self.aggregate(scores), threshold, max_tags, expected);
                    log::info!("Batch classified {}: {:?}", image.display(), tag_names(&results));
                    out.push(results);
                }
                None => out.push(Vec::new()),
            }
        }
        Ok(out)
    }

    pub fn classify_batch_tags(
        &self,
        images: &[&Path],
        threshold: f32,
        max_tags: Option<usize>,
        expected: Option<&[Category]>,
    ) -> Result<Vec<Vec<Category>>> {
        Ok(self
            .classify_batch(images, threshold, max_tags, expected)?
            .into_iter()
            .map(|tags| strip_other(tags.into_iter().map(|t| t.category).collect()))
            .collect())
    }
}

fn tag_names(tags: &[ScoredTag]) -> Vec<&'static str> {
    tags.iter().map(|t| t.category.as_str()).collect()
}

/// Drops `other` from any list holding a real category, and duplicates anywhere.
pub fn strip_other(tags: Vec<Category>) -> Vec<Category> {
    let has_real = tags.iter().any(|t| *t != Category::Other);
    let mut out: Vec<Category> = Vec::with_capacity(tags.len());
    for tag in tags {
        if has_real && tag == Category::Other {
            continue;
        }
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}
