use crate::error::{Error, Result};
use crate::models::Category;
use crate::onnx::ProviderChoice;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    pub models_dir: PathBuf,
    pub detector_model_path: PathBuf,
    pub embedding_model_path: PathBuf,
    /// Prompt text embeddings; defaults to `<embedding model>.prompts.json`.
    #[serde(default)]
    pub prompt_embeddings_path: Option<PathBuf>,
    #[serde(default = "default_detector_input_size")]
    pub detector_input_size: u32,
    #[serde(default = "default_detector_min_score")]
    pub detector_min_score: f32,
    #[serde(default = "default_detector_iou_threshold")]
    pub detector_iou_threshold: f32,
    #[serde(default = "default_embedding_input_size")]
    pub embedding_input_size: u32,
    #[serde(default = "default_provider")]
    pub provider: ProviderChoice,
    #[serde(default)]
    pub device_id: Option<u32>,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            detector_model_path: PathBuf::from("yolov8n.onnx"),
            embedding_model_path: PathBuf::from("mobileclip_image.onnx"),
            prompt_embeddings_path: None,
            detector_input_size: default_detector_input_size(),
            detector_min_score: default_detector_min_score(),
            detector_iou_threshold: default_detector_iou_threshold(),
            embedding_input_size: default_embedding_input_size(),
            provider: default_provider(),
            device_id: None,
        }
    }
}

fn default_detector_input_size() -> u32 {
    640
}

fn default_detector_min_score() -> f32 {
    0.25
}

fn default_detector_iou_threshold() -> f32 {
    0.45
}

fn default_embedding_input_size() -> u32 {
    224
}

fn default_provider() -> ProviderChoice {
    ProviderChoice::Auto
}

impl ModelPaths {
    pub fn resolve_model(&self, name: &Path) -> PathBuf {
        if name.is_absolute() {
            name.to_path_buf()
        } else {
            self.models_dir.join(name)
        }
    }

    pub fn detector_path(&self) -> PathBuf {
        self.resolve_model(&self.detector_model_path)
    }

    pub fn embedding_path(&self) -> PathBuf {
        self.resolve_model(&self.embedding_model_path)
    }

    pub fn prompt_embeddings(&self) -> PathBuf {
        match &self.prompt_embeddings_path {
            Some(path) => self.resolve_model(path),
            None => self.embedding_path().with_extension("prompts.json"),
        }
    }
}

/// Floors used when turning detections into a dominant category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperConfig {
    pub base_confidence: f32,
    pub animal_min_confidence: f32,
    pub food_min_confidence: f32,
    pub people_min_confidence: f32,
    pub min_box_fraction: f32,
    pub min_person_fraction: f32,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            base_confidence: 0.60,
            animal_min_confidence: 0.45,
            food_min_confidence: 0.80,
            people_min_confidence: 0.50,
            min_box_fraction: 0.20,
            min_person_fraction: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryThresholds {
    pub people: f32,
    pub animals: f32,
    pub food: f32,
    pub scenery: f32,
    pub document: f32,
    pub illustration: f32,
}

impl Default for CategoryThresholds {
    fn default() -> Self {
        Self {
            people: 0.80,
            animals: 0.70,
            food: 0.80,
            scenery: 0.70,
            document: 0.70,
            illustration: 0.60,
        }
    }
}

impl CategoryThresholds {
    pub fn for_category(&self, category: Category) -> Option<f32> {
        match category {
            Category::People => Some(self.people),
            Category::Animals => Some(self.animals),
            Category::Food => Some(self.food),
            Category::Scenery => Some(self.scenery),
            Category::Document => Some(self.document),
            Category::Other => None,
        }
    }

    fn values(&self) -> [f32; 6] {
        [
            self.people,
            self.animals,
            self.food,
            self.scenery,
            self.document,
            self.illustration,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticConfig {
    pub base_threshold: f32,
    #[serde(default)]
    pub category_thresholds: CategoryThresholds,
    #[serde(default = "default_illustration_suppression")]
    pub illustration_suppression: f32,
    #[serde(default = "default_progressive_thresholds")]
    pub progressive_thresholds: Vec<f32>,
    #[serde(default = "default_max_tags")]
    pub max_tags: Option<usize>,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            base_threshold: 0.70,
            category_thresholds: CategoryThresholds::default(),
            illustration_suppression: default_illustration_suppression(),
            progressive_thresholds: default_progressive_thresholds(),
            max_tags: default_max_tags(),
        }
    }
}

fn default_illustration_suppression() -> f32 {
    0.40
}

fn default_progressive_thresholds() -> Vec<f32> {
    vec![0.80, 0.70, 0.60, 0.50, 0.40, 0.30, 0.20]
}

fn default_max_tags() -> Option<usize> {
    Some(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub threshold_drop: f32,
    pub threshold_floor: f32,
    pub agreement_ratio: f32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            threshold_drop: 0.20,
            threshold_floor: 0.40,
            agreement_ratio: 0.5,
        }
    }
}

impl ValidationConfig {
    pub fn relaxed_threshold(&self, threshold: f32) -> f32 {
        (threshold - self.threshold_drop).max(self.threshold_floor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tags_db.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub models: ModelPaths,
    #[serde(default)]
    pub mapper: MapperConfig,
    #[serde(default)]
    pub semantic: SemanticConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let data = std::fs::read(path).map_err(|e| {
                    Error::Config(format!("Failed to read {}: {e}", path.display()))
                })?;
                let settings: Settings = serde_json::from_slice(&data)?;
                log::info!("Loaded settings from {}", path.display());
                settings
            }
            None => Settings::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let mapper = &self.mapper;
        let semantic = &self.semantic;
        let mut probabilities = vec![
            ("mapper.base_confidence", mapper.base_confidence),
            ("mapper.animal_min_confidence", mapper.animal_min_confidence),
            ("mapper.food_min_confidence", mapper.food_min_confidence),
            ("mapper.people_min_confidence", mapper.people_min_confidence),
            ("mapper.min_box_fraction", mapper.min_box_fraction),
            ("mapper.min_person_fraction", mapper.min_person_fraction),
            ("semantic.base_threshold", semantic.base_threshold),
            ("semantic.illustration_suppression", semantic.illustration_suppression),
            ("validation.threshold_floor", self.validation.threshold_floor),
            ("validation.agreement_ratio", self.validation.agreement_ratio),
            ("models.detector_min_score", self.models.detector_min_score),
            ("models.detector_iou_threshold", self.models.detector_iou_threshold),
        ];
        for value in semantic.category_thresholds.values() {
            probabilities.push(("semantic.category_thresholds", value));
        }
        for value in &semantic.progressive_thresholds {
            probabilities.push(("semantic.progressive_thresholds", *value));
        }
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if semantic
            .progressive_thresholds
            .windows(2)
            .any(|pair| pair[1] >= pair[0])
        {
            return Err(Error::Config(
                "semantic.progressive_thresholds must be strictly decreasing".into(),
            ));
        }
        if self.validation.threshold_floor > semantic.base_threshold {
            return Err(Error::Config(format!(
                "validation.threshold_floor ({}) exceeds semantic.base_threshold ({})",
                self.validation.threshold_floor, semantic.base_threshold
            )));
        }
        if semantic.max_tags == Some(0) {
            return Err(Error::Config("semantic.max_tags must be at least 1".into()));
        }
        if self.models.detector_input_size == 0 || self.models.embedding_input_size == 0 {
            return Err(Error::Config("model input sizes must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn relaxed_threshold_is_floored() {
        let cfg = ValidationConfig::default();
        assert!((cfg.relaxed_threshold(0.70) - 0.50).abs() < 1e-6);
        assert!((cfg.relaxed_threshold(0.50) - 0.40).abs() < 1e-6);
    }

    #[test]
    fn rejects_non_decreasing_progressive_thresholds() {
        let mut settings = Settings::default();
        settings.semantic.progressive_thresholds = vec![0.8, 0.8, 0.5];
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut settings = Settings::default();
        settings.mapper.food_min_confidence = 1.5;
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "semantic": {{ "base_threshold": 0.6 }} }}"#).unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.semantic.base_threshold, 0.6);
        assert_eq!(settings.semantic.progressive_thresholds.len(), 7);
        assert_eq!(settings.mapper.food_min_confidence, 0.80);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/settings.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn prompt_embeddings_default_to_model_sidecar() {
        let paths = ModelPaths::default();
        assert_eq!(
            paths.prompt_embeddings(),
            PathBuf::from("models").join("mobileclip_image.prompts.json")
        );
    }
}
