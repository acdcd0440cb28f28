use crate::error::{Error, Result};
use crate::onnx::{build_session, safe_run, OrtRuntimeConfig};
use image::imageops::FilterType;
use ndarray::{Array2, Array4, Axis};
use ort::session::Session;
use ort::value::Tensor;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Similarity between one image and an ordered list of text prompts.
///
/// Implementations return one score per prompt, in prompt order. The stock ONNX scorer
/// returns probabilities summing to 1.
pub trait EmbeddingScorer: Send + Sync {
    fn score(&self, image: &Path, prompts: &[&str]) -> Result<Vec<f32>>;

    /// Batch scoring, aligned with `images`. `None` marks an image that could not be
    /// loaded; it never aborts the rest of the batch. An `Err` means the batch call itself
    /// failed.
    fn score_batch(&self, images: &[&Path], prompts: &[&str]) -> Result<Vec<Option<Vec<f32>>>> {
        Ok(images
            .iter()
            .map(|image| match self.score(image, prompts) {
                Ok(scores) => Some(scores),
                Err(err) => {
                    log::warn!("Failed to score {}: {err}", image.display());
                    None
                }
            })
            .collect())
    }

    fn name(&self) -> &str;
}

pub fn normalize_embedding(vec: &[f32]) -> (Vec<f32>, f32) {
    let mut norm = 0.0f32;
    for v in vec {
        norm += v * v;
    }
    norm = norm.sqrt().max(1e-6);
    let normalized = vec.iter().map(|v| v / norm).collect();
    (normalized, norm)
}

/// Dot product; both inputs are expected to be unit length already.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn softmax(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let max_val = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut exps = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for v in values {
        let e = (v - max_val).exp();
        exps.push(e);
        sum += e;
    }
    if sum <= 0.0 || !sum.is_finite() {
        return vec![0.0; values.len()];
    }
    exps.iter().map(|e| e / sum).collect()
}

const LOGIT_SCALE: f32 = 100.0;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// Scores a single image embedding against prompt embeddings: softmax(100 * cosine).
pub fn prompt_probabilities(image_embedding: &[f32], prompt_embeddings: &[&[f32]]) -> Vec<f32> {
    let (image, _) = normalize_embedding(image_embedding);
    let logits: Vec<f32> = prompt_embeddings
        .iter()
        .map(|prompt| LOGIT_SCALE * cosine_similarity(&image, prompt))
        .collect();
    softmax(&logits)
}

/// Offline-encoded prompt text embeddings, keyed by prompt text.
#[derive(Debug, Clone, Default)]
pub struct PromptEmbeddings {
    by_text: HashMap<String, Vec<f32>>,
}

impl PromptEmbeddings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            Error::Init(format!("Prompt embeddings not readable at {}: {e}", path.display()))
        })?;
        let raw: HashMap<String, Vec<f32>> = serde_json::from_slice(&data)?;
        Ok(Self::from_map(raw))
    }

    pub fn from_map(raw: HashMap<String, Vec<f32>>) -> Self {
        let by_text = raw
            .into_iter()
            .map(|(text, vec)| (text, normalize_embedding(&vec).0))
            .collect();
        Self { by_text }
    }

    pub fn lookup(&self, prompts: &[&str]) -> Result<Vec<&[f32]>> {
        prompts
            .iter()
            .map(|text| {
                self.by_text
                    .get(*text)
                    .map(Vec::as_slice)
                    .ok_or_else(|| Error::Inference(format!("No embedding for prompt \"{text}\"")))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_text.is_empty()
    }
}

/// Image encoder exported to ONNX plus prompt embeddings computed offline.
pub struct OnnxEmbeddingScorer {
    session: Mutex<Session>,
    prompts: PromptEmbeddings,
    input_size: u32,
    model_path: PathBuf,
}

impl OnnxEmbeddingScorer {
    pub fn load(
        model_path: &Path,
        prompts_path: &Path,
        input_size: u32,
        runtime: OrtRuntimeConfig,
    ) -> Result<Self> {
        let prompts = PromptEmbeddings::load(prompts_path)?;
        if prompts.is_empty() {
            return Err(Error::Init(format!(
                "Prompt embeddings file is empty: {}",
                prompts_path.display()
            )));
        }
        let (session, provider) = build_session(model_path, runtime)?;
        log::info!(
            "Loaded embedding model: {} on {} ({} prompts)",
            model_path.display(),
            provider.label(),
            prompts.len()
        );
        Ok(Self {
            session: Mutex::new(session),
            prompts,
            input_size,
            model_path: model_path.to_path_buf(),
        })
    }

    fn preprocess(&self, image: &Path) -> Result<Vec<f32>> {
        let size = self.input_size;
        let img = image::open(image)?;
        let resized = img.resize_exact(size, size, FilterType::Triangle).to_rgb32f();
        let plane = (size * size) as usize;
        let mut input = vec![0.0; plane * 3];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let idx = (y * size + x) as usize;
            for c in 0..3 {
                input[idx + plane * c] = (pixel[c] - CLIP_MEAN[c]) / CLIP_STD[c];
            }
        }
        Ok(input)
    }

    fn encode(&self, pixels: Vec<f32>, batch: usize) -> Result<Array2<f32>> {
        let size = self.input_size as usize;
        let array = Array4::from_shape_vec((batch, 3, size, size), pixels)
            .map_err(|e| Error::Inference(format!("Invalid embedding tensor shape: {e}")))?;
        let input = Tensor::from_array(array)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| Error::Inference("embedding session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![input])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
        let width = match dims.as_slice() {
            [b, d] if *b == batch => *d,
            [d] if batch == 1 => *d,
            other => {
                return Err(Error::Inference(format!(
                    "Unexpected embedding output shape {other:?} from {}",
                    self.model_path.display()
                )))
            }
        };
        Array2::from_shape_vec((batch, width), data.to_vec())
            .map_err(|e| Error::Inference(format!("Invalid embedding output: {e}")))
    }
}

impl EmbeddingScorer for OnnxEmbeddingScorer {
    fn score(&self, image: &Path, prompts: &[&str]) -> Result<Vec<f32>> {
        let prompt_vecs = self.prompts.lookup(prompts)?;
        let pixels = self.preprocess(image)?;
        let embeddings = safe_run(|| self.encode(pixels, 1))?;
        let row = embeddings.index_axis(Axis(0), 0).to_vec();
        Ok(prompt_probabilities(&row, &prompt_vecs))
    }

    fn score_batch(&self, images: &[&Path], prompts: &[&str]) -> Result<Vec<Option<Vec<f32>>>> {
        let prompt_vecs = self.prompts.lookup(prompts)?;
        let mut loaded = Vec::with_capacity(images.len());
        let mut pixels = Vec::new();
        for (idx, image) in images.iter().enumerate() {
            match self.preprocess(image) {
                Ok(data) => {
                    pixels.extend(data);
                    loaded.push(idx);
                }
                Err(err) => log::warn!("Failed to load {}: {err}", image.display()),
            }
        }
        let mut out = vec![None; images.len()];
        if loaded.is_empty() {
            return Ok(out);
        }
        let embeddings = safe_run(|| self.encode(pixels, loaded.len()))?;
        for (row, idx) in embeddings.axis_iter(Axis(0)).zip(loaded) {
            let row = row.to_vec();
            out[idx] = Some(prompt_probabilities(&row, &prompt_vecs));
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "onnx-embedding"
    }
}
