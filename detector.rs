use crate::error::{Error, Result};
use crate::mapper::COCO_LABELS;
use crate::models::{BoundingBox, Detection};
use crate::onnx::{build_session, safe_run, OrtRuntimeConfig};
use image::imageops::FilterType;
use image::GenericImageView;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Fast bounding-box detector. An `Err` means the detector could not run at all; an
/// empty `Ok` means it ran and found nothing.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &Path) -> Result<Vec<Detection>>;

    fn name(&self) -> &str;
}

pub struct OnnxDetector {
    session: Mutex<Session>,
    labels: Vec<String>,
    input_size: u32,
    min_score: f32,
    iou_threshold: f32,
    model_path: PathBuf,
}

impl OnnxDetector {
    pub fn load(
        model_path: &Path,
        input_size: u32,
        min_score: f32,
        iou_threshold: f32,
        runtime: OrtRuntimeConfig,
    ) -> Result<Self> {
        let (session, provider) = build_session(model_path, runtime)?;
        let mut labels = load_labels_from_model(model_path);
        if labels.is_empty() {
            labels = COCO_LABELS.iter().map(|s| s.to_string()).collect();
        }
        log::info!(
            "Loaded detection model: {} on {} ({} classes)",
            model_path.display(),
            provider.label(),
            labels.len()
        );
        Ok(Self {
            session: Mutex::new(session),
            labels,
            input_size,
            min_score,
            iou_threshold,
            model_path: model_path.to_path_buf(),
        })
    }

    fn run(&self, input: Array4<f32>) -> Result<(Vec<usize>, Vec<f32>)> {
        let tensor = Tensor::from_array(input)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| Error::Inference("detection session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![tensor])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let dims = shape.iter().map(|d| *d as usize).collect();
        Ok((dims, data.to_vec()))
    }
}

impl Detector for OnnxDetector {
    fn detect(&self, image: &Path) -> Result<Vec<Detection>> {
        let img = image::open(image)?;
        let (orig_w, orig_h) = img.dimensions();
        let size = self.input_size;
        let resized = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();
        let input = Array4::from_shape_vec(
            (1, 3, size as usize, size as usize),
            rgb8_to_nchw(&resized, size, size),
        )
        .map_err(|e| Error::Inference(format!("Invalid detection tensor shape: {e}")))?;

        let (dims, data) = safe_run(|| self.run(input))?;
        let layout = YoloLayout::from_dims(&dims).ok_or_else(|| {
            Error::Inference(format!(
                "Unsupported detection output shape {dims:?} from {}",
                self.model_path.display()
            ))
        })?;
        let raw = decode_yolo(
            &data,
            layout,
            (orig_w, orig_h),
            size,
            self.min_score,
            &self.labels,
        );
        let kept = non_max_suppression(raw, self.iou_threshold);
        log::debug!("{} detections for {}", kept.len(), image.display());
        Ok(kept)
    }

    fn name(&self) -> &str {
        "onnx-yolo"
    }
}

/// Row/column arrangement of a single YOLOv8 output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YoloLayout {
    pub attributes: usize,
    pub anchors: usize,
    /// `[1, anchors, attributes]` instead of `[1, attributes, anchors]`.
    pub transposed: bool,
}

impl YoloLayout {
    pub fn from_dims(dims: &[usize]) -> Option<Self> {
        let (a, b) = match dims {
            [1, a, b] => (*a, *b),
            [a, b] => (*a, *b),
            _ => return None,
        };
        if a >= 5 && b > a {
            Some(Self { attributes: a, anchors: b, transposed: false })
        } else if b >= 5 && a > b {
            Some(Self { attributes: b, anchors: a, transposed: true })
        } else {
            None
        }
    }

    fn value(&self, data: &[f32], anchor: usize, attribute: usize) -> f32 {
        let idx = if self.transposed {
            anchor * self.attributes + attribute
        } else {
            attribute * self.anchors + anchor
        };
        data.get(idx).copied().unwrap_or(0.0)
    }
}

/// Decodes centre-size boxes with per-class scores (no objectness column) into detections
/// in original-image pixel coordinates.
pub fn decode_yolo(
    data: &[f32],
    layout: YoloLayout,
    image_size: (u32, u32),
    input_size: u32,
    min_score: f32,
    labels: &[String],
) -> Vec<Detection> {
    let (orig_w, orig_h) = image_size;
    let sx = orig_w as f32 / input_size as f32;
    let sy = orig_h as f32 / input_size as f32;
    let classes = layout.attributes - 4;
    let mut out = Vec::new();
    for anchor in 0..layout.anchors {
        let mut best: Option<(usize, f32)> = None;
        for cls in 0..classes {
            let score = layout.value(data, anchor, 4 + cls);
            if !score.is_finite() {
                continue;
            }
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((cls, score));
            }
        }
        let Some((cls, score)) = best else {
            continue;
        };
        if score < min_score {
            continue;
        }
        let cx = layout.value(data, anchor, 0);
        let cy = layout.value(data, anchor, 1);
        let w = layout.value(data, anchor, 2);
        let h = layout.value(data, anchor, 3);
        let bbox = BoundingBox {
            x1: ((cx - w / 2.0) * sx).clamp(0.0, orig_w as f32),
            y1: ((cy - h / 2.0) * sy).clamp(0.0, orig_h as f32),
            x2: ((cx + w / 2.0) * sx).clamp(0.0, orig_w as f32),
            y2: ((cy + h / 2.0) * sy).clamp(0.0, orig_h as f32),
        };
        let label = labels
            .get(cls)
            .cloned()
            .unwrap_or_else(|| format!("class_{cls}"));
        out.push(Detection {
            class_id: cls as u32,
            label,
            confidence: score.clamp(0.0, 1.0),
            bbox,
            image_size,
        });
    }
    out
}

/// Greedy per-class suppression, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<Detection> = Vec::new();
    for det in detections {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou_threshold);
        if !overlaps {
            kept.push(det);
        }
    }
    kept
}

fn rgb8_to_nchw(img: &image::RgbImage, w: u32, h: u32) -> Vec<f32> {
    let plane = (w * h) as usize;
    let mut input = vec![0.0; plane * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let idx = (y * w + x) as usize;
        input[idx] = pixel[0] as f32 / 255.0;
        input[idx + plane] = pixel[1] as f32 / 255.0;
        input[idx + plane * 2] = pixel[2] as f32 / 255.0;
    }
    input
}

fn load_labels_from_model(model_path: &Path) -> Vec<String> {
    let labels_path = model_path.with_extension("labels.txt");
    if !labels_path.exists() {
        log::debug!(
            "No labels sidecar for {}; using COCO names",
            model_path.display()
        );
        return Vec::new();
    }
    match std::fs::read_to_string(&labels_path) {
        Ok(contents) => parse_labels(&contents),
        Err(err) => {
            log::warn!(
                "Failed to read labels from {}: {}",
                labels_path.display(),
                err
            );
            Vec::new()
        }
    }
}

pub fn parse_labels(contents: &str) -> Vec<String> {
    contents.lines().filter_map(normalize_label).collect()
}

/// Accepts `person`, `0 person`, `0: person` and `"person", ...` style lines.
fn normalize_label(line: &str) -> Option<String> {
    let mut label = line.trim();
    if label.is_empty() || label.starts_with('#') {
        return None;
    }
    if let Some((prefix, rest)) = label.split_once(':') {
        if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) {
            label = rest.trim();
        }
    } else {
        let mut parts = label.splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        if !first.is_empty() && first.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
            label = rest.trim();
        }
    }
    if let Some((head, _)) = label.split_once(',') {
        label = head.trim();
    }
    label = label.trim_matches('"').trim_matches('\'');
    if label.is_empty() {
        return None;
    }
    Some(label.to_lowercase())
}
