use crate::config::MapperConfig;
use crate::models::{Category, Detection, DetectionDebug, MappedDebug, MapperReport};
use lazy_static::lazy_static;
use std::collections::{BTreeMap, HashMap};

pub const PERSON_CLASS: u32 = 0;

lazy_static! {
    /// COCO class id to category. Tableware (bowl, cup, fork...) is deliberately absent:
    /// it shows up next to pets far too often to count as food.
    static ref CLASS_CATEGORY: HashMap<u32, Category> = {
        let mut map = HashMap::new();
        map.insert(PERSON_CLASS, Category::People);
        for id in ANIMAL_CLASSES {
            map.insert(*id, Category::Animals);
        }
        for id in FOOD_CLASSES {
            map.insert(*id, Category::Food);
        }
        map.insert(BOOK_CLASS, Category::Document);
        map
    };
}

const ANIMAL_CLASSES: &[u32] = &[14, 15, 16, 17, 18, 19, 20, 21, 22, 23];
const FOOD_CLASSES: &[u32] = &[46, 47, 48, 49, 50, 51, 52, 53, 54, 55];
const BOOK_CLASS: u32 = 73;

pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
    "refrigerator", "book", "clock", "vase", "scissors", "teddy bear", "hair drier",
    "toothbrush",
];

pub fn category_for_class(class_id: u32) -> Option<Category> {
    CLASS_CATEGORY.get(&class_id).copied()
}

#[derive(Debug, Clone, Default)]
pub struct CategoryMapper {
    config: MapperConfig,
}

impl CategoryMapper {
    pub fn new(config: MapperConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    fn min_confidence(&self, class_id: u32, category: Category, base: f32) -> f32 {
        match category {
            Category::Animals => self.config.animal_min_confidence,
            Category::Food => self.config.food_min_confidence,
            Category::People if class_id == PERSON_CLASS => self.config.people_min_confidence,
            _ => base,
        }
    }

    fn min_size(&self, class_id: u32) -> f32 {
        if class_id == PERSON_CLASS {
            self.config.min_person_fraction
        } else {
            self.config.min_box_fraction
        }
    }

    /// Maps one image's detections using the configured base confidence.
    pub fn map(&self, detections: &[Detection]) -> MapperReport {
        self.map_with_threshold(detections, self.config.base_confidence)
    }

    pub fn map_with_threshold(&self, detections: &[Detection], base: f32) -> MapperReport {
        let mut report = MapperReport::default();
        let mut scores: BTreeMap<Category, f32> = BTreeMap::new();

        for det in detections {
            let label = det.label.to_lowercase();
            let area = det.normalized_area();
            report.detections.push(DetectionDebug {
                label: label.clone(),
                class_id: det.class_id,
                confidence: det.confidence,
                box_percent: area * 100.0,
            });
            report.max_confidence = report.max_confidence.max(det.confidence);

            if det.confidence >= base && area >= self.config.min_box_fraction {
                report.all_objects.insert(label.clone());
            }

            let Some(category) = category_for_class(det.class_id) else {
                continue;
            };
            if det.confidence < self.min_confidence(det.class_id, category, base) {
                continue;
            }
            report.all_objects.insert(label.clone());

            let min_size = self.min_size(det.class_id);
            if area < min_size {
                log::debug!(
                    "Keeping {label} for search only; too small ({:.1}% < {:.1}%)",
                    area * 100.0,
                    min_size * 100.0
                );
                continue;
            }

            let weighted = det.confidence * area;
            *scores.entry(category).or_insert(0.0) += weighted;
            report.mapped.push(MappedDebug {
                category,
                from_class: label,
                confidence: det.confidence,
                box_percent: area * 100.0,
                weighted_score: weighted,
            });
        }

        report.dominant = scores
            .iter()
            .filter(|(_, score)| **score > 0.0)
            .max_by(|a, b| {
                a.0.priority().cmp(&b.0.priority()).then(
                    a.1.partial_cmp(b.1)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
            })
            .map(|(category, _)| *category);
        if let Some(dominant) = report.dominant {
            log::debug!("Category scores {scores:?} -> dominant {dominant}");
        }
        report.category_scores = scores;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoundingBox;

    const SIZE: (u32, u32) = (1000, 1000);

    /// Square-ish box covering `fraction` of a 1000x1000 image.
    fn det(class_id: u32, confidence: f32, fraction: f32) -> Detection {
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
            image_size: SIZE,
        }
    }

    fn mapper() -> CategoryMapper {
        CategoryMapper::default()
    }

    #[test]
    fn person_above_floors_is_dominant() {
        let report = mapper().map(&[det(0, 0.55, 0.15)]);
        assert_eq!(report.dominant, Some(Category::People));
        assert!(report.all_objects.contains("person"));
        assert!((report.category_scores[&Category::People] - 0.55 * 0.15).abs() < 1e-5);
    }

    #[test]
    fn person_below_people_floor_is_ignored() {
        let report = mapper().map(&[det(0, 0.45, 0.5)]);
        assert_eq!(report.dominant, None);
        assert!(report.all_objects.is_empty());
    }

    #[test]
    fn unmapped_class_only_feeds_search_set() {
        // bowl
        let report = mapper().map(&[det(45, 0.9, 0.4)]);
        assert_eq!(report.dominant, None);
        assert!(report.all_objects.contains("bowl"));
        assert!(report.category_scores.is_empty());
    }

    #[test]
    fn unmapped_class_below_size_floor_is_not_searchable() {
        let report = mapper().map(&[det(56, 0.9, 0.05)]);
        assert!(report.all_objects.is_empty());
        assert_eq!(report.detections.len(), 1);
    }

    #[test]
    fn small_mapped_object_is_searchable_but_not_scored() {
        // cat at 10%: clears the animal floor, under the 20% size floor
        let report = mapper().map(&[det(15, 0.9, 0.10)]);
        assert_eq!(report.dominant, None);
        assert!(report.all_objects.contains("cat"));
        assert!(report.category_scores.is_empty());
    }

    #[test]
    fn person_uses_smaller_size_floor() {
        let report = mapper().map(&[det(0, 0.9, 0.12)]);
        assert_eq!(report.dominant, Some(Category::People));
    }

    #[test]
    fn animals_use_lenient_floor() {
        let report = mapper().map(&[det(16, 0.47, 0.5)]);
        assert_eq!(report.dominant, Some(Category::Animals));
    }

    #[test]
    fn food_needs_high_confidence() {
        let report = mapper().map(&[det(53, 0.75, 0.5)]);
        assert_eq!(report.dominant, None);
        let report = mapper().map(&[det(53, 0.85, 0.5)]);
        assert_eq!(report.dominant, Some(Category::Food));
    }

    #[test]
    fn book_uses_base_threshold() {
        assert_eq!(mapper().map(&[det(73, 0.55, 0.5)]).dominant, None);
        assert_eq!(
            mapper().map(&[det(73, 0.65, 0.5)]).dominant,
            Some(Category::Document)
        );
    }

    #[test]
    fn priority_beats_larger_score() {
        // huge pizza, modest person
        let report = mapper().map(&[det(53, 0.95, 0.9), det(0, 0.6, 0.15)]);
        assert_eq!(report.dominant, Some(Category::People));
        assert!(report.category_scores[&Category::Food] > report.category_scores[&Category::People]);
    }

    #[test]
    fn equal_scores_resolve_by_priority() {
        let report = mapper().map(&[det(53, 0.9, 0.5), det(0, 0.9, 0.5)]);
        assert_eq!(
            report.category_scores[&Category::Food],
            report.category_scores[&Category::People]
        );
        assert_eq!(report.dominant, Some(Category::People));
    }

    #[test]
    fn scores_accumulate_per_category() {
        let report = mapper().map(&[det(15, 0.8, 0.25), det(16, 0.6, 0.5)]);
        let expected = 0.8 * 0.25 + 0.6 * 0.5;
        assert!((report.category_scores[&Category::Animals] - expected).abs() < 1e-5);
        assert_eq!(report.mapped.len(), 2);
    }

    #[test]
    fn dominant_is_single_category() {
        let report = mapper().map(&[
            det(15, 0.9, 0.3),
            det(53, 0.9, 0.3),
            det(73, 0.9, 0.3),
        ]);
        assert_eq!(report.dominant, Some(Category::Animals));
        assert_eq!(report.category_scores.len(), 3);
    }

    #[test]
    fn empty_input_yields_empty_report() {
        let report = mapper().map(&[]);
        assert_eq!(report, MapperReport::default());
    }

    #[test]
    fn explicit_threshold_overrides_base() {
        let report = mapper().map_with_threshold(&[det(73, 0.55, 0.5)], 0.5);
        assert_eq!(report.dominant, Some(Category::Document));
    }
}
