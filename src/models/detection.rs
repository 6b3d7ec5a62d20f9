use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Class labels produced by the detection backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DetectionClass {
    WorkerBee,
    Drone,
    WorkerBeeWithPollen,
    Queen,
    VarroaMite,
    QueenCup,
    CappedBrood,
    Eggs,
    Honey,
    Larvae,
    Nectar,
    Pollen,
    EmptyCell,
}

/// A detection box normalized to the full original image.
///
/// Only constructed through [`Detection::new`], which rounds every field so
/// persisted records stay small and diffable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    #[serde(rename = "n")]
    pub class: DetectionClass,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub c: f64,
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

impl Detection {
    pub fn new(class: DetectionClass, x: f64, y: f64, w: f64, h: f64, c: f64) -> Self {
        Self {
            class,
            x: round_to(x, 5),
            y: round_to(y, 5),
            w: round_to(w, 4),
            h: round_to(h, 4),
            c: round_to(c.clamp(0.0, 1.0), 2),
        }
    }
}

/// Counters derived from one batch of detections.
///
/// Built from the same slice that is appended, so the increment and the
/// collection always describe the same set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectionCounts {
    pub worker_bee_count: i32,
    pub drone_count: i32,
    pub worker_bee_with_pollen_count: i32,
    pub queen_count: i32,
    pub varroa_count: i32,
}

impl DetectionCounts {
    pub fn from_detections(detections: &[Detection]) -> Self {
        let mut counts = Self::default();
        for d in detections {
            match d.class {
                DetectionClass::WorkerBee => counts.worker_bee_count += 1,
                DetectionClass::Drone => counts.drone_count += 1,
                DetectionClass::WorkerBeeWithPollen => counts.worker_bee_with_pollen_count += 1,
                DetectionClass::Queen => counts.queen_count += 1,
                DetectionClass::VarroaMite => counts.varroa_count += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn queen_detected(&self) -> bool {
        self.queen_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_rounding() {
        let d = Detection::new(DetectionClass::Drone, 0.123456789, 0.5, 0.066666, 0.02504, 0.987);
        assert_eq!(d.x, 0.12346);
        assert_eq!(d.y, 0.5);
        assert_eq!(d.w, 0.0667);
        assert_eq!(d.h, 0.025);
        assert_eq!(d.c, 0.99);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let d = Detection::new(DetectionClass::Queen, 0.1, 0.1, 0.1, 0.1, 1.7);
        assert_eq!(d.c, 1.0);
    }

    #[test]
    fn test_counts_follow_classes() {
        let batch = vec![
            Detection::new(DetectionClass::WorkerBee, 0.1, 0.1, 0.01, 0.01, 0.9),
            Detection::new(DetectionClass::WorkerBee, 0.2, 0.1, 0.01, 0.01, 0.9),
            Detection::new(DetectionClass::Drone, 0.3, 0.1, 0.01, 0.01, 0.8),
            Detection::new(DetectionClass::Queen, 0.4, 0.1, 0.01, 0.01, 0.7),
            Detection::new(DetectionClass::Honey, 0.5, 0.1, 0.01, 0.01, 0.7),
        ];
        let counts = DetectionCounts::from_detections(&batch);
        assert_eq!(counts.worker_bee_count, 2);
        assert_eq!(counts.drone_count, 1);
        assert_eq!(counts.varroa_count, 0);
        assert!(counts.queen_detected());
    }

    #[test]
    fn test_serialized_class_key() {
        let d = Detection::new(DetectionClass::VarroaMite, 0.5, 0.5, 0.01, 0.01, 0.5);
        let v = serde_json::to_value(d).unwrap();
        assert_eq!(v["n"], "varroa_mite");
    }
}
