use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

/// Kidney CT-scan classes, in the exact order of the model's output vector.
/// Index i of a probability vector always refers to `ClassLabel::ALL[i]`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum ClassLabel {
    Normal,
    Cyst,
    Stone,
    Tumor,
}

impl ClassLabel {
    pub const ALL: [ClassLabel; 4] = [
        ClassLabel::Normal,
        ClassLabel::Cyst,
        ClassLabel::Stone,
        ClassLabel::Tumor,
    ];
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        match self {
            ClassLabel::Normal => 0,
            ClassLabel::Cyst => 1,
            ClassLabel::Stone => 2,
            ClassLabel::Tumor => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<ClassLabel> {
        Self::ALL.get(index).copied()
    }
}

/// Record returned for a single classified image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub prediction: String,
    pub confidence: f32,
    pub all_probabilities: BTreeMap<String, f32>,
}

/// Service readiness record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub model_loaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_order_is_positional() {
        let names: Vec<String> = ClassLabel::ALL.iter().map(|l| l.to_string()).collect();
        assert_eq!(names, vec!["Normal", "Cyst", "Stone", "Tumor"]);
        for (i, label) in ClassLabel::ALL.iter().enumerate() {
            assert_eq!(label.index(), i);
            assert_eq!(ClassLabel::from_index(i), Some(*label));
        }
        assert_eq!(ClassLabel::from_index(4), None);
    }

    #[test]
    fn prediction_result_serializes_flat() {
        let mut all = BTreeMap::new();
        all.insert("Normal".to_string(), 0.7f32);
        all.insert("Cyst".to_string(), 0.3f32);
        let result = PredictionResult {
            prediction: "Normal".to_string(),
            confidence: 0.7,
            all_probabilities: all,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["prediction"], "Normal");
        let cyst = json["all_probabilities"]["Cyst"].as_f64().unwrap();
        assert!((cyst - 0.3).abs() < 1e-6);
    }
}
