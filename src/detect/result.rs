use serde::Serialize;

/// Label carried by motion hits.
pub const MOTION_LABEL: &str = "motion";

/// Upper bound on detections kept from one frame.
pub const MAX_DETECTIONS: usize = 20;

/// One labelled box. Coordinates are normalized to 0..1 of the frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Detection {
    pub fn new(label: &str, confidence: f32) -> Self {
        Self {
            label: label.to_string(),
            confidence,
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }

    /// Box from corner coordinates, clamped into the frame.
    pub fn with_corners(mut self, x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        let clamp = |v: f32| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        let (x0, y0, x1, y1) = (clamp(x_min), clamp(y_min), clamp(x_max), clamp(y_max));
        self.x = x0.min(x1);
        self.y = y0.min(y1);
        self.width = (x1 - x0).abs();
        self.height = (y1 - y0).abs();
        self
    }
}

/// Result of running detection on a frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Single full-frame `motion` detection scored by the motion detector.
    pub fn motion(score: f32) -> Self {
        Self {
            detections: vec![Detection::new(MOTION_LABEL, score)],
        }
    }

    pub fn push(&mut self, detection: Detection) {
        if self.detections.len() < MAX_DETECTIONS {
            self.detections.push(detection);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    /// Drops detections under `threshold`.
    pub fn retain_above(&mut self, threshold: f32) {
        self.detections.retain(|d| d.confidence >= threshold);
    }

    /// Highest-confidence detection.
    pub fn best(&self) -> Option<&Detection> {
        self.detections
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    /// Comma-separated distinct labels, in first-seen order.
    pub fn labels(&self) -> String {
        let mut labels: Vec<&str> = Vec::new();
        for d in &self.detections {
            if !labels.contains(&d.label.as_str()) {
                labels.push(&d.label);
            }
        }
        labels.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_and_labels() {
        let mut result = DetectionResult::empty();
        result.push(Detection::new("person", 0.8));
        result.push(Detection::new("car", 0.2));
        result.push(Detection::new("person", 0.45));
        result.retain_above(0.3);
        assert_eq!(result.len(), 2);
        assert_eq!(result.labels(), "person");
        assert_eq!(result.best().map(|d| d.confidence), Some(0.8));
    }

    #[test]
    fn corners_are_clamped_and_ordered() {
        let d = Detection::new("car", 0.9).with_corners(0.8, 1.4, 0.2, 0.5);
        assert!((d.x - 0.2).abs() < 1e-6);
        assert!((d.y - 0.5).abs() < 1e-6);
        assert!((d.width - 0.6).abs() < 1e-6);
        assert!((d.height - 0.5).abs() < 1e-6);
    }

    #[test]
    fn push_caps_detection_count() {
        let mut result = DetectionResult::empty();
        for _ in 0..MAX_DETECTIONS + 5 {
            result.push(Detection::new("x", 0.5));
        }
        assert_eq!(result.len(), MAX_DETECTIONS);
    }
}
