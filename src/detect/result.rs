use serde::{Deserialize, Serialize};

use crate::frame::BoundingBox;

/// Identifies one detection: the frame it came from and its position in that frame's list.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct DetectionId {
    pub frame_id: u64,
    pub index: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub frame_id: u64,
    pub index: u32,
    pub bbox: BoundingBox,
    pub class: ObjectClass,
    pub confidence: f32,
}

impl Detection {
    pub fn id(&self) -> DetectionId {
        DetectionId {
            frame_id: self.frame_id,
            index: self.index,
        }
    }

    pub fn is_person(&self) -> bool {
        self.class == ObjectClass::Person
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Person,
    Vehicle,
    Animal,
    Package,
    Unknown,
}

impl ObjectClass {
    pub fn label(self) -> &'static str {
        match self {
            ObjectClass::Person => "person",
            ObjectClass::Vehicle => "vehicle",
            ObjectClass::Animal => "animal",
            ObjectClass::Package => "package",
            ObjectClass::Unknown => "unknown",
        }
    }
}

/// Face feature vector for one detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub detection_id: DetectionId,
    pub vector: Vec<f32>,
}

impl FaceEmbedding {
    pub fn new(detection_id: DetectionId, vector: Vec<f32>) -> Self {
        Self {
            detection_id,
            vector,
        }
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}
