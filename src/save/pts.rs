use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{bundle::GlobalLandmark, global_types::TrackId};

/// 路标点文件中的一行
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LandmarkPointSave {
    pub track_id: TrackId,
    pub window: usize,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<&GlobalLandmark> for LandmarkPointSave {
    fn from(landmark: &GlobalLandmark) -> Self {
        Self {
            track_id: landmark.track_id,
            window: landmark.window,
            x: landmark.position.x,
            y: landmark.position.y,
            z: landmark.position.z,
        }
    }
}

pub fn write_landmarks(path: impl AsRef<Path>, landmarks: &[GlobalLandmark]) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;
    for landmark in landmarks {
        writer.serialize(LandmarkPointSave::from(landmark))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_landmarks(path: impl AsRef<Path>) -> anyhow::Result<Vec<LandmarkPointSave>> {
    let path = path.as_ref();
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    let mut points = Vec::new();
    for record in reader.deserialize() {
        points.push(record?);
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    #[test]
    fn test_landmark_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("landmarks.csv");
        let landmarks = vec![
            GlobalLandmark {
                track_id: 7,
                window: 0,
                position: Point3::new(1.0, -2.0, 14.5),
            },
            GlobalLandmark {
                track_id: 7,
                window: 1,
                position: Point3::new(1.01, -2.0, 14.4),
            },
        ];
        write_landmarks(&path, &landmarks).unwrap();
        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("track_id,window,x,y,z"));
        let read = read_landmarks(&path).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[1], LandmarkPointSave::from(&landmarks[1]));
    }
}
