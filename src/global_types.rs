use nalgebra::{Point2, Vector3};
use serde::{Deserialize, Serialize};

/// 帧序号，从 0 开始连续递增
pub type FrameId = u32;
/// 轨迹 id，等于轨迹的创建顺序
pub type TrackId = u32;
/// 前端给出的持久特征点 id
pub type FeatureId = u64;

/// 校正后双目观测 (xL, xR, y)
///
/// 左右图像共用同一行坐标 y。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Observation {
    pub x_left: f64,
    pub x_right: f64,
    pub y: f64,
}

impl Observation {
    pub fn new(x_left: f64, x_right: f64, y: f64) -> Self {
        Self {
            x_left,
            x_right,
            y,
        }
    }

    /// 视差 xL - xR
    #[inline]
    pub fn disparity(&self) -> f64 {
        self.x_left - self.x_right
    }

    #[inline]
    pub fn as_vector(&self) -> Vector3<f64> {
        Vector3::new(self.x_left, self.x_right, self.y)
    }
}

/// 前端 RANSAC 之后的内点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoKeypoint {
    pub feature_id: FeatureId,
    pub left: Point2<f64>,
    pub right: Point2<f64>,
}

impl StereoKeypoint {
    pub fn new(feature_id: FeatureId, left: Point2<f64>, right: Point2<f64>) -> Self {
        Self {
            feature_id,
            left,
            right,
        }
    }

    /// 校正图像中左右行坐标相同，取左图的行
    pub fn observation(&self) -> Observation {
        Observation::new(self.left.x, self.right.x, self.left.y)
    }
}

impl From<&StereoKeypoint> for Observation {
    fn from(keypoint: &StereoKeypoint) -> Self {
        keypoint.observation()
    }
}

#[test]
fn test_keypoint_observation() {
    let kp = StereoKeypoint::new(7, Point2::new(320.0, 100.0), Point2::new(300.0, 100.4));
    let obs = Observation::from(&kp);
    assert_eq!(obs.y, 100.0);
    assert_eq!(obs.disparity(), 20.0);
}
