use anyhow::Context;
use nalgebra::{Isometry3, Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use super::{CameraParametersTrait, CameraTrait};
use crate::global_types::Observation;

/// 深度小于该值视为在相机后方
const MIN_DEPTH: f64 = 1e-6;

/// 校正后双目相机的参数文件
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StereoParameters {
    pub model_type: String,
    pub camera_name: String,
    // size
    pub image_width: i32,
    pub image_height: i32,
    // intrinsic
    pub fx: f64,
    pub fy: f64,
    pub skew: f64,
    pub cx: f64,
    pub cy: f64,
    /// 基线长度 (m)，右相机位于 +x
    pub baseline: f64,
}

impl CameraParametersTrait for StereoParameters {
    const CAMERA_TYPE: &'static str = "PINHOLE_STEREO";

    fn read_from_json(path: &str) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path).with_context(|| format!("open {}", path))?;
        let parameters: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("parse calibration {}", path))?;
        anyhow::ensure!(
            parameters.model_type == Self::CAMERA_TYPE,
            "model type is {}, expected {}",
            parameters.model_type,
            Self::CAMERA_TYPE
        );
        anyhow::ensure!(
            parameters.fx > 0.0 && parameters.fy > 0.0 && parameters.baseline > 0.0,
            "focal lengths and baseline must be positive"
        );
        Ok(parameters)
    }

    fn write_to_json(&self, path: &str) -> anyhow::Result<()> {
        let mut parameters = self.clone();
        parameters.model_type = Self::CAMERA_TYPE.to_string();
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &parameters)?;
        Ok(())
    }
}

/// 校正双目相机模型
///
/// - uL = (fx * x + s * y) / z + cx
/// - uR = (fx * (x - b) + s * y) / z + cx
/// - v  = fy * y / z + cy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoCamera {
    pub fx: f64,
    pub fy: f64,
    pub skew: f64,
    pub cx: f64,
    pub cy: f64,
    pub baseline: f64,
}

impl StereoCamera {
    pub fn new(fx: f64, fy: f64, skew: f64, cx: f64, cy: f64, baseline: f64) -> Self {
        Self {
            fx,
            fy,
            skew,
            cx,
            cy,
            baseline,
        }
    }

    pub fn read_from_json(path: &str) -> anyhow::Result<Self> {
        Ok(Self::from(&StereoParameters::read_from_json(path)?))
    }

    /// 世界点投影到位姿为 pose (相机到世界) 的双目相机
    pub fn project_world(&self, pose: &Isometry3<f64>, point: &Point3<f64>) -> Option<Observation> {
        let p_cam = pose.inverse_transform_point(point);
        self.project(&p_cam.coords)
    }

    /// 观测反投影到世界坐标系
    pub fn back_project_world(
        &self,
        pose: &Isometry3<f64>,
        observation: &Observation,
    ) -> Option<Point3<f64>> {
        self.back_project(observation)
            .map(|p_cam| pose.transform_point(&Point3::from(p_cam)))
    }
}

impl From<&StereoParameters> for StereoCamera {
    fn from(parameters: &StereoParameters) -> Self {
        Self::new(
            parameters.fx,
            parameters.fy,
            parameters.skew,
            parameters.cx,
            parameters.cy,
            parameters.baseline,
        )
    }
}

impl CameraTrait for StereoCamera {
    fn project(&self, p_cam: &Vector3<f64>) -> Option<Observation> {
        let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
        if z < MIN_DEPTH {
            return None;
        }
        let x_left = (self.fx * x + self.skew * y) / z + self.cx;
        let x_right = (self.fx * (x - self.baseline) + self.skew * y) / z + self.cx;
        let v = self.fy * y / z + self.cy;
        Some(Observation::new(x_left, x_right, v))
    }

    fn back_project(&self, observation: &Observation) -> Option<Vector3<f64>> {
        let disparity = observation.disparity();
        if disparity <= 0.0 {
            return None;
        }
        let z = self.fx * self.baseline / disparity;
        let y = (observation.y - self.cy) * z / self.fy;
        let x = ((observation.x_left - self.cx) * z - self.skew * y) / self.fx;
        Some(Vector3::new(x, y, z))
    }

    fn project_jacobian(&self, p_cam: &Vector3<f64>) -> Matrix3<f64> {
        let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
        let inv_z = 1.0 / z;
        let inv_z2 = inv_z * inv_z;
        Matrix3::new(
            self.fx * inv_z,
            self.skew * inv_z,
            -(self.fx * x + self.skew * y) * inv_z2,
            self.fx * inv_z,
            self.skew * inv_z,
            -(self.fx * (x - self.baseline) + self.skew * y) * inv_z2,
            0.0,
            self.fy * inv_z,
            -self.fy * y * inv_z2,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn kitti_like() -> StereoCamera {
        StereoCamera::new(718.856, 718.856, 0.0, 607.1928, 185.2157, 0.5371)
    }

    #[test]
    fn test_project_back_project() {
        let camera = StereoCamera::new(700.0, 690.0, 0.3, 600.0, 180.0, 0.54);
        let p = Vector3::new(1.2, -0.4, 9.0);
        let obs = camera.project(&p).unwrap();
        assert!(obs.disparity() > 0.0);
        let back = camera.back_project(&obs).unwrap();
        assert_relative_eq!(p, back, epsilon = 1e-10);
    }

    #[test]
    fn test_behind_camera() {
        let camera = kitti_like();
        assert!(camera.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        assert!(camera
            .back_project(&Observation::new(100.0, 100.0, 50.0))
            .is_none());
    }

    #[test]
    fn test_world_projection() {
        let camera = kitti_like();
        let pose = Isometry3::new(Vector3::new(0.5, 0.0, 2.0), Vector3::new(0.0, 0.1, 0.0));
        let point = Point3::new(1.0, 0.5, 15.0);
        let obs = camera.project_world(&pose, &point).unwrap();
        let back = camera.back_project_world(&pose, &obs).unwrap();
        assert_relative_eq!(point, back, epsilon = 1e-9);
    }

    #[test]
    fn test_jacobian_numeric() {
        let camera = StereoCamera::new(700.0, 690.0, 0.3, 600.0, 180.0, 0.54);
        let p = Vector3::new(0.7, 0.2, 6.0);
        let analytic = camera.project_jacobian(&p);
        let h = 1e-6;
        for k in 0..3 {
            let mut plus = p;
            let mut minus = p;
            plus[k] += h;
            minus[k] -= h;
            let d = (camera.project(&plus).unwrap().as_vector()
                - camera.project(&minus).unwrap().as_vector())
                / (2.0 * h);
            assert_relative_eq!(analytic.column(k).into_owned(), d, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_parameters_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.json");
        let path = path.to_str().unwrap();
        let parameters = StereoParameters {
            camera_name: "kitti_00".to_string(),
            image_width: 1241,
            image_height: 376,
            fx: 718.856,
            fy: 718.856,
            cx: 607.1928,
            cy: 185.2157,
            baseline: 0.5371,
            ..Default::default()
        };
        parameters.write_to_json(path).unwrap();
        let read = StereoParameters::read_from_json(path).unwrap();
        assert_eq!(read.model_type, StereoParameters::CAMERA_TYPE);
        assert_eq!(read.camera_name, "kitti_00");
        assert_relative_eq!(read.baseline, 0.5371, epsilon = 1e-12);
        let camera = StereoCamera::read_from_json(path).unwrap();
        assert_relative_eq!(camera.fx, 718.856, epsilon = 1e-12);
    }

    #[test]
    fn test_reject_wrong_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.json");
        std::fs::write(
            &path,
            r#"{"model_type":"PINHOLE","camera_name":"c","image_width":1,"image_height":1,
                "fx":1.0,"fy":1.0,"skew":0.0,"cx":0.0,"cy":0.0,"baseline":1.0}"#,
        )
        .unwrap();
        assert!(StereoParameters::read_from_json(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_shipped_calibration() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/stereo_camera.json");
        let camera = StereoCamera::read_from_json(path).unwrap();
        assert!(camera.baseline > 0.5 && camera.baseline < 0.6);
    }
}
