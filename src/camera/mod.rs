mod stereo_camera;
pub use stereo_camera::{StereoCamera, StereoParameters};

use nalgebra::{Matrix3, Vector3};

use crate::global_types::Observation;

/// 相机的trait
///
/// 所有坐标都在相机坐标系下：x 向右，y 向下，z 向前。
pub trait CameraTrait {
    /// 投影到图像，点在相机后方时返回 None
    fn project(&self, p_cam: &Vector3<f64>) -> Option<Observation>;
    /// 反投影，视差不为正时返回 None
    fn back_project(&self, observation: &Observation) -> Option<Vector3<f64>>;
    /// 观测对相机坐标系下点的雅可比
    fn project_jacobian(&self, p_cam: &Vector3<f64>) -> Matrix3<f64>;
}

/// 相机参数的trait
pub trait CameraParametersTrait: Sized {
    const CAMERA_TYPE: &'static str;
    fn read_from_json(path: &str) -> anyhow::Result<Self>;
    fn write_to_json(&self, path: &str) -> anyhow::Result<()>;
}
