//! 测试用的合成双目序列
use nalgebra::{Isometry3, Point2, Point3, Vector3};

use crate::{
    bundle::WindowContext,
    camera::StereoCamera,
    frontend::{ingest_sequence, FrameMatches, OdometrySeeds, RecordedFrontend},
    global_types::{FrameId, StereoKeypoint},
    track_store::TrackStore,
};

pub(crate) struct SyntheticWorld {
    pub camera: StereoCamera,
    /// 相机到世界，poses[0] 为单位阵
    pub poses: Vec<Isometry3<f64>>,
    pub landmarks: Vec<Point3<f64>>,
}

impl SyntheticWorld {
    /// 向前运动，路标在前方 12 到 24 米
    pub fn new(num_frames: usize) -> Self {
        let mut landmarks = Vec::new();
        for k in 0..3 {
            for i in -3..=3 {
                for j in -2..=2 {
                    landmarks.push(Point3::new(
                        2.0 * i as f64 + 0.1 * j as f64,
                        j as f64,
                        12.0 + 6.0 * k as f64 + 0.3 * i as f64,
                    ));
                }
            }
        }
        Self::with_landmarks(num_frames, landmarks)
    }

    pub fn with_landmarks(num_frames: usize, landmarks: Vec<Point3<f64>>) -> Self {
        let camera = StereoCamera::new(700.0, 700.0, 0.0, 600.0, 180.0, 0.54);
        let poses = (0..num_frames)
            .map(|f| {
                let f = f as f64;
                Isometry3::new(
                    Vector3::new(0.1 * (0.4 * f).sin(), -0.01 * f, 0.3 * f),
                    Vector3::new(0.0, 0.01 * f, 0.003 * f),
                )
            })
            .collect();
        Self {
            camera,
            poses,
            landmarks,
        }
    }

    pub fn context(&self) -> WindowContext {
        WindowContext {
            camera: self.camera,
            pixel_sigma: 1.0,
        }
    }

    pub fn last_frame(&self) -> FrameId {
        (self.poses.len() - 1) as FrameId
    }

    /// b 在 a 坐标系下的真值
    pub fn relative(&self, a: FrameId, b: FrameId) -> Isometry3<f64> {
        self.poses[a as usize].inverse() * self.poses[b as usize]
    }

    pub fn relative_chain(&self, c0: FrameId, ck: FrameId) -> Vec<Isometry3<f64>> {
        (c0..=ck).map(|f| self.relative(c0, f)).collect()
    }

    pub fn keypoint(&self, frame_id: FrameId, landmark: usize) -> StereoKeypoint {
        let obs = self
            .camera
            .project_world(&self.poses[frame_id as usize], &self.landmarks[landmark])
            .unwrap();
        StereoKeypoint::new(
            ((frame_id as u64) << 32) | landmark as u64,
            Point2::new(obs.x_left, obs.y),
            Point2::new(obs.x_right, obs.y),
        )
    }

    pub fn matches(&self, a: FrameId, b: FrameId) -> FrameMatches {
        let ids = 0..self.landmarks.len();
        FrameMatches {
            relative_pose: self.relative(a, b),
            inliers_a: ids.clone().map(|j| self.keypoint(a, j)).collect(),
            inliers_b: ids.map(|j| self.keypoint(b, j)).collect(),
        }
    }

    /// 包含所有帧对，相邻帧对用于建库，其余用于直接初值
    pub fn frontend(&self) -> RecordedFrontend {
        let mut frontend = RecordedFrontend::new(1);
        let last = self.last_frame();
        for a in 0..last {
            for b in a + 1..=last {
                frontend.insert(a, b, self.matches(a, b));
            }
        }
        frontend
    }

    /// 只有相邻帧对，每个相对位姿右乘 drift
    pub fn odometry_frontend(&self, drift: Isometry3<f64>) -> RecordedFrontend {
        let mut frontend = RecordedFrontend::new(1);
        for a in 0..self.last_frame() {
            let mut matches = self.matches(a, a + 1);
            matches.relative_pose *= drift;
            frontend.insert(a, a + 1, matches);
        }
        frontend
    }

    pub fn ingest(&self) -> (TrackStore, OdometrySeeds) {
        self.ingest_from(&self.frontend())
    }

    pub fn ingest_from(&self, frontend: &RecordedFrontend) -> (TrackStore, OdometrySeeds) {
        let mut store = TrackStore::new();
        let (seeds, _) = ingest_sequence(frontend, &mut store, 0, self.last_frame()).unwrap();
        (store, seeds)
    }
}
