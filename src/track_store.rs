//! 特征轨迹数据库
//!
//! 每条轨迹记录一个特征点在连续帧中的双目观测。观测只追加不修改，
//! 所有观测存放在同一个 arena 中，轨迹通过有序的帧列表索引。

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::global_types::{FeatureId, FrameId, Observation, StereoKeypoint, TrackId};

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("track {track_id} has no observation at frame {frame_id}")]
    CorrespondenceGap { track_id: TrackId, frame_id: FrameId },
    #[error("frame {frame_id} arrived after frame {last_frame}")]
    OutOfOrderFrame { frame_id: FrameId, last_frame: FrameId },
    #[error("frame {0} has no previous frame to match against")]
    InvalidFrame(FrameId),
    #[error("inlier lists differ in length: {curr} vs {next}")]
    UnpairedInliers { curr: usize, next: usize },
    #[error("corrupt track store: {0}")]
    Corrupt(String),
    #[error("track store persistence failed")]
    Persistence(#[from] bincode::Error),
    #[error("track store io failed")]
    Io(#[from] std::io::Error),
}

/// 一条特征轨迹
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    track_id: TrackId,
    /// 严格递增
    frame_ids: Vec<FrameId>,
    /// 与 frame_ids 一一对应的 arena 下标
    records: Vec<usize>,
}

impl Track {
    pub fn id(&self) -> TrackId {
        self.track_id
    }

    pub fn frame_ids(&self) -> &[FrameId] {
        &self.frame_ids
    }

    pub fn len(&self) -> usize {
        self.frame_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_ids.is_empty()
    }

    pub fn start_frame(&self) -> Option<FrameId> {
        self.frame_ids.first().copied()
    }

    pub fn end_frame(&self) -> Option<FrameId> {
        self.frame_ids.last().copied()
    }

    /// [c0, ck] 内的帧
    pub fn frames_within(&self, c0: FrameId, ck: FrameId) -> &[FrameId] {
        let begin = self.frame_ids.partition_point(|&f| f < c0);
        let end = self.frame_ids.partition_point(|&f| f <= ck);
        &self.frame_ids[begin..end.max(begin)]
    }

    fn record(&self, frame_id: FrameId) -> Option<usize> {
        self.frame_ids
            .binary_search(&frame_id)
            .ok()
            .map(|index| self.records[index])
    }
}

/// 轨迹统计
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackStatistics {
    pub num_tracks: usize,
    pub num_frames: usize,
    pub mean_track_length: f64,
    pub max_track_length: usize,
    pub min_track_length: usize,
    /// 每帧平均轨迹数
    pub mean_frame_links: f64,
}

/// 一次 extend 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendStats {
    /// 延长的轨迹数
    pub extended: usize,
    /// 新建的轨迹数
    pub created: usize,
    /// 因特征 id 重复而跳过的匹配
    pub skipped: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrackStore {
    /// 下标即轨迹 id，按创建顺序
    tracks: Vec<Track>,
    observations: Vec<Observation>,
    /// 帧 -> 升序的轨迹 id
    frames: BTreeMap<FrameId, Vec<TrackId>>,
    /// 最新帧上的特征 id -> 轨迹 id
    active: HashMap<FeatureId, TrackId>,
    last_frame: Option<FrameId>,
}

impl TrackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用 frame_id-1 (curr) 与 frame_id (next) 之间的内点延长轨迹
    ///
    /// 未被已有轨迹吸收的匹配新建一条轨迹，同时记录两帧的观测。
    pub fn extend(
        &mut self,
        frame_id: FrameId,
        curr_inliers: &[StereoKeypoint],
        next_inliers: &[StereoKeypoint],
    ) -> Result<ExtendStats, TrackError> {
        if curr_inliers.len() != next_inliers.len() {
            return Err(TrackError::UnpairedInliers {
                curr: curr_inliers.len(),
                next: next_inliers.len(),
            });
        }
        if frame_id == 0 {
            return Err(TrackError::InvalidFrame(frame_id));
        }
        if let Some(last_frame) = self.last_frame {
            if frame_id <= last_frame {
                return Err(TrackError::OutOfOrderFrame {
                    frame_id,
                    last_frame,
                });
            }
        }

        let prev_frame = frame_id - 1;
        let mut active = std::mem::take(&mut self.active);
        if self.last_frame != Some(prev_frame) && !active.is_empty() {
            log::debug!(
                "frame {} was not ingested, {} tracks end",
                prev_frame,
                active.len()
            );
            active.clear();
        }
        if self.last_frame != Some(prev_frame) {
            // 新段的第一帧，即使没有匹配也登记
            self.frames.entry(prev_frame).or_default();
        }

        let mut stats = ExtendStats::default();
        let mut next_active = HashMap::with_capacity(next_inliers.len());
        for (curr, next) in curr_inliers.iter().zip(next_inliers) {
            if next_active.contains_key(&next.feature_id) {
                log::warn!(
                    "duplicate feature {} at frame {}, skipped",
                    next.feature_id,
                    frame_id
                );
                stats.skipped += 1;
                continue;
            }
            let track_id = match active.remove(&curr.feature_id) {
                Some(track_id) => {
                    self.push_observation(track_id, frame_id, next.observation());
                    stats.extended += 1;
                    track_id
                }
                None => {
                    let track_id = self.new_track(prev_frame, curr.observation());
                    self.push_observation(track_id, frame_id, next.observation());
                    stats.created += 1;
                    track_id
                }
            };
            next_active.insert(next.feature_id, track_id);
        }

        self.active = next_active;
        self.last_frame = Some(frame_id);
        // 没有任何匹配的帧也登记
        self.frames.entry(frame_id).or_default();
        Ok(stats)
    }

    fn new_track(&mut self, frame_id: FrameId, observation: Observation) -> TrackId {
        let track_id = self.tracks.len() as TrackId;
        self.tracks.push(Track {
            track_id,
            frame_ids: Vec::new(),
            records: Vec::new(),
        });
        self.push_observation(track_id, frame_id, observation);
        track_id
    }

    fn push_observation(&mut self, track_id: TrackId, frame_id: FrameId, observation: Observation) {
        let record = self.observations.len();
        self.observations.push(observation);
        let track = &mut self.tracks[track_id as usize];
        track.frame_ids.push(frame_id);
        track.records.push(record);
        // 延长的轨迹 id 可能小于已登记的 id
        let ids = self.frames.entry(frame_id).or_default();
        if let Err(index) = ids.binary_search(&track_id) {
            ids.insert(index, track_id);
        }
    }

    /// 在该帧有观测的轨迹，升序
    pub fn tracks_at_frame(&self, frame_id: FrameId) -> &[TrackId] {
        self.frames
            .get(&frame_id)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    pub fn observation(&self, track_id: TrackId, frame_id: FrameId) -> Option<Observation> {
        let track = self.tracks.get(track_id as usize)?;
        track
            .record(frame_id)
            .and_then(|record| self.observations.get(record))
            .copied()
    }

    /// 轨迹在该帧必须有观测
    pub fn require_observation(
        &self,
        track_id: TrackId,
        frame_id: FrameId,
    ) -> Result<Observation, TrackError> {
        self.observation(track_id, frame_id)
            .ok_or(TrackError::CorrespondenceGap { track_id, frame_id })
    }

    pub fn track(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.get(track_id as usize)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn first_frame(&self) -> Option<FrameId> {
        self.frames.keys().next().copied()
    }

    pub fn last_frame(&self) -> Option<FrameId> {
        self.last_frame
    }

    /// 从 frame_id 延续到下一帧的轨迹数
    pub fn outgoing_tracks(&self, frame_id: FrameId) -> usize {
        let next = self.tracks_at_frame(frame_id + 1);
        self.tracks_at_frame(frame_id)
            .iter()
            .filter(|id| next.binary_search(id).is_ok())
            .count()
    }

    /// 两帧共同的轨迹及其观测
    pub fn correspondences(
        &self,
        frame_a: FrameId,
        frame_b: FrameId,
    ) -> Vec<(TrackId, Observation, Observation)> {
        let tracks_b = self.tracks_at_frame(frame_b);
        self.tracks_at_frame(frame_a)
            .iter()
            .filter(|id| tracks_b.binary_search(id).is_ok())
            .filter_map(|&id| {
                let a = self.observation(id, frame_a)?;
                let b = self.observation(id, frame_b)?;
                Some((id, a, b))
            })
            .collect()
    }

    /// 两帧共同轨迹在左图上的平均视差
    pub fn mean_parallax(&self, frame_a: FrameId, frame_b: FrameId) -> Option<f64> {
        let pairs = self.correspondences(frame_a, frame_b);
        if pairs.is_empty() {
            return None;
        }
        let sum: f64 = pairs
            .iter()
            .map(|(_, a, b)| {
                let du = a.x_left - b.x_left;
                let dv = a.y - b.y;
                (du * du + dv * dv).sqrt()
            })
            .sum();
        Some(sum / pairs.len() as f64)
    }

    pub fn statistics(&self) -> TrackStatistics {
        if self.tracks.is_empty() {
            return TrackStatistics::default();
        }
        let lengths = self.tracks.iter().map(|t| t.len());
        let total: usize = lengths.clone().sum();
        let links: usize = self.frames.values().map(|ids| ids.len()).sum();
        TrackStatistics {
            num_tracks: self.tracks.len(),
            num_frames: self.frames.len(),
            mean_track_length: total as f64 / self.tracks.len() as f64,
            max_track_length: lengths.clone().max().unwrap_or(0),
            min_track_length: lengths.min().unwrap_or(0),
            mean_frame_links: links as f64 / self.frames.len().max(1) as f64,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, TrackError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, TrackError> {
        let store: Self = bincode::deserialize(bytes)?;
        store.validate()?;
        Ok(store)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TrackError> {
        std::fs::write(path, self.serialize()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrackError> {
        Self::deserialize(&std::fs::read(path)?)
    }

    /// 检查反序列化后的数据是否满足所有约束
    fn validate(&self) -> Result<(), TrackError> {
        for (index, track) in self.tracks.iter().enumerate() {
            if track.track_id as usize != index {
                return Err(TrackError::Corrupt(format!(
                    "track at {} has id {}",
                    index, track.track_id
                )));
            }
            if track.is_empty() || track.frame_ids.len() != track.records.len() {
                return Err(TrackError::Corrupt(format!(
                    "track {} has mismatched records",
                    track.track_id
                )));
            }
            if track.frame_ids.windows(2).any(|w| w[0] >= w[1]) {
                return Err(TrackError::Corrupt(format!(
                    "track {} frames are not increasing",
                    track.track_id
                )));
            }
            for (&frame_id, &record) in track.frame_ids.iter().zip(&track.records) {
                let indexed = self
                    .frames
                    .get(&frame_id)
                    .map_or(false, |ids| ids.binary_search(&track.track_id).is_ok());
                if record >= self.observations.len() || !indexed {
                    return Err(TrackError::CorrespondenceGap {
                        track_id: track.track_id,
                        frame_id,
                    });
                }
            }
        }
        for (&frame_id, ids) in &self.frames {
            if ids.windows(2).any(|w| w[0] >= w[1]) {
                return Err(TrackError::Corrupt(format!(
                    "tracks at frame {} are not sorted",
                    frame_id
                )));
            }
            for &track_id in ids {
                if self.observation(track_id, frame_id).is_none() {
                    return Err(TrackError::CorrespondenceGap { track_id, frame_id });
                }
            }
        }
        Ok(())
    }
}
