use std::path::Path;

use anyhow::Context;
use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion};

/// KITTI 格式的一行：[R | t] 按行展开
type KittiRow = [f64; 12];

fn to_row(pose: &Isometry3<f64>) -> KittiRow {
    let r = pose.rotation.to_rotation_matrix().into_inner();
    let t = pose.translation.vector;
    [
        r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x,
        r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y,
        r[(2, 0)], r[(2, 1)], r[(2, 2)], t.z,
    ]
}

fn from_row(row: &KittiRow) -> Isometry3<f64> {
    let m = Matrix3::new(
        row[0], row[1], row[2], row[4], row[5], row[6], row[8], row[9], row[10],
    );
    Isometry3::from_parts(
        Translation3::new(row[3], row[7], row[11]),
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&m)),
    )
}

/// 每行一个位姿，空格分隔
pub fn write_kitti(path: impl AsRef<Path>, poses: &[Isometry3<f64>]) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("create {}", path.display()))?;
    for pose in poses {
        writer.serialize(to_row(pose))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_kitti(path: impl AsRef<Path>) -> anyhow::Result<Vec<Isometry3<f64>>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut poses = Vec::new();
    for row in reader.deserialize() {
        let row: KittiRow = row?;
        poses.push(from_row(&row));
    }
    Ok(poses)
}
