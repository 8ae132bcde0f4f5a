use std::path::PathBuf;

use anyhow::Context;
use structopt::StructOpt;

use stereo_vo::{
    bundle::{BundleAdjustment, WindowContext},
    camera::StereoCamera,
    config::PipelineConfig,
    evaluation::TrajectoryError,
    frontend::{ingest_sequence, RecordedFrontend},
    optimizer::LevenbergMarquardt,
    pose_graph::PoseGraphBuilder,
    save::{read_kitti, write_kitti, write_landmarks, GroundTruthSummary, RunSummary},
    track_store::TrackStore,
};

#[derive(StructOpt)]
#[structopt(
    name = "stereo-vo",
    about = "Windowed stereo bundle adjustment over recorded frontend output.",
    rename_all = "kebab-case"
)]
struct Opt {
    /// Stereo calibration file (json)
    #[structopt(short, long, parse(from_os_str))]
    camera: PathBuf,
    /// Pipeline configuration file (json), defaults are used when absent
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// Directory with poses.csv and inliers.csv
    #[structopt(parse(from_os_str))]
    input: PathBuf,
    /// Output directory
    #[structopt(short, long, parse(from_os_str), default_value = "output")]
    output: PathBuf,
    /// Last frame to process, defaults to the last recorded frame
    #[structopt(long)]
    last_frame: Option<u32>,
    /// Skip the pose graph pass
    #[structopt(long)]
    no_pose_graph: bool,
    /// KITTI ground truth poses, one line per frame
    #[structopt(long, parse(from_os_str))]
    ground_truth: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_nanos()
        .init();

    let opt = Opt::from_args();
    let config = match &opt.config {
        Some(path) => PipelineConfig::read_from_json(path)?,
        None => PipelineConfig::default(),
    };
    config.validate()?;
    log::info!("config: {:?}", config);

    let camera_file = opt.camera.to_string_lossy();
    let camera = StereoCamera::read_from_json(&camera_file)?;
    log::info!("camera: {:?}", camera);

    let frontend = RecordedFrontend::read_from_dir(&opt.input, config.min_inliers)?;
    let last_frame = match opt.last_frame {
        Some(last_frame) => last_frame,
        None => frontend
            .last_frame()
            .context("recorded frontend has no frame pairs")?,
    };

    // 建立轨迹库
    let mut store = TrackStore::new();
    let (seeds, ingest) = ingest_sequence(&frontend, &mut store, 0, last_frame)?;
    let statistics = store.statistics();
    log::info!("ingest: {:?}", ingest);
    log::info!("tracks: {:?}", statistics);

    std::fs::create_dir_all(&opt.output)
        .with_context(|| format!("create {}", opt.output.display()))?;
    store.save(opt.output.join("tracks.bin"))?;

    // 窗口优化
    let context = WindowContext {
        camera,
        pixel_sigma: config.pixel_sigma,
    };
    let optimizer = LevenbergMarquardt::new(config.solver);
    let fallback_covariance = config.fallback.matrix();
    let mut bundle = BundleAdjustment::new(&store, &seeds, context, optimizer)
        .with_frontend(&frontend)
        .with_fallback_covariance(fallback_covariance)
        .with_multiple_thread(config.multiple_thread);
    bundle.choose_keyframes(&config.keyframes.policy, config.keyframes.bounds())?;
    let result = bundle.solve_sequential()?;

    write_kitti(opt.output.join("keyframes_sequential.txt"), &result.trajectory)?;
    write_landmarks(opt.output.join("landmarks.csv"), &result.landmarks)?;

    // 位姿图
    let pose_graph = if opt.no_pose_graph {
        None
    } else {
        let builder = PoseGraphBuilder::new(&result.keyframes, &result.edges, &fallback_covariance)?;
        let refined = builder.optimize(&LevenbergMarquardt::new(config.solver));
        write_kitti(opt.output.join("keyframes_pose_graph.txt"), &refined.poses)?;
        Some(refined)
    };

    let mut summary = RunSummary::new(
        ingest,
        statistics,
        seeds.missing_frames(),
        &result,
        pose_graph.as_ref(),
    );
    if let Some(path) = &opt.ground_truth {
        let ground_truth = read_kitti(path)?;
        let sequential =
            TrajectoryError::evaluate(&result.keyframes, &result.trajectory, &ground_truth)?;
        log::info!(
            "sequential keyframe error: mean {:.3} m, max {:.3} m",
            sequential.mean_translation,
            sequential.max_translation
        );
        let pose_graph = match &pose_graph {
            Some(refined) => {
                let errors =
                    TrajectoryError::evaluate(&refined.keyframes, &refined.poses, &ground_truth)?;
                log::info!(
                    "pose graph keyframe error: mean {:.3} m, max {:.3} m",
                    errors.mean_translation,
                    errors.max_translation
                );
                Some(errors)
            }
            None => None,
        };
        summary = summary.with_ground_truth(GroundTruthSummary {
            sequential,
            pose_graph,
        });
    }
    summary.write_to_json(opt.output.join("summary.json"))?;
    log::info!(
        "done: {} keyframes, {} landmarks, {} degraded edges, results in {}",
        result.keyframes.len(),
        result.landmarks.len(),
        summary.degraded_edges.len(),
        opt.output.display()
    );
    Ok(())
}
