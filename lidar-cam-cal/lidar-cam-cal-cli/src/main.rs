//! Refine a camera-lidar extrinsic calibration from a directory of
//! synchronized frames.
//!
//! Expected layout under the data directory:
//!
//! ```text
//! <dir>/images/*.png|jpg          one image per frame, lexical order
//! <dir>/velodyne/*.bin            KITTI point clouds (f32 x,y,z,reflectance)
//! <dir>/calib_velo_to_cam.txt     optional initial R/T
//! <dir>/correspondences.yaml      optional picked 2D/3D pairs per frame
//! <dir>/edge_scores/*.png         score maps when using the sed method
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use clap::Parser;
use color_eyre::eyre::{self, bail, Context};
use nalgebra::{Matrix3, Point3, Rotation3, Vector3};

use lidar_cam_cal::{
    calibrate, detect_pc_edges, rt_to_tau, CalibConfig, CalibrationInput, Correspondences,
    EdgeMethod, Frame, ImageEdges, Tau,
};

#[derive(Debug, Parser)]
#[command(name = "lidar-cam-cal", version)]
struct Opt {
    /// Directory containing images, point clouds and calibration files.
    dir: PathBuf,

    /// YAML configuration file; defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frame indices to calibrate on, overriding the configuration.
    #[arg(long, value_delimiter = ',')]
    frames: Option<Vec<usize>>,

    /// Initial transform guess, overriding stored calibration and
    /// configuration: rx,ry,rz,tx,ty,tz.
    #[arg(long, value_delimiter = ',', num_args = 6)]
    tau_init: Option<Vec<f64>>,

    /// Kernel width schedule, coarse to fine.
    #[arg(long, value_delimiter = ',')]
    sig_in: Option<Vec<f64>>,

    /// Image edge detection method.
    #[arg(long, value_enum)]
    im_ed_method: Option<CliEdgeMethod>,

    /// Directory for the refined transform and rendered outputs.
    #[arg(long, default_value = "cal-output")]
    out_dir: PathBuf,

    /// Dump a reprojection image every N cost evaluations (0 = never).
    #[arg(long)]
    save_every: Option<usize>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliEdgeMethod {
    Sed,
    Canny,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = Opt::parse();

    let mut cfg = match &opt.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("while reading {}", path.display()))?;
            CalibConfig::from_yaml(&text)?
        }
        None => CalibConfig::default(),
    };
    if let Some(frames) = opt.frames {
        cfg.frames = frames;
    }
    if let Some(tau) = &opt.tau_init {
        cfg.tau_init.copy_from_slice(tau);
    }
    if let Some(sig_in) = opt.sig_in {
        cfg.sig_in = sig_in;
    }
    if let Some(method) = opt.im_ed_method {
        cfg.im_ed_method = match method {
            CliEdgeMethod::Sed => EdgeMethod::Sed,
            CliEdgeMethod::Canny => EdgeMethod::Canny,
        };
    }
    cfg.validate()?;

    let k = cfg.intrinsics()?;
    let tau_init = match load_extrinsics(&opt.dir.join("calib_velo_to_cam.txt"))? {
        Some((r, t)) => {
            tracing::info!("using stored calibration as the initial transform");
            rt_to_tau(&r, &t)
        }
        None => cfg.tau(),
    };

    let frames = load_frames(&opt.dir, &cfg.frames)?;
    tracing::info!("loaded {} frames", frames.len());

    let pc_edge_params = cfg.pc_edge_params();
    let pc_edges: Vec<_> = frames
        .iter()
        .map(|f| detect_pc_edges(&f.points, &pc_edge_params))
        .collect();

    let img_edges = detect_image_edges(&opt.dir, &cfg, &frames, &cfg.frames)?;

    let corrs = load_correspondences(&opt.dir.join("correspondences.yaml"), frames.len())?;

    std::fs::create_dir_all(&opt.out_dir)
        .with_context(|| format!("while creating {}", opt.out_dir.display()))?;

    let input = CalibrationInput {
        frames: &frames,
        pc_edges: &pc_edges,
        img_edges: &img_edges,
        corrs: &corrs,
        k,
    };
    let mut params = cfg.optimize_params();
    params.out_dir = Some(opt.out_dir.clone());
    if let Some(save_every) = opt.save_every {
        params.save_every = save_every;
    }

    let outcome = calibrate(&input, &tau_init, &params)?;
    tracing::info!(
        "refined transform after {} evaluations ({} restarts): loss {:.6}",
        outcome.evaluations,
        outcome.restarts,
        outcome.loss
    );

    write_outputs(&opt.out_dir, &outcome.tau, &outcome.loss_history, &input)?;
    println!(
        "tau = [{}]",
        outcome
            .tau
            .iter()
            .map(|v| format!("{v:.6}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn sorted_files(dir: &Path, exts: &[&str]) -> eyre::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("while listing {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| exts.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn load_frames(dir: &Path, frame_idxs: &[usize]) -> eyre::Result<Vec<Frame>> {
    let images = sorted_files(&dir.join("images"), &["png", "jpg", "jpeg"])?;
    let clouds = sorted_files(&dir.join("velodyne"), &["bin"])?;
    if images.len() != clouds.len() {
        bail!(
            "{} images but {} point clouds in {}",
            images.len(),
            clouds.len(),
            dir.display()
        );
    }
    let mut frames = Vec::with_capacity(frame_idxs.len());
    for &idx in frame_idxs {
        let (Some(img_path), Some(pc_path)) = (images.get(idx), clouds.get(idx)) else {
            bail!("frame index {idx} out of range ({} frames)", images.len());
        };
        let image = image::open(img_path)
            .with_context(|| format!("while reading {}", img_path.display()))?
            .to_rgb8();
        let (points, reflectance) = load_point_cloud(pc_path)?;
        frames.push(Frame::new(image, points, reflectance)?);
    }
    Ok(frames)
}

/// KITTI velodyne format: consecutive little-endian f32 quadruples.
fn load_point_cloud(path: &Path) -> eyre::Result<(Vec<Point3<f64>>, Vec<f64>)> {
    let bytes = std::fs::read(path).with_context(|| format!("while reading {}", path.display()))?;
    if bytes.len() % 16 != 0 {
        bail!(
            "{} has {} bytes, not a multiple of 16",
            path.display(),
            bytes.len()
        );
    }
    let n = bytes.len() / 16;
    let mut rdr = std::io::Cursor::new(bytes);
    let mut points = Vec::with_capacity(n);
    let mut reflectance = Vec::with_capacity(n);
    for _ in 0..n {
        let x = rdr.read_f32::<LittleEndian>()? as f64;
        let y = rdr.read_f32::<LittleEndian>()? as f64;
        let z = rdr.read_f32::<LittleEndian>()? as f64;
        let r = rdr.read_f32::<LittleEndian>()? as f64;
        points.push(Point3::new(x, y, z));
        reflectance.push(r.clamp(0.0, 1.0));
    }
    Ok((points, reflectance))
}

/// KITTI `calib_velo_to_cam.txt`: `R: <9 floats>` and `T: <3 floats>`
/// lines. `Ok(None)` when the file does not exist.
fn load_extrinsics(path: &Path) -> eyre::Result<Option<(Rotation3<f64>, Vector3<f64>)>> {
    let mut text = String::new();
    match std::fs::File::open(path) {
        Ok(mut f) => {
            f.read_to_string(&mut text)
                .with_context(|| format!("while reading {}", path.display()))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("while opening {}", path.display())),
    }

    let mut r = None;
    let mut t = None;
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let vals: Vec<f64> = rest
            .split_whitespace()
            .map(str::parse)
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("while parsing {} line {line:?}", path.display()))?;
        match key.trim() {
            "R" if vals.len() == 9 => {
                let m = Matrix3::from_row_slice(&vals);
                r = Some(Rotation3::from_matrix(&m));
            }
            "T" if vals.len() == 3 => t = Some(Vector3::new(vals[0], vals[1], vals[2])),
            _ => {}
        }
    }
    match (r, t) {
        (Some(r), Some(t)) => Ok(Some((r, t))),
        _ => bail!("{} is missing an R or T line", path.display()),
    }
}

fn detect_image_edges(
    dir: &Path,
    cfg: &CalibConfig,
    frames: &[Frame],
    frame_idxs: &[usize],
) -> eyre::Result<Vec<ImageEdges>> {
    match cfg.im_ed_method {
        EdgeMethod::Canny => {
            let params = cfg.canny_params();
            Ok(frames
                .iter()
                .map(|f| {
                    let gray: Vec<f64> = (0..f.height() as i64)
                        .flat_map(|y| (0..f.width() as i64).map(move |x| (x, y)))
                        .map(|(x, y)| f.gray_at(x, y).unwrap_or(0.0))
                        .collect();
                    ImageEdges::canny(&gray, f.width(), f.height(), &params)
                })
                .collect())
        }
        EdgeMethod::Sed => {
            // precomputed structured-edge score maps, indexed like the frames
            let maps = sorted_files(&dir.join("edge_scores"), &["png"])?;
            let selected: Vec<&PathBuf> = frame_idxs
                .iter()
                .map(|&idx| {
                    maps.get(idx).ok_or_else(|| {
                        eyre::eyre!(
                            "sed method needs a score map per frame in {}/edge_scores",
                            dir.display()
                        )
                    })
                })
                .collect::<eyre::Result<_>>()?;
            frames
                .iter()
                .zip(selected)
                .map(|(f, path)| {
                    let gray = image::open(path)
                        .with_context(|| format!("while reading {}", path.display()))?
                        .to_luma8();
                    if (gray.width() as usize, gray.height() as usize) != (f.width(), f.height()) {
                        bail!("{} does not match the frame dimensions", path.display());
                    }
                    let score: Vec<f64> =
                        gray.pixels().map(|p| p.0[0] as f64 / 255.0).collect();
                    Ok(ImageEdges::from_score_map(
                        score,
                        f.width(),
                        f.height(),
                        cfg.im_sed_score_thr,
                    )?)
                })
                .collect()
        }
    }
}

fn load_correspondences(path: &Path, num_frames: usize) -> eyre::Result<Vec<Correspondences>> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let corrs: Vec<Correspondences> = serde_yaml::from_str(&text)
                .with_context(|| format!("while parsing {}", path.display()))?;
            if corrs.len() != num_frames {
                bail!(
                    "{} has {} entries for {num_frames} frames",
                    path.display(),
                    corrs.len()
                );
            }
            Ok(corrs)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(vec![Correspondences::default(); num_frames])
        }
        Err(e) => Err(e).with_context(|| format!("while reading {}", path.display())),
    }
}

fn write_outputs(
    out_dir: &Path,
    tau: &Tau,
    history: &[f64],
    input: &CalibrationInput<'_>,
) -> eyre::Result<()> {
    let tau_text = tau
        .iter()
        .map(|v| format!("{v:.9}"))
        .collect::<Vec<_>>()
        .join(" ");
    std::fs::write(out_dir.join("tau.txt"), format!("{tau_text}\n"))?;

    let plot = lidar_cam_cal::viz::loss_history_plot(history, 800, 400);
    plot.save(out_dir.join("loss_history.png"))?;

    for (i, frame) in input.frames.iter().enumerate() {
        let tables = lidar_cam_cal::project_frame(
            tau,
            &input.k,
            frame.width(),
            frame.height(),
            &frame.points,
        );
        lidar_cam_cal::viz::draw_reprojection(frame, &tables)
            .save(out_dir.join(format!("reproj-final-{i}.png")))?;
        lidar_cam_cal::viz::edge_overlay(frame, &tables, &input.pc_edges[i], &input.img_edges[i])
            .save(out_dir.join(format!("edges-final-{i}.png")))?;
        lidar_cam_cal::viz::depth_image(frame.width(), frame.height(), &tables)
            .save(out_dir.join(format!("depth-final-{i}.png")))?;
    }
    Ok(())
}
