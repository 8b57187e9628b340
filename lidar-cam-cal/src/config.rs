//! Calibration configuration.
//!
//! Deserializable from YAML; defaults match the KITTI-style setup the
//! tool was developed against. Validation happens once, before any
//! optimization starts.

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::image_edge::{CannyParams, EdgeMethod};
use crate::optimize::{OptimizeParams, Weights};
use crate::pc_edge::{EdgeThreshold, PcEdgeParams};
use crate::project::{FrustumFloor, Intrinsics};
use crate::transform::Tau;
use crate::{CalibError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibConfig {
    /// 3x3 camera matrix, row-major.
    pub k: [[f64; 3]; 3],
    /// Initial transform guess, used when no stored calibration exists.
    pub tau_init: [f64; 6],
    /// Indices of the frames to calibrate on.
    pub frames: Vec<usize>,
    /// Kernel width schedule for the refinement stages, coarse to fine.
    pub sig_in: Vec<f64>,
    pub scale_sigma_by_depth: bool,

    // point cloud edge detection
    pub pc_ed_num_nn: usize,
    pub pc_ed_rad_nn: f64,
    pub pc_ed_score_thr: EdgeThreshold,

    // image edge detection
    pub im_ed_method: EdgeMethod,
    pub im_sed_score_thr: f64,
    pub im_ced_lower: f64,
    pub im_ced_upper: f64,

    // cost weights
    pub alpha_mi: f64,
    pub alpha_gmm: f64,
    pub alpha_corr: f64,
    pub alpha_chamfer: f64,

    // optimizer shell
    pub max_iters: u64,
    pub restart_budget: usize,
    pub save_every: usize,
    pub translation_only_pass: bool,
    pub frustum_min_frac: f64,
    pub frustum_min_total: usize,
}

impl Default for CalibConfig {
    fn default() -> Self {
        Self {
            k: [
                [7.215377e2, 0.0, 6.095593e2],
                [0.0, 7.215377e2, 1.728540e2],
                [0.0, 0.0, 1.0],
            ],
            tau_init: [0.0; 6],
            frames: vec![1, 6, 19],
            sig_in: vec![3.0, 2.0, 1.0],
            scale_sigma_by_depth: true,
            pc_ed_num_nn: 75,
            pc_ed_rad_nn: 0.1,
            pc_ed_score_thr: EdgeThreshold::Percentile(55.0),
            im_ed_method: EdgeMethod::Sed,
            im_sed_score_thr: 0.25,
            im_ced_lower: 100.0,
            im_ced_upper: 200.0,
            alpha_mi: 1.0,
            alpha_gmm: 1.0,
            alpha_corr: 0.0,
            alpha_chamfer: 1.0,
            max_iters: 600,
            restart_budget: 5,
            save_every: 0,
            translation_only_pass: false,
            frustum_min_frac: 0.10,
            frustum_min_total: 10_000,
        }
    }
}

impl CalibConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.intrinsics()?;
        if self.frames.is_empty() {
            return Err(CalibError::InvalidConfig("no frames selected".into()));
        }
        if self.sig_in.is_empty() {
            return Err(CalibError::InvalidConfig("empty sigma schedule".into()));
        }
        if self.sig_in.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(CalibError::InvalidConfig(format!(
                "sigma schedule must be positive: {:?}",
                self.sig_in
            )));
        }
        if self.pc_ed_num_nn < 2 {
            return Err(CalibError::InvalidConfig(
                "pc_ed_num_nn must be at least 2".into(),
            ));
        }
        if !(self.pc_ed_rad_nn.is_finite() && self.pc_ed_rad_nn > 0.0) {
            return Err(CalibError::InvalidConfig(format!(
                "pc_ed_rad_nn must be positive, got {}",
                self.pc_ed_rad_nn
            )));
        }
        if let EdgeThreshold::Percentile(q) = self.pc_ed_score_thr {
            if !(0.0..=100.0).contains(&q) {
                return Err(CalibError::InvalidConfig(format!(
                    "edge score percentile out of range: {q}"
                )));
            }
        }
        for w in [
            self.alpha_mi,
            self.alpha_gmm,
            self.alpha_corr,
            self.alpha_chamfer,
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(CalibError::InvalidConfig(format!("bad cost weight {w}")));
            }
        }
        if !(0.0..=1.0).contains(&self.frustum_min_frac) {
            return Err(CalibError::InvalidConfig(format!(
                "frustum_min_frac out of range: {}",
                self.frustum_min_frac
            )));
        }
        Ok(())
    }

    pub fn intrinsics(&self) -> Result<Intrinsics> {
        Intrinsics::from_matrix(&Matrix3::from_fn(|r, c| self.k[r][c]))
    }

    pub fn tau(&self) -> Tau {
        Tau::from_row_slice(&self.tau_init)
    }

    pub fn pc_edge_params(&self) -> PcEdgeParams {
        PcEdgeParams {
            num_nn: self.pc_ed_num_nn,
            radius: self.pc_ed_rad_nn,
            threshold: self.pc_ed_score_thr,
        }
    }

    pub fn canny_params(&self) -> CannyParams {
        CannyParams {
            sigma: 1.4,
            low: self.im_ced_lower,
            high: self.im_ced_upper,
        }
    }

    pub fn optimize_params(&self) -> OptimizeParams {
        OptimizeParams {
            weights: Weights {
                mi: self.alpha_mi,
                gmm: self.alpha_gmm,
                corr: self.alpha_corr,
                chamfer: self.alpha_chamfer,
            },
            sigmas: self.sig_in.clone(),
            scale_sigma_by_depth: self.scale_sigma_by_depth,
            max_iters: self.max_iters,
            restart_budget: self.restart_budget,
            save_every: self.save_every,
            out_dir: None,
            translation_only_pass: self.translation_only_pass,
            floor: FrustumFloor {
                min_frac: self.frustum_min_frac,
                min_total: self.frustum_min_total,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CalibConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = CalibConfig::default();
        cfg.frames.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = CalibConfig::default();
        cfg.sig_in = vec![3.0, -1.0];
        assert!(cfg.validate().is_err());

        let mut cfg = CalibConfig::default();
        cfg.k[0][0] = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = CalibConfig::default();
        cfg.alpha_gmm = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn yaml_roundtrip_with_overrides() {
        let yaml = r#"
frames: [0, 2]
sig_in: [2.0]
im_ed_method: canny
pc_ed_score_thr: !Absolute 0.6
"#;
        let cfg = CalibConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.frames, vec![0, 2]);
        assert_eq!(cfg.im_ed_method, EdgeMethod::Canny);
        assert_eq!(cfg.pc_ed_score_thr, EdgeThreshold::Absolute(0.6));
        // untouched fields keep their defaults
        assert_eq!(cfg.pc_ed_num_nn, 75);
    }
}
