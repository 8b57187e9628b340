//! Per-point edge saliency for lidar sweeps.
//!
//! Every point is scored over a mixed neighborhood: its K nearest
//! neighbors plus all points within a radius. Two cues are combined, a
//! centrality term (how far the neighborhood centroid sits from the query
//! point, normalized by local scale) and a planarity term (the normalized
//! smallest eigenvalue of the neighborhood covariance). Both are high on
//! depth discontinuities and creases and low on flat surfaces.

use kdtree::distance::squared_euclidean;
use kdtree::KdTree;
use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Cutoff separating edge points from the rest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EdgeThreshold {
    /// Keep points with score >= the given value.
    Absolute(f64),
    /// Keep points above the given percentile of the score distribution
    /// (0-100).
    Percentile(f64),
}

#[derive(Debug, Clone, Copy)]
pub struct PcEdgeParams {
    /// K for the nearest-neighbor part of the neighborhood.
    pub num_nn: usize,
    /// Radius (meters) for the radius part.
    pub radius: f64,
    pub threshold: EdgeThreshold,
}

impl Default for PcEdgeParams {
    fn default() -> Self {
        Self {
            num_nn: 75,
            radius: 0.10,
            threshold: EdgeThreshold::Percentile(55.0),
        }
    }
}

/// Edge tables for one frame. `scores` is full length (one entry per
/// point, normalized to `[0, 1]`); `idxs` lists the points whose score
/// passed the threshold.
#[derive(Debug, Clone)]
pub struct PcEdges {
    pub scores: Vec<f64>,
    pub mask: Vec<bool>,
    pub idxs: Vec<usize>,
}

impl PcEdges {
    pub fn empty(n: usize) -> Self {
        Self {
            scores: vec![0.0; n],
            mask: vec![false; n],
            idxs: Vec::new(),
        }
    }
}

/// Score every point and threshold. Runs once per frame; independent of
/// the transform.
pub fn detect_pc_edges(points: &[Point3<f64>], params: &PcEdgeParams) -> PcEdges {
    let n = points.len();
    if n < 3 {
        tracing::warn!("point cloud with {n} points, no edges detected");
        return PcEdges::empty(n);
    }

    let mut tree = KdTree::new(3);
    for (i, p) in points.iter().enumerate() {
        if p.coords.iter().all(|c| c.is_finite()) {
            // only fails on non-finite coordinates, checked above
            let _ = tree.add([p.x, p.y, p.z], i);
        }
    }

    let k = params.num_nn.min(n);
    let r2 = params.radius * params.radius;

    let mut center_scores = vec![0.0f64; n];
    let mut planar_scores = vec![0.0f64; n];

    for (i, p) in points.iter().enumerate() {
        if !p.coords.iter().all(|c| c.is_finite()) {
            continue;
        }
        let query = [p.x, p.y, p.z];
        let knn = match tree.nearest(&query, k, &squared_euclidean) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let ball = match tree.within(&query, r2, &squared_euclidean) {
            Ok(v) => v,
            Err(_) => continue,
        };

        // KNN indices first, then radius neighbors not already present.
        let mut idxs: Vec<usize> = knn.iter().map(|(_, &j)| j).collect();
        let mut dists: Vec<f64> = knn.iter().map(|(d2, _)| d2.sqrt()).collect();
        for (d2, &j) in &ball {
            if !idxs.contains(&j) {
                idxs.push(j);
                dists.push(d2.sqrt());
            }
        }

        let max_d = dists.iter().cloned().fold(0.0f64, f64::max);
        if max_d <= 0.0 || idxs.len() < 3 {
            continue;
        }

        let mut centroid = Vector3::zeros();
        for &j in &idxs {
            centroid += points[j].coords;
        }
        centroid /= idxs.len() as f64;

        center_scores[i] = (centroid - p.coords).norm() / max_d;

        let mut cov = Matrix3::zeros();
        for &j in &idxs {
            let d = points[j].coords - centroid;
            cov += d * d.transpose();
        }
        cov /= idxs.len() as f64;

        let eigvals = cov.symmetric_eigenvalues();
        let sum: f64 = eigvals.iter().sum();
        if sum > f64::EPSILON {
            let min = eigvals.iter().cloned().fold(f64::INFINITY, f64::min);
            // Normalized smallest eigenvalue: near zero on planes and
            // lines, larger where the neighborhood spans a crease.
            planar_scores[i] = min.max(0.0) / sum;
        }
    }

    let max_c = center_scores.iter().cloned().fold(0.0f64, f64::max);
    let max_p = planar_scores.iter().cloned().fold(0.0f64, f64::max);
    let scores: Vec<f64> = center_scores
        .iter()
        .zip(planar_scores.iter())
        .map(|(&c, &p)| {
            let c = if max_c > 0.0 { c / max_c } else { 0.0 };
            let p = if max_p > 0.0 { p / max_p } else { 0.0 };
            0.5 * (c + p)
        })
        .collect();

    let thr = match params.threshold {
        EdgeThreshold::Absolute(t) => t,
        EdgeThreshold::Percentile(q) => percentile(&scores, q),
    };

    let mask: Vec<bool> = scores.iter().map(|&s| s >= thr).collect();
    let idxs: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter_map(|(i, &m)| m.then_some(i))
        .collect();

    if idxs.is_empty() {
        tracing::warn!("no point cloud edges above threshold {thr:.3}");
    }

    PcEdges { scores, mask, idxs }
}

fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q = q.clamp(0.0, 100.0);
    let idx = (q / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx]
}
