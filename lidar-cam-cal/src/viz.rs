//! Rendering helpers: reprojection overlays, depth images, edge
//! overlays and the loss-history plot.

use image::{Rgb, RgbImage};

use crate::frame::Frame;
use crate::image_edge::ImageEdges;
use crate::pc_edge::PcEdges;
use crate::project::FrameTables;

/// Range (meters) mapped onto the full hue ramp; beyond this everything
/// is drawn with the far color.
const MAX_COLOR_RANGE: f64 = 120.0;

/// Map HSV (h in degrees, s and v in `[0, 1]`) to RGB bytes.
pub fn hsv_to_rgb(h: f64, s: f64, v: f64) -> [u8; 3] {
    let h = h.rem_euclid(360.0);
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match (h / 60.0) as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    ]
}

fn range_hue(range: f64) -> [u8; 3] {
    // near red, far blue
    let t = (range / MAX_COLOR_RANGE).clamp(0.0, 1.0);
    hsv_to_rgb(t * 240.0, 1.0, 1.0)
}

/// The camera image with every in-frustum point drawn, colored by range.
pub fn draw_reprojection(frame: &Frame, tables: &FrameTables) -> RgbImage {
    let mut img = frame.image.clone();
    for (i, &inside) in tables.in_frustum.iter().enumerate() {
        if !inside {
            continue;
        }
        let px = tables.pixels[i];
        let x = px.x.round() as i64;
        let y = px.y.round() as i64;
        if x < 0 || y < 0 || x >= img.width() as i64 || y >= img.height() as i64 {
            continue;
        }
        let color = range_hue(tables.cam_points[i].norm());
        img.put_pixel(x as u32, y as u32, Rgb(color));
    }
    img
}

/// Grayscale depth image: brighter is closer, black where nothing
/// projects.
pub fn depth_image(width: usize, height: usize, tables: &FrameTables) -> RgbImage {
    let mut img = RgbImage::new(width as u32, height as u32);
    let max_z = tables
        .in_frustum
        .iter()
        .zip(tables.cam_points.iter())
        .filter(|(&m, _)| m)
        .map(|(_, c)| c.z)
        .fold(0.0f64, f64::max);
    if max_z <= 0.0 {
        return img;
    }
    for (i, &inside) in tables.in_frustum.iter().enumerate() {
        if !inside {
            continue;
        }
        let px = tables.pixels[i];
        let x = px.x.round() as i64;
        let y = px.y.round() as i64;
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            continue;
        }
        let v = (255.0 * (1.0 - tables.cam_points[i].z / max_z)) as u8;
        img.put_pixel(x as u32, y as u32, Rgb([v, v, v]));
    }
    img
}

/// Image edges in green, projected lidar edge points in red.
pub fn edge_overlay(
    frame: &Frame,
    tables: &FrameTables,
    pc_edges: &PcEdges,
    img_edges: &ImageEdges,
) -> RgbImage {
    let mut img = frame.image.clone();
    for y in 0..img_edges.height.min(img.height() as usize) {
        for x in 0..img_edges.width.min(img.width() as usize) {
            if img_edges.is_edge(x, y) {
                img.put_pixel(x as u32, y as u32, Rgb([0, 200, 0]));
            }
        }
    }
    for &j in &pc_edges.idxs {
        if !tables.in_frustum[j] {
            continue;
        }
        let px = tables.pixels[j];
        let x = px.x.round() as i64;
        let y = px.y.round() as i64;
        if x < 0 || y < 0 || x >= img.width() as i64 || y >= img.height() as i64 {
            continue;
        }
        img.put_pixel(x as u32, y as u32, Rgb([255, 0, 0]));
    }
    img
}

/// Loss per evaluation as a polyline on a white background.
pub fn loss_history_plot(history: &[f64], width: u32, height: u32) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let finite: Vec<f64> = history.iter().cloned().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return img;
    }
    let lo = finite.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = finite.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = (hi - lo).max(1e-12);
    let margin = 4.0;
    let to_xy = |i: usize, v: f64| {
        let x = margin + (width as f64 - 2.0 * margin) * i as f64 / (finite.len() - 1) as f64;
        let y = margin + (height as f64 - 2.0 * margin) * (1.0 - (v - lo) / span);
        (x, y)
    };
    for i in 1..finite.len() {
        let (x0, y0) = to_xy(i - 1, finite[i - 1]);
        let (x1, y1) = to_xy(i, finite[i]);
        draw_segment(&mut img, x0, y0, x1, y1, Rgb([40, 40, 200]));
    }
    img
}

fn draw_segment(img: &mut RgbImage, x0: f64, y0: f64, x1: f64, y1: f64, color: Rgb<u8>) {
    let steps = ((x1 - x0).abs().max((y1 - y0).abs()).ceil() as usize).max(1);
    for s in 0..=steps {
        let t = s as f64 / steps as f64;
        let x = (x0 + t * (x1 - x0)).round() as i64;
        let y = (y0 + t * (y1 - y0)).round() as i64;
        if x >= 0 && y >= 0 && x < img.width() as i64 && y < img.height() as i64 {
            img.put_pixel(x as u32, y as u32, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point2, Point3, Vector3};

    #[test]
    fn hsv_primaries() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), [255, 0, 0]);
        assert_eq!(hsv_to_rgb(120.0, 1.0, 1.0), [0, 255, 0]);
        assert_eq!(hsv_to_rgb(240.0, 1.0, 1.0), [0, 0, 255]);
    }

    #[test]
    fn reprojection_marks_only_in_frustum_points() {
        let img = RgbImage::new(8, 8);
        let frame = Frame::new(
            img,
            vec![Point3::new(0.0, 0.0, 2.0), Point3::new(0.0, 0.0, -2.0)],
            vec![0.5, 0.5],
        )
        .unwrap();
        let tables = FrameTables {
            cam_points: vec![Vector3::new(0.0, 0.0, 2.0), Vector3::new(0.0, 0.0, -2.0)],
            pixels: vec![Point2::new(3.0, 3.0), Point2::new(-1.0, -1.0)],
            in_frustum: vec![true, false],
            n_in_frustum: 1,
        };
        let out = draw_reprojection(&frame, &tables);
        assert_ne!(out.get_pixel(3, 3).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn loss_plot_draws_something() {
        let history: Vec<f64> = (0..100).map(|i| -(i as f64)).collect();
        let img = loss_history_plot(&history, 320, 240);
        let colored = img
            .pixels()
            .filter(|p| p.0 != [255, 255, 255])
            .count();
        assert!(colored > 100);
    }
}
