//! Per-frame input data: a color image plus a lidar sweep.

use image::RgbImage;
use nalgebra::Point3;

use crate::{CalibError, Result};

/// One synchronized capture. Immutable once constructed.
pub struct Frame {
    pub image: RgbImage,
    /// Grayscale luma in `[0, 255]`, row-major, cached at construction.
    gray: Vec<f64>,
    /// Point coordinates in the lidar frame.
    pub points: Vec<Point3<f64>>,
    /// Per-point reflectance in `[0, 1]`.
    pub reflectance: Vec<f64>,
}

impl Frame {
    pub fn new(image: RgbImage, points: Vec<Point3<f64>>, reflectance: Vec<f64>) -> Result<Self> {
        if points.len() != reflectance.len() {
            return Err(CalibError::InvalidConfig(format!(
                "{} points but {} reflectance values",
                points.len(),
                reflectance.len()
            )));
        }
        let gray = image
            .pixels()
            .map(|p| 0.299 * p.0[0] as f64 + 0.587 * p.0[1] as f64 + 0.114 * p.0[2] as f64)
            .collect();
        Ok(Self {
            image,
            gray,
            points,
            reflectance,
        })
    }

    pub fn width(&self) -> usize {
        self.image.width() as usize
    }

    pub fn height(&self) -> usize {
        self.image.height() as usize
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Grayscale value at integer pixel coordinates, `None` out of bounds.
    pub fn gray_at(&self, x: i64, y: i64) -> Option<f64> {
        if x < 0 || y < 0 || x >= self.width() as i64 || y >= self.height() as i64 {
            return None;
        }
        Some(self.gray[y as usize * self.width() + x as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgb;

    #[test]
    fn gray_is_luma_weighted() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        let f = Frame::new(img, vec![Point3::origin()], vec![0.5]).unwrap();
        assert_relative_eq!(f.gray_at(0, 0).unwrap(), 0.299 * 255.0);
        assert_relative_eq!(f.gray_at(1, 0).unwrap(), 0.587 * 255.0);
        assert!(f.gray_at(2, 0).is_none());
        assert!(f.gray_at(-1, 0).is_none());
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let img = RgbImage::new(1, 1);
        assert!(Frame::new(img, vec![Point3::origin()], vec![]).is_err());
    }
}
