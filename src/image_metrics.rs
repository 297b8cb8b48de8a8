//! Grid detection and image-quality metrics for well-plate frames.
//!
//! Frames are levelled by a small rotation, cropped and median blurred. The
//! plate grid shows up as periodic dips in the column and row mean
//! profiles. Wells are found as the quiet stretches of a high-passed,
//! smoothed profile; a plate is recognised when those stretches come in
//! two sizes whose ratio is close to sqrt 2.

use anyhow::{anyhow, Result};
use ndarray::{s, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::blobs::{detect_blobs, Blob, BlobSettings};
use crate::camera::Frame;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct GridSettings {
    /// Moving-average window of the illumination high-pass.
    pub high_pass: usize,
    pub smooth: usize,
    pub min_segment: usize,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self { high_pass: 111, smooth: 35, min_segment: 50 }
    }
}

/// Crop rectangle in pixels. `right`/`bottom` of 0 mean the image edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CropSettings {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AnalysisSettings {
    /// Counter-clockwise, degrees, strictly within +/-5.
    pub rotation_deg: f64,
    pub crop: CropSettings,
    pub median_ksize: usize,
    pub grid: GridSettings,
    pub blobs: BlobSettings,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            rotation_deg: 0.0,
            crop: CropSettings::default(),
            median_ksize: 3,
            grid: GridSettings::default(),
            blobs: BlobSettings::default(),
        }
    }
}

impl AnalysisSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.rotation_deg.abs() < MAX_ROTATION_DEG) {
            return Err(anyhow!(
                "ROTATION_DEG must lie strictly between -{0} and {0} (got {1})",
                MAX_ROTATION_DEG,
                self.rotation_deg
            ));
        }
        check_odd("MEDIAN_KSIZE", self.median_ksize)?;
        check_odd("GRID.HIGH_PASS", self.grid.high_pass)?;
        check_odd("GRID.SMOOTH", self.grid.smooth)?;
        if self.grid.min_segment == 0 {
            return Err(anyhow!("GRID.MIN_SEGMENT must be greater than 0"));
        }
        self.blobs.validate()
    }
}

pub const MAX_ROTATION_DEG: f64 = 5.0;

fn check_odd(name: &str, value: usize) -> Result<()> {
    if value > 1 && value % 2 == 1 {
        Ok(())
    } else {
        Err(anyhow!("{} must be odd and greater than 1 (got {})", name, value))
    }
}

/// Median filter with replicated border.
pub fn median_blur(img: ArrayView2<'_, u8>, ksize: usize) -> Result<Array2<u8>> {
    check_odd("Median blur aperture", ksize)?;
    let (h, w) = img.dim();
    if h == 0 || w == 0 {
        return Ok(img.to_owned());
    }
    let r = (ksize / 2) as isize;
    let clamp = |i: isize, n: usize| i.clamp(0, n as isize - 1) as usize;

    let mut out = vec![0u8; h * w];
    out.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let mut window = Vec::with_capacity(ksize * ksize);
        for (x, px) in row.iter_mut().enumerate() {
            window.clear();
            for dy in -r..=r {
                let yy = clamp(y as isize + dy, h);
                for dx in -r..=r {
                    window.push(img[[yy, clamp(x as isize + dx, w)]]);
                }
            }
            let mid = window.len() / 2;
            *px = *window.select_nth_unstable(mid).1;
        }
    });
    Ok(Array2::from_shape_vec((h, w), out)?)
}

/// Rotate about the image centre, keeping the size. Bilinear sampling;
/// pixels that come from outside the frame are black. Positive angles turn
/// the content counter-clockwise on screen.
pub fn rotate_image(img: ArrayView2<'_, u8>, angle_deg: f64) -> Array2<u8> {
    let (h, w) = img.dim();
    if angle_deg == 0.0 || h == 0 || w == 0 {
        return img.to_owned();
    }
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
    let sample = |x: isize, y: isize| -> f64 {
        if x < 0 || y < 0 || x >= w as isize || y >= h as isize {
            0.0
        } else {
            img[[y as usize, x as usize]] as f64
        }
    };

    let mut out = vec![0u8; h * w];
    out.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let dy = y as f64 - cy;
        for (x, px) in row.iter_mut().enumerate() {
            let dx = x as f64 - cx;
            // Inverse map: destination pixel back into the source.
            let sx = cos * dx - sin * dy + cx;
            let sy = sin * dx + cos * dy + cy;
            let (x0, y0) = (sx.floor(), sy.floor());
            let (fx, fy) = (sx - x0, sy - y0);
            let (x0, y0) = (x0 as isize, y0 as isize);
            let top = sample(x0, y0) * (1.0 - fx) + sample(x0 + 1, y0) * fx;
            let bottom = sample(x0, y0 + 1) * (1.0 - fx) + sample(x0 + 1, y0 + 1) * fx;
            *px = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
    });
    Array2::from_shape_vec((h, w), out).unwrap_or_else(|_| img.to_owned())
}

/// Centred moving average over `n` samples (odd, > 1), zero padded so the
/// output has the input's length.
pub fn moving_average(data: &[f64], n: usize) -> Result<Vec<f64>> {
    check_odd("Moving average size", n)?;
    let pad = (n - 1) / 2;
    let mut cumsum = Vec::with_capacity(data.len() + 2 * pad + 1);
    cumsum.push(0.0);
    let padded = std::iter::repeat(0.0)
        .take(pad)
        .chain(data.iter().copied())
        .chain(std::iter::repeat(0.0).take(pad));
    let mut acc = 0.0;
    for v in padded {
        acc += v;
        cumsum.push(acc);
    }
    Ok((0..data.len()).map(|i| (cumsum[i + n] - cumsum[i]) / n as f64).collect())
}

/// Result of grid detection along one profile.
#[derive(Debug, Clone, PartialEq)]
pub struct GridMask {
    pub found: bool,
    /// True inside wells, false on grid lines.
    pub mask: Vec<bool>,
    pub segments: Vec<usize>,
}

pub fn find_grid(profile: &[f64], settings: &GridSettings) -> Result<GridMask> {
    let trend = moving_average(profile, settings.high_pass)?;
    let high: Vec<f64> = profile.iter().zip(&trend).map(|(p, t)| (p - t).abs()).collect();
    let smooth = moving_average(&high, settings.smooth)?;
    let centre = mean(&smooth);
    let mut mask: Vec<bool> = smooth.iter().map(|v| v - centre < 0.0).collect();

    let mut segments = Vec::new();
    let mut start = None;
    for i in 0..=mask.len() {
        let inside = i < mask.len() && mask[i];
        match (inside, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                let len = i - s;
                if len < settings.min_segment {
                    mask[s..i].iter_mut().for_each(|m| *m = false);
                } else {
                    segments.push(len);
                }
                start = None;
            }
            _ => {}
        }
    }

    Ok(GridMask { found: grid_pattern(&segments), mask, segments })
}

/// Two well sizes, about equally many of each, sized sqrt 2 apart.
pub fn grid_pattern(segments: &[usize]) -> bool {
    if !(2..=10).contains(&segments.len()) {
        return false;
    }
    let lengths: Vec<f64> = segments.iter().map(|&s| s as f64).collect();
    let avg = mean(&lengths);
    let short: Vec<f64> = lengths.iter().copied().filter(|&l| l < avg).collect();
    let long: Vec<f64> = lengths.iter().copied().filter(|&l| l > avg).collect();
    let count_ratio = if long.len() > short.len() {
        short.len() as f64 / long.len() as f64
    } else if !short.is_empty() {
        long.len() as f64 / short.len() as f64
    } else {
        0.0
    };
    if count_ratio <= 0.5 {
        return false;
    }
    let size_ratio = std::f64::consts::SQRT_2 * mean(&short) / mean(&long);
    (0.9..=1.1).contains(&size_ratio)
}

/// Variance of the 4-neighbour Laplacian, reflect-101 border.
pub fn laplacian_variance(img: ArrayView2<'_, u8>) -> f64 {
    let (h, w) = img.dim();
    if h == 0 || w == 0 {
        return 0.0;
    }
    let reflect = |i: isize, n: usize| -> usize {
        let n = n as isize;
        if n == 1 {
            0
        } else if i < 0 {
            (-i) as usize
        } else if i >= n {
            (2 * n - 2 - i) as usize
        } else {
            i as usize
        }
    };
    let mut values = Vec::with_capacity(h * w);
    for y in 0..h {
        for x in 0..w {
            let (yi, xi) = (y as isize, x as isize);
            let c = img[[y, x]] as f64;
            let sum = img[[reflect(yi - 1, h), x]] as f64
                + img[[reflect(yi + 1, h), x]] as f64
                + img[[y, reflect(xi - 1, w)]] as f64
                + img[[y, reflect(xi + 1, w)]] as f64;
            values.push(sum - 4.0 * c);
        }
    }
    variance(&values)
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub(crate) fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
}

/// Quality figures along one direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisQuality {
    pub grid_found: bool,
    /// Variance of the mean profile.
    pub contrast: f64,
    /// 100 x std of the profile gradient over the grid lines.
    pub sharpness: f64,
    pub mean: f64,
    pub mean_outside_mask: f64,
}

impl AxisQuality {
    fn from_profile(profile: &[f64], grid: &GridMask) -> Self {
        let lines: Vec<f64> = profile
            .iter()
            .zip(&grid.mask)
            .filter(|(_, &inside)| !inside)
            .map(|(&v, _)| v)
            .collect();
        let gradient: Vec<f64> = lines.windows(2).map(|p| p[1] - p[0]).collect();
        Self {
            grid_found: grid.found,
            contrast: variance(profile),
            sharpness: 100.0 * variance(&gradient).sqrt(),
            mean: mean(profile),
            mean_outside_mask: mean(&lines),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageQuality {
    pub crop_left: usize,
    pub crop_top: usize,
    pub crop_width: usize,
    pub crop_height: usize,
    pub rotation_deg: f64,
    /// Pixels left after masking the grid lines.
    pub roi_area: usize,
    pub laplacian_variance: f64,
    /// Along x, from the per-column means.
    pub x: AxisQuality,
    pub y: AxisQuality,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub quality: ImageQuality,
    pub blobs: Vec<Blob>,
    /// Blurred crop with the grid lines zeroed.
    pub masked: Array2<u8>,
    pub x_grid: GridMask,
    pub y_grid: GridMask,
}

fn crop_bounds(crop: &CropSettings, w: usize, h: usize) -> Result<(usize, usize, usize, usize)> {
    let right = if crop.right == 0 { w } else { crop.right };
    let bottom = if crop.bottom == 0 { h } else { crop.bottom };
    if crop.left >= right || right > w || crop.top >= bottom || bottom > h {
        return Err(anyhow!(
            "Crop ({}, {})-({}, {}) does not fit a {}x{} frame",
            crop.left,
            crop.top,
            right,
            bottom,
            w,
            h
        ));
    }
    Ok((crop.left, crop.top, right, bottom))
}

pub fn analyze(frame: &Frame, settings: &AnalysisSettings) -> Result<Analysis> {
    let (left, top, right, bottom) = crop_bounds(&settings.crop, frame.width(), frame.height())?;
    let rotated = rotate_image(frame.pixels.view(), settings.rotation_deg);
    let cropped = rotated.slice(s![top..bottom, left..right]);
    let blurred = median_blur(cropped, settings.median_ksize)?;

    let float = blurred.mapv(f64::from);
    let x_profile = float.mean_axis(Axis(0)).map(|a| a.to_vec()).unwrap_or_default();
    let y_profile = float.mean_axis(Axis(1)).map(|a| a.to_vec()).unwrap_or_default();
    let x_grid = find_grid(&x_profile, &settings.grid)?;
    let y_grid = find_grid(&y_profile, &settings.grid)?;

    let mut masked = blurred;
    for ((r, c), px) in masked.indexed_iter_mut() {
        if !x_grid.mask[c] || !y_grid.mask[r] {
            *px = 0;
        }
    }

    let blobs = detect_blobs(masked.view(), &settings.blobs)?;
    let quality = ImageQuality {
        crop_left: left,
        crop_top: top,
        crop_width: right - left,
        crop_height: bottom - top,
        rotation_deg: settings.rotation_deg,
        roi_area: masked.iter().filter(|&&p| p != 0).count(),
        laplacian_variance: laplacian_variance(masked.view()),
        x: AxisQuality::from_profile(&x_profile, &x_grid),
        y: AxisQuality::from_profile(&y_profile, &y_grid),
    };
    log::debug!(
        target: "platescanner::image_metrics",
        "frame {}: grid x={} y={}, {} blobs, laplacian var {:.1}",
        frame.sequence,
        quality.x.grid_found,
        quality.y.grid_found,
        blobs.len(),
        quality.laplacian_variance
    );
    Ok(Analysis { quality, blobs, masked, x_grid, y_grid })
}
