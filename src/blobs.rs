use anyhow::{anyhow, Result};
use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::image_metrics::laplacian_variance;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BlobSettings {
    pub block_size: usize,
    pub offset: f64,
    /// Foreground is darker than its surroundings.
    pub invert: bool,
    pub min_area: usize,
    pub max_area: usize,
}

impl Default for BlobSettings {
    fn default() -> Self {
        Self { block_size: 3, offset: 0.0, invert: false, min_area: 30, max_area: 5000 }
    }
}

impl BlobSettings {
    pub fn validate(&self) -> Result<()> {
        if self.block_size < 3 || self.block_size % 2 == 0 {
            return Err(anyhow!("BLOCK_SIZE must be odd and greater than 1 (got {})", self.block_size));
        }
        if self.min_area >= self.max_area {
            return Err(anyhow!("MIN_AREA {} must be below MAX_AREA {}", self.min_area, self.max_area));
        }
        Ok(())
    }
}

/// Normalised Gaussian kernel with the sigma OpenCV derives from the size.
pub fn gaussian_kernel(ksize: usize) -> Vec<f64> {
    let sigma = 0.3 * ((ksize as f64 - 1.0) * 0.5 - 1.0) + 0.8;
    let centre = (ksize as f64 - 1.0) / 2.0;
    let raw: Vec<f64> = (0..ksize)
        .map(|i| {
            let d = i as f64 - centre;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / sum).collect()
}

fn gaussian_blur(img: ArrayView2<'_, u8>, ksize: usize) -> Array2<f64> {
    let (h, w) = img.dim();
    let kernel = gaussian_kernel(ksize);
    let r = (ksize / 2) as isize;
    let clamp = |i: isize, n: usize| i.clamp(0, n as isize - 1) as usize;

    let mut horizontal = Array2::<f64>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            horizontal[[y, x]] = kernel
                .iter()
                .enumerate()
                .map(|(k, wgt)| wgt * img[[y, clamp(x as isize + k as isize - r, w)]] as f64)
                .sum();
        }
    }
    let mut out = Array2::<f64>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            out[[y, x]] = kernel
                .iter()
                .enumerate()
                .map(|(k, wgt)| wgt * horizontal[[clamp(y as isize + k as isize - r, h), x]])
                .sum();
        }
    }
    out
}

/// 255 where a pixel exceeds its Gaussian-weighted neighbourhood mean minus
/// `offset`, 0 elsewhere; swapped when `invert` is set.
pub fn adaptive_threshold(img: ArrayView2<'_, u8>, block_size: usize, offset: f64, invert: bool) -> Result<Array2<u8>> {
    if block_size < 3 || block_size % 2 == 0 {
        return Err(anyhow!("Adaptive threshold block size must be odd and greater than 1 (got {})", block_size));
    }
    let local = gaussian_blur(img, block_size);
    Ok(Array2::from_shape_fn(img.dim(), |(y, x)| {
        let above = img[[y, x]] as f64 > local[[y, x]].round() - offset;
        if above != invert {
            255
        } else {
            0
        }
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component {
    pub label: u32,
    pub left: usize,
    pub top: usize,
    pub width: usize,
    pub height: usize,
    pub area: usize,
}

/// 8-connected labelling of the non-zero pixels. Labels start at 1; 0 is
/// background.
pub fn connected_components(mask: ArrayView2<'_, u8>) -> (Array2<u32>, Vec<Component>) {
    let (h, w) = mask.dim();
    let mut labels = Array2::<u32>::zeros((h, w));
    let mut components = Vec::new();
    let mut stack = Vec::new();

    for y in 0..h {
        for x in 0..w {
            if mask[[y, x]] == 0 || labels[[y, x]] != 0 {
                continue;
            }
            let label = components.len() as u32 + 1;
            let (mut x0, mut y0, mut x1, mut y1, mut area) = (x, y, x, y, 0usize);
            labels[[y, x]] = label;
            stack.push((y, x));
            while let Some((cy, cx)) = stack.pop() {
                area += 1;
                x0 = x0.min(cx);
                x1 = x1.max(cx);
                y0 = y0.min(cy);
                y1 = y1.max(cy);
                for dy in -1isize..=1 {
                    for dx in -1isize..=1 {
                        let (ny, nx) = (cy as isize + dy, cx as isize + dx);
                        if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                            continue;
                        }
                        let (ny, nx) = (ny as usize, nx as usize);
                        if mask[[ny, nx]] != 0 && labels[[ny, nx]] == 0 {
                            labels[[ny, nx]] = label;
                            stack.push((ny, nx));
                        }
                    }
                }
            }
            components.push(Component {
                label,
                left: x0,
                top: y0,
                width: x1 - x0 + 1,
                height: y1 - y0 + 1,
                area,
            });
        }
    }
    (labels, components)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "RoILeft")]
    pub left: usize,
    #[serde(rename = "RoITop")]
    pub top: usize,
    #[serde(rename = "RoIWidth")]
    pub width: usize,
    #[serde(rename = "RoIHeight")]
    pub height: usize,
    /// Laplacian variance inside the bounding box, a local focus measure.
    #[serde(rename = "RoILaplacian")]
    pub laplacian_variance: f64,
    #[serde(rename = "blobArea")]
    pub area: usize,
    /// Pixels of the blob touching background (4-neighbourhood).
    #[serde(rename = "blobPerimeter")]
    pub perimeter: usize,
    #[serde(rename = "blobAvgIntensity")]
    pub mean_intensity: f64,
}

fn measure(image: ArrayView2<'_, u8>, labels: &Array2<u32>, c: &Component) -> Blob {
    let (h, w) = labels.dim();
    let mut perimeter = 0;
    let mut sum = 0.0;
    for y in c.top..c.top + c.height {
        for x in c.left..c.left + c.width {
            if labels[[y, x]] != c.label {
                continue;
            }
            sum += image[[y, x]] as f64;
            let edge = y == 0
                || x == 0
                || y + 1 == h
                || x + 1 == w
                || labels[[y - 1, x]] != c.label
                || labels[[y + 1, x]] != c.label
                || labels[[y, x - 1]] != c.label
                || labels[[y, x + 1]] != c.label;
            if edge {
                perimeter += 1;
            }
        }
    }
    let roi = image.slice(s![c.top..c.top + c.height, c.left..c.left + c.width]);
    Blob {
        left: c.left,
        top: c.top,
        width: c.width,
        height: c.height,
        laplacian_variance: laplacian_variance(roi),
        area: c.area,
        perimeter,
        mean_intensity: sum / c.area.max(1) as f64,
    }
}

/// Blobs of the (grid-masked, blurred) image with `min_area < area < max_area`.
pub fn detect_blobs(image: ArrayView2<'_, u8>, settings: &BlobSettings) -> Result<Vec<Blob>> {
    let binary = adaptive_threshold(image, settings.block_size, settings.offset, settings.invert)?;
    let (labels, components) = connected_components(binary.view());
    let kept: Vec<&Component> = components
        .iter()
        .filter(|c| c.area > settings.min_area && c.area < settings.max_area)
        .collect();
    log::trace!(target: "platescanner::blobs", "{} components, {} within area limits", components.len(), kept.len());
    Ok(kept.par_iter().map(|c| measure(image, &labels, c)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn gaussian_kernel_is_normalised_and_symmetric() {
        let k = gaussian_kernel(5);
        assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((k[0] - k[4]).abs() < 1e-15);
        assert!(k[2] > k[1] && k[1] > k[0]);
    }

    #[test]
    fn threshold_marks_bright_edges() {
        let mut img = Array2::from_elem((9, 9), 20u8);
        img.slice_mut(s![3..6, 3..6]).fill(200);
        let bw = adaptive_threshold(img.view(), 3, 0.0, false).unwrap();
        assert_eq!(bw[[3, 3]], 255);
        assert_eq!(bw[[0, 0]], 0);
        assert_eq!(bw[[3, 2]], 0);

        let inverted = adaptive_threshold(img.view(), 3, 0.0, true).unwrap();
        assert_eq!(inverted[[0, 0]], 255);
        assert_eq!(inverted[[3, 3]], 0);
        assert!(adaptive_threshold(img.view(), 4, 0.0, false).is_err());
    }

    #[test]
    fn components_are_eight_connected() {
        let mask = array![
            [1u8, 0, 0, 0, 1],
            [0, 1, 0, 0, 1],
            [0, 0, 0, 0, 0],
            [1, 1, 0, 0, 0],
        ];
        let (labels, comps) = connected_components(mask.view());
        assert_eq!(comps.len(), 3);
        assert_eq!(labels[[0, 0]], labels[[1, 1]]);
        assert_eq!(comps[0].area, 2);
        assert_eq!((comps[1].left, comps[1].top, comps[1].width, comps[1].height), (4, 0, 1, 2));
        assert_eq!(comps[2].area, 2);
        assert_eq!(labels[[2, 2]], 0);
    }

    #[test]
    fn bright_square_becomes_one_blob() {
        let mut img = Array2::from_elem((60, 60), 20u8);
        img.slice_mut(s![20..30, 15..25]).fill(200);
        img.slice_mut(s![45..48, 45..48]).fill(200);
        let settings = BlobSettings { block_size: 31, ..BlobSettings::default() };

        let blobs = detect_blobs(img.view(), &settings).unwrap();
        assert_eq!(blobs.len(), 1);
        let blob = &blobs[0];
        assert_eq!((blob.left, blob.top, blob.width, blob.height), (15, 20, 10, 10));
        assert_eq!(blob.area, 100);
        assert_eq!(blob.perimeter, 36);
        assert_eq!(blob.mean_intensity, 200.0);
        assert_eq!(blob.laplacian_variance, 0.0);
    }

    #[test]
    fn settings_validation() {
        assert!(BlobSettings::default().validate().is_ok());
        assert!(BlobSettings { block_size: 2, ..BlobSettings::default() }.validate().is_err());
        assert!(BlobSettings { min_area: 10, max_area: 10, ..BlobSettings::default() }.validate().is_err());
    }
}
