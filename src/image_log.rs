use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::blobs::Blob;
use crate::image_metrics::ImageQuality;

/// One `_IQM.csv` row in the rig's column order. The row profile is the
/// per-column mean (varies along x), the col profile the per-row mean.
#[derive(Debug, Serialize)]
struct IqmRow {
    #[serde(rename = "cropLeft")]
    crop_left: usize,
    #[serde(rename = "cropTop")]
    crop_top: usize,
    #[serde(rename = "cropWidth")]
    crop_width: usize,
    #[serde(rename = "cropHeight")]
    crop_height: usize,
    #[serde(rename = "rotAngle [x100]")]
    rot_angle: i64,
    #[serde(rename = "totRoIArea")]
    roi_area: usize,
    #[serde(rename = "nonRoILaplacian")]
    laplacian_variance: f64,
    row_grid_found: bool,
    #[serde(rename = "RMS_row_contrast")]
    row_contrast: f64,
    #[serde(rename = "RMS_row_sharpnesss [x100]")]
    row_sharpness: f64,
    mean_row: f64,
    mean_row_not_mask: f64,
    col_grid_found: bool,
    #[serde(rename = "RMS_col_contrast")]
    col_contrast: f64,
    #[serde(rename = "RMS_col_sharpnesss [x100]")]
    col_sharpness: f64,
    mean_col: f64,
    mean_col_not_mask: f64,
}

impl From<&ImageQuality> for IqmRow {
    fn from(q: &ImageQuality) -> Self {
        Self {
            crop_left: q.crop_left,
            crop_top: q.crop_top,
            crop_width: q.crop_width,
            crop_height: q.crop_height,
            rot_angle: (q.rotation_deg * 100.0).round() as i64,
            roi_area: q.roi_area,
            laplacian_variance: q.laplacian_variance,
            row_grid_found: q.x.grid_found,
            row_contrast: q.x.contrast,
            row_sharpness: q.x.sharpness,
            mean_row: q.x.mean,
            mean_row_not_mask: q.x.mean_outside_mask,
            col_grid_found: q.y.grid_found,
            col_contrast: q.y.contrast,
            col_sharpness: q.y.sharpness,
            mean_col: q.y.mean,
            mean_col_not_mask: q.y.mean_outside_mask,
        }
    }
}

pub struct ImageDataLog;

impl ImageDataLog {
    /// `photo.png` and `photo` both give the stem `photo`.
    pub fn stem_of(image_path: &Path) -> PathBuf {
        image_path.with_extension("")
    }

    fn sibling(stem: &Path, suffix: &str) -> PathBuf {
        let mut name = stem.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(suffix);
        stem.with_file_name(name)
    }

    /// Write `<stem>_IQM.csv` and `<stem>_blobData.csv`, replacing old ones.
    pub fn write(stem: &Path, quality: &ImageQuality, blobs: &[Blob]) -> Result<(PathBuf, PathBuf)> {
        let iqm_path = Self::sibling(stem, "_IQM.csv");
        let mut iqm = csv::Writer::from_path(&iqm_path).with_context(|| format!("Failed to create {:?}", iqm_path))?;
        iqm.serialize(IqmRow::from(quality))?;
        iqm.flush()?;

        let blob_path = Self::sibling(stem, "_blobData.csv");
        let mut writer = csv::Writer::from_path(&blob_path).with_context(|| format!("Failed to create {:?}", blob_path))?;
        if blobs.is_empty() {
            writer.write_record([
                "RoILeft",
                "RoITop",
                "RoIWidth",
                "RoIHeight",
                "RoILaplacian",
                "blobArea",
                "blobPerimeter",
                "blobAvgIntensity",
            ])?;
        }
        for blob in blobs {
            writer.serialize(blob)?;
        }
        writer.flush()?;

        log::info!(target: "platescanner::image_log", "wrote {:?} and {:?} ({} blobs)", iqm_path, blob_path, blobs.len());
        Ok((iqm_path, blob_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_metrics::AxisQuality;

    fn blob(left: usize) -> Blob {
        Blob {
            left,
            top: 4,
            width: 10,
            height: 6,
            laplacian_variance: 12.5,
            area: 41,
            perimeter: 26,
            mean_intensity: 180.0,
        }
    }

    #[test]
    fn writes_both_files_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let stem = ImageDataLog::stem_of(&dir.path().join("plate_01.png"));
        let quality = ImageQuality {
            crop_width: 640,
            crop_height: 480,
            rotation_deg: -1.25,
            roi_area: 1200,
            x: AxisQuality { grid_found: true, ..AxisQuality::default() },
            ..ImageQuality::default()
        };
        let (iqm, blobs) = ImageDataLog::write(&stem, &quality, &[blob(1), blob(30)]).unwrap();

        assert_eq!(iqm.file_name().unwrap(), "plate_01_IQM.csv");
        assert_eq!(blobs.file_name().unwrap(), "plate_01_blobData.csv");

        let mut reader = csv::Reader::from_path(&iqm).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(
            headers,
            [
                "cropLeft",
                "cropTop",
                "cropWidth",
                "cropHeight",
                "rotAngle [x100]",
                "totRoIArea",
                "nonRoILaplacian",
                "row_grid_found",
                "RMS_row_contrast",
                "RMS_row_sharpnesss [x100]",
                "mean_row",
                "mean_row_not_mask",
                "col_grid_found",
                "RMS_col_contrast",
                "RMS_col_sharpnesss [x100]",
                "mean_col",
                "mean_col_not_mask",
            ]
        );
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[2], "640");
        assert_eq!(&row[4], "-125");
        assert_eq!(&row[7], "true");
        assert_eq!(&row[12], "false");

        let mut reader = csv::Reader::from_path(&blobs).unwrap();
        assert_eq!(&reader.headers().unwrap()[7], "blobAvgIntensity");
        let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][0], "30");
    }

    #[test]
    fn empty_blob_list_still_has_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("empty");
        let (_, blobs) = ImageDataLog::write(&stem, &ImageQuality::default(), &[]).unwrap();
        let text = std::fs::read_to_string(blobs).unwrap();
        assert_eq!(text.trim(), "RoILeft,RoITop,RoIWidth,RoIHeight,RoILaplacian,blobArea,blobPerimeter,blobAvgIntensity");
    }
}
