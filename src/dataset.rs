use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{ImageBuffer, Rgb};
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;

use capture_bus::frame::{DepthBuffer, Frame};

/// Stored depth unit: integer millimeters.
const DEPTH_INTEGER_SCALE: f64 = 1000.0;

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("project {0} already exists")]
    ProjectAlreadyExists(String),
    #[error("dataset io: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest: {0}")]
    Manifest(String),
}

/// `transforms.json` schema, one manifest per capture project. Camera
/// parameters are fixed by the first saved frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub fl_x: f64,
    pub fl_y: f64,
    pub cx: f64,
    pub cy: f64,
    pub w: u32,
    pub h: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_integer_scale: Option<f64>,
    pub frames: Vec<ManifestFrame>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestFrame {
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_path: Option<String>,
    /// Row-major 4x4, one inner array per row.
    pub transform_matrix: [[f32; 4]; 4],
    pub timestamp: f64,
}

/// Writes a capture project: `images/` (and `depth/`) PNG files plus a
/// `transforms.json` manifest, optionally zipped on finalize.
pub struct DatasetWriter {
    root: PathBuf,
    name: String,
    manifest: Option<Manifest>,
    next_index: u32,
}

impl DatasetWriter {
    /// Creates the project directory, named from the current local time.
    pub fn create(dataset_root: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let name = chrono::Local::now().format("%y%m%d%H%M%S").to_string();
        Self::create_named(dataset_root, &name)
    }

    pub fn create_named(dataset_root: impl AsRef<Path>, name: &str) -> Result<Self, DatasetError> {
        let root = dataset_root.as_ref().join(name);
        if root.exists() {
            return Err(DatasetError::ProjectAlreadyExists(name.to_string()));
        }
        std::fs::create_dir_all(root.join("images"))?;
        log::info!("created capture project {}", root.display());
        Ok(Self {
            root,
            name: name.to_string(),
            manifest: None,
            next_index: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_count(&self) -> usize {
        self.manifest.as_ref().map(|m| m.frames.len()).unwrap_or(0)
    }

    /// Appends one frame. The first frame fixes the manifest's size and
    /// intrinsics; later frames with a different size are rejected.
    pub async fn save_frame(&mut self, frame: Arc<Frame>) -> Result<(), DatasetError> {
        match &self.manifest {
            None => {
                self.manifest = Some(Manifest {
                    fl_x: frame.intrinsics.fx as f64,
                    fl_y: frame.intrinsics.fy as f64,
                    cx: frame.intrinsics.cx as f64,
                    cy: frame.intrinsics.cy as f64,
                    w: frame.width,
                    h: frame.height,
                    depth_integer_scale: frame.depth.as_ref().map(|_| DEPTH_INTEGER_SCALE),
                    frames: Vec::new(),
                });
            }
            Some(m) if m.w != frame.width || m.h != frame.height => {
                return Err(DatasetError::Manifest(format!(
                    "frame size {}x{} does not match project {}x{}",
                    frame.width, frame.height, m.w, m.h
                )));
            }
            Some(_) => {}
        }

        let index = self.next_index;
        self.next_index += 1;
        let file_path = format!("images/{}.png", index);
        let rgb_path = self.root.join(&file_path);
        let depth_rel = frame.depth.as_ref().map(|_| format!("depth/{}.png", index));
        let depth_abs = depth_rel.as_ref().map(|p| self.root.join(p));
        if let Some(path) = &depth_abs {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let encode_frame = frame.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DatasetError> {
            write_rgb_png(&rgb_path, &encode_frame)?;
            if let (Some(path), Some(depth)) = (depth_abs, encode_frame.depth.as_ref()) {
                write_depth_png(&path, depth)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| DatasetError::Manifest(format!("encode task failed: {}", e)))??;

        if let Some(m) = self.manifest.as_mut() {
            m.frames.push(ManifestFrame {
                file_path,
                depth_path: depth_rel,
                transform_matrix: frame.transform.rows(),
                timestamp: frame.timestamp,
            });
        }
        Ok(())
    }

    /// Writes `transforms.json`; with `zip_project` the directory is packed
    /// into `<name>.zip` next to it and removed.
    pub fn finalize(self, zip_project: bool) -> Result<PathBuf, DatasetError> {
        let manifest = self
            .manifest
            .ok_or_else(|| DatasetError::Manifest("no frames saved".to_string()))?;
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| DatasetError::Manifest(e.to_string()))?;
        std::fs::write(self.root.join("transforms.json"), json)?;
        log::info!(
            "finalized project {} with {} frames",
            self.root.display(),
            manifest.frames.len()
        );
        if !zip_project {
            return Ok(self.root);
        }

        let zip_path = self.root.with_extension("zip");
        zip_dir(&self.root, &zip_path)?;
        std::fs::remove_dir_all(&self.root)?;
        Ok(zip_path)
    }

    /// Drops the project directory without writing a manifest.
    pub fn clean(self) -> Result<(), DatasetError> {
        log::info!("discarding project {}", self.root.display());
        std::fs::remove_dir_all(&self.root)?;
        Ok(())
    }
}

fn write_rgb_png(path: &Path, frame: &Frame) -> Result<(), DatasetError> {
    let buf: ImageBuffer<Rgb<u8>, _> =
        ImageBuffer::from_raw(frame.width, frame.height, frame.rgb.to_vec()).ok_or_else(|| {
            DatasetError::Manifest(format!(
                "rgb buffer of {} bytes does not fit {}x{}",
                frame.rgb.len(),
                frame.width,
                frame.height
            ))
        })?;
    buf.save(path)
        .map_err(|e| DatasetError::Manifest(format!("png encode {}: {}", path.display(), e)))
}

/// Depth planes are f32 meters; stored as 16-bit grayscale millimeters.
fn write_depth_png(path: &Path, depth: &DepthBuffer) -> Result<(), DatasetError> {
    let expected = (depth.width * depth.height * 4) as usize;
    if depth.data.len() != expected {
        return Err(DatasetError::Manifest(format!(
            "depth buffer of {} bytes does not fit {}x{}",
            depth.data.len(),
            depth.width,
            depth.height
        )));
    }
    let mut pixels = Vec::with_capacity((depth.width * depth.height) as usize);
    for chunk in depth.data.chunks_exact(4) {
        let meters = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) * depth.scale;
        let mm = (meters as f64 * DEPTH_INTEGER_SCALE).clamp(0.0, u16::MAX as f64);
        pixels.push(mm as u16);
    }
    let buf: ImageBuffer<image::Luma<u16>, _> =
        ImageBuffer::from_raw(depth.width, depth.height, pixels)
            .ok_or_else(|| DatasetError::Manifest("depth buffer shape mismatch".to_string()))?;
    buf.save(path)
        .map_err(|e| DatasetError::Manifest(format!("png encode {}: {}", path.display(), e)))
}

fn zip_dir(dir: &Path, out: &Path) -> Result<(), DatasetError> {
    let file = File::create(out)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let base = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let rel = path
                .strip_prefix(dir)
                .map_err(|e| DatasetError::Manifest(e.to_string()))?;
            let name = format!("{}/{}", base, rel.to_string_lossy());
            writer
                .start_file(name, options)
                .map_err(|e| DatasetError::Manifest(e.to_string()))?;
            let data = std::fs::read(&path)?;
            writer.write_all(&data)?;
        }
    }
    writer
        .finish()
        .map_err(|e| DatasetError::Manifest(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use capture_bus::frame::{CameraIntrinsics, Transform};

    fn test_frame(width: u32, height: u32, with_depth: bool) -> Arc<Frame> {
        let depth = with_depth.then(|| {
            let mut data = Vec::new();
            for _ in 0..(width * height) {
                data.extend_from_slice(&1.5f32.to_le_bytes());
            }
            DepthBuffer {
                width,
                height,
                scale: 1.0,
                data: Bytes::from(data),
            }
        });
        Arc::new(Frame {
            timestamp: 0.5,
            rgb: Bytes::from(vec![128u8; (width * height * 3) as usize]),
            depth,
            intrinsics: CameraIntrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: width as f32 / 2.0,
                cy: height as f32 / 2.0,
            },
            transform: Transform::IDENTITY,
            width,
            height,
        })
    }

    #[tokio::test]
    async fn test_first_frame_fixes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DatasetWriter::create_named(dir.path(), "proj").unwrap();
        writer.save_frame(test_frame(4, 4, false)).await.unwrap();
        let err = writer.save_frame(test_frame(8, 4, false)).await;
        assert!(matches!(err, Err(DatasetError::Manifest(_))));
        let root = writer.finalize(false).unwrap();
        let raw = std::fs::read_to_string(root.join("transforms.json")).unwrap();
        let manifest: Manifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(manifest.w, 4);
        assert_eq!(manifest.fl_x, 500.0);
        assert_eq!(manifest.frames.len(), 1);
        assert_eq!(manifest.frames[0].file_path, "images/0.png");
        assert!(manifest.depth_integer_scale.is_none());
    }

    #[tokio::test]
    async fn test_depth_frames_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DatasetWriter::create_named(dir.path(), "depthproj").unwrap();
        writer.save_frame(test_frame(4, 4, true)).await.unwrap();
        writer.save_frame(test_frame(4, 4, true)).await.unwrap();
        let root = writer.finalize(false).unwrap();
        assert!(root.join("depth/1.png").exists());
        let raw = std::fs::read_to_string(root.join("transforms.json")).unwrap();
        let manifest: Manifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(manifest.depth_integer_scale, Some(1000.0));
        assert_eq!(manifest.frames[1].depth_path.as_deref(), Some("depth/1.png"));
    }

    #[tokio::test]
    async fn test_finalize_zips_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DatasetWriter::create_named(dir.path(), "zipped").unwrap();
        writer.save_frame(test_frame(4, 4, false)).await.unwrap();
        let out = writer.finalize(true).unwrap();
        assert_eq!(out.extension().unwrap(), "zip");
        assert!(out.exists());
        assert!(!dir.path().join("zipped").exists());
    }

    #[test]
    fn test_duplicate_project_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _first = DatasetWriter::create_named(dir.path(), "dup").unwrap();
        let err = DatasetWriter::create_named(dir.path(), "dup");
        assert!(matches!(err, Err(DatasetError::ProjectAlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_clean_removes_project() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DatasetWriter::create_named(dir.path(), "gone").unwrap();
        writer.save_frame(test_frame(4, 4, false)).await.unwrap();
        writer.clean().unwrap();
        assert!(!dir.path().join("gone").exists());
    }
}
