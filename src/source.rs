// src/source.rs
//
// Frame sources. A directory of still images stands in for a camera in
// tests and offline review; video files need the `video` feature.

use crate::types::Frame;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub trait FrameSource: Send {
    /// None once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn name(&self) -> &str;
}

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Frames from the images of a directory, in file-name order. Frame ids
/// count from 0 and timestamps assume a constant `fps`.
pub struct ImageDirSource {
    name: String,
    files: Vec<PathBuf>,
    next: usize,
    fps: f64,
}

impl ImageDirSource {
    pub fn open(dir: &Path, fps: f64) -> Result<Self> {
        if !dir.is_dir() {
            bail!("{} is not a directory", dir.display());
        }

        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        info!("Found {} images in {}", files.len(), dir.display());
        Ok(Self {
            name: dir.display().to_string(),
            files,
            next: 0,
            fps: if fps > 0.0 { fps } else { 25.0 },
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        let frame_id = self.next as u64;
        self.next += 1;

        let image = image::open(path)
            .with_context(|| format!("Failed to decode {}", path.display()))?
            .to_rgb8();
        debug!("Frame {} from {}", frame_id, path.display());

        let timestamp_ms = frame_id as f64 / self.fps * 1000.0;
        Ok(Some(Frame::new(frame_id, timestamp_ms, image)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A fixed list of frames, replayed once.
pub struct VecSource {
    frames: std::collections::VecDeque<Frame>,
}

impl VecSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl FrameSource for VecSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.pop_front())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Open a source by path: directories are image sequences, anything else
/// is decoded as a video file.
pub fn open_source(path: &Path, fps: f64) -> Result<Box<dyn FrameSource>> {
    if path.is_dir() {
        return Ok(Box::new(ImageDirSource::open(path, fps)?));
    }
    open_video(path)
}

#[cfg(feature = "video")]
fn open_video(path: &Path) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(crate::video::VideoFileSource::open(path)?))
}

#[cfg(not(feature = "video"))]
fn open_video(path: &Path) -> Result<Box<dyn FrameSource>> {
    bail!(
        "{} is not a directory and video decoding needs the `video` feature",
        path.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ppe-source-{}-{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_image_dir_in_name_order() {
        let dir = scratch_dir("order");
        RgbImage::from_pixel(4, 2, Rgb([200, 0, 0]))
            .save(dir.join("b.png"))
            .unwrap();
        RgbImage::from_pixel(6, 3, Rgb([0, 200, 0]))
            .save(dir.join("a.png"))
            .unwrap();
        std::fs::write(dir.join("notes.txt"), "skip me").unwrap();

        let mut source = ImageDirSource::open(&dir, 10.0).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.frame_id, 0);
        assert_eq!(first.image.dimensions(), (6, 3));
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.frame_id, 1);
        assert!((second.timestamp_ms - 100.0).abs() < 1e-9);
        assert!(source.next_frame().unwrap().is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_dir_is_an_error() {
        assert!(ImageDirSource::open(Path::new("/nonexistent/ppe-frames"), 25.0).is_err());
    }

    #[test]
    fn test_vec_source_drains() {
        let mut source = VecSource::new(vec![
            Frame::new(0, 0.0, RgbImage::new(2, 2)),
            Frame::new(1, 40.0, RgbImage::new(2, 2)),
        ]);
        assert_eq!(source.next_frame().unwrap().unwrap().frame_id, 0);
        assert_eq!(source.next_frame().unwrap().unwrap().frame_id, 1);
        assert!(source.next_frame().unwrap().is_none());
    }
}
