// src/video.rs

use crate::source::FrameSource;
use crate::types::Frame;
use anyhow::{bail, Context, Result};
use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use std::path::Path;
use tracing::info;

pub struct VideoFileSource {
    name: String,
    cap: VideoCapture,
    fps: f64,
    total_frames: i64,
    next_frame_id: u64,
}

impl VideoFileSource {
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening video: {}", path.display());
        let path_str = path
            .to_str()
            .with_context(|| format!("Non UTF-8 video path {}", path.display()))?;

        let cap = VideoCapture::from_file(path_str, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            bail!("Failed to open video file {}", path.display());
        }

        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
        let total_frames = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)? as i64;
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;

        info!(
            "Video properties: {}x{} @ {:.1} FPS, {} frames",
            width, height, fps, total_frames
        );

        Ok(Self {
            name: path.display().to_string(),
            cap,
            fps: if fps > 0.0 { fps } else { 25.0 },
            total_frames,
            next_frame_id: 0,
        })
    }

    pub fn progress(&self) -> f32 {
        if self.total_frames <= 0 {
            return 0.0;
        }
        (self.next_frame_id as f32 / self.total_frames as f32) * 100.0
    }
}

impl FrameSource for VideoFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut mat = Mat::default();
        if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }

        let mut rgb = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
        let data = rgb.data_bytes()?.to_vec();
        let image = RgbImage::from_raw(width, height, data)
            .context("Decoded frame does not match its dimensions")?;

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        let timestamp_ms = frame_id as f64 / self.fps * 1000.0;
        Ok(Some(Frame::new(frame_id, timestamp_ms, image)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
