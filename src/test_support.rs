// Shared fixtures for unit tests

use image::{DynamicImage, Rgba, RgbaImage};
use std::path::{Path, PathBuf};

use crate::backend::{TestIdentity, Verdict, VisualSession};
use crate::error::{BackendError, BackendResult};

/// Session that records what it was given and returns a fixed verdict
pub struct RecordingSession {
    pub identity: Option<TestIdentity>,
    pub steps: Vec<String>,
    pub closed: bool,
    pub aborted: bool,
    verdict: Verdict,
}

impl RecordingSession {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            identity: None,
            steps: Vec::new(),
            closed: false,
            aborted: false,
            verdict,
        }
    }
}

impl VisualSession for RecordingSession {
    fn open(&mut self, identity: TestIdentity) -> BackendResult<()> {
        self.identity = Some(identity);
        Ok(())
    }

    fn check_step(&mut self, _image: &DynamicImage, step_name: &str) -> BackendResult<()> {
        if self.identity.is_none() {
            return Err(BackendError::NotOpen);
        }
        self.steps.push(step_name.to_string());
        Ok(())
    }

    fn close(&mut self) -> BackendResult<Verdict> {
        self.closed = true;
        Ok(self.verdict.clone())
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}

/// Write a solid `width` x `height` PNG, creating parent directories
pub fn write_png(path: &Path, width: u32, height: u32) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    RgbaImage::from_pixel(width, height, Rgba([40, 80, 120, 255]))
        .save(path)
        .unwrap();
    path.to_path_buf()
}
