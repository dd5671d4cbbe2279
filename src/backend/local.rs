//! File-system baseline backend.
//!
//! Baselines are stored as PNG files under a root directory:
//!
//! ```text
//! <root>/<app>/<environment>/<branch>/<test name>/<NNN>_<step>.png
//! ```
//!
//! The first run of a test stores its checkpoints as the baseline. Later runs
//! compare each checkpoint pixel by pixel, with a per-channel tolerance taken
//! from the match level. When the identity ignores displacement, content that
//! only moved by up to [`MAX_DISPLACEMENT`] pixels also matches.

use image::{DynamicImage, ImageFormat, RgbaImage};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::types::{SessionFactory, TestIdentity, Verdict, VisualSession};
use crate::config::Config;
use crate::error::{BackendError, BackendResult};

const DEFAULT_SEGMENT: &str = "default";

/// Largest shift, in pixels along each axis, tolerated when displacement is ignored
pub const MAX_DISPLACEMENT: u32 = 4;

/// Factory for [`LocalSession`]s rooted at one baseline directory
#[derive(Debug, Clone)]
pub struct LocalBaselineFactory {
    baseline_dir: PathBuf,
}

impl LocalBaselineFactory {
    pub fn new(baseline_dir: impl Into<PathBuf>) -> Self {
        Self {
            baseline_dir: baseline_dir.into(),
        }
    }

    pub fn baseline_dir(&self) -> &Path {
        &self.baseline_dir
    }
}

impl SessionFactory for LocalBaselineFactory {
    fn new_session(&self, config: &Config, unit_name: &str) -> BackendResult<Box<dyn VisualSession>> {
        debug!("New local session for '{}'", unit_name);
        Ok(Box::new(LocalSession::new(
            self.baseline_dir.clone(),
            config.backend.auto_save,
        )))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum StepStatus {
    New,
    Matched,
    Mismatch { diff_percent: f64 },
}

#[derive(Debug, Clone)]
struct StepRecord {
    name: String,
    status: StepStatus,
}

/// One test against the local baseline store
#[derive(Debug)]
pub struct LocalSession {
    root: PathBuf,
    auto_save: bool,
    identity: Option<TestIdentity>,
    steps: Vec<StepRecord>,
    closed: bool,
}

impl LocalSession {
    pub fn new(root: PathBuf, auto_save: bool) -> Self {
        Self {
            root,
            auto_save,
            identity: None,
            steps: Vec::new(),
            closed: false,
        }
    }

    fn identity(&self) -> BackendResult<&TestIdentity> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        self.identity.as_ref().ok_or(BackendError::NotOpen)
    }

    fn step_file(index: usize, step_name: &str) -> String {
        format!("{:03}_{}.png", index, encode_component(step_name))
    }

    /// Compare `image` against the stored baseline of the next step
    fn compare_step(&self, image: &DynamicImage, step_name: &str) -> BackendResult<StepStatus> {
        let identity = self.identity()?;
        let file = Self::step_file(self.steps.len(), step_name);
        let own = test_dir(&self.root, identity, identity.branch.as_deref()).join(&file);

        let existing = if own.exists() {
            Some(own.clone())
        } else {
            identity
                .parent_branch
                .as_deref()
                .map(|parent| test_dir(&self.root, identity, Some(parent)).join(&file))
                .filter(|p| p.exists())
        };

        let Some(baseline_path) = existing else {
            write_baseline(&own, image)?;
            info!("Stored new baseline for '{}' step '{}'", identity.test_name, step_name);
            return Ok(StepStatus::New);
        };

        let actual = image.to_rgba8();
        let baseline = image::open(&baseline_path)?.to_rgba8();
        let tolerance = identity.match_level.channel_tolerance();
        let diff_percent = diff_percent(&actual, &baseline, tolerance);
        if diff_percent == 0.0 {
            return Ok(StepStatus::Matched);
        }
        if identity.ignore_displacement {
            if let Some((dx, dy)) = find_displacement(&actual, &baseline, tolerance, MAX_DISPLACEMENT) {
                debug!(
                    "'{}' step '{}' matches its baseline shifted by ({}, {})",
                    identity.test_name, step_name, dx, dy
                );
                return Ok(StepStatus::Matched);
            }
        }

        warn!(
            "Visual difference in '{}' step '{}': {:.2}% pixels differ",
            identity.test_name, step_name, diff_percent
        );
        if self.auto_save {
            write_baseline(&own, image)?;
            info!("Saved new baseline for '{}' step '{}'", identity.test_name, step_name);
        }
        Ok(StepStatus::Mismatch { diff_percent })
    }
}

impl VisualSession for LocalSession {
    fn open(&mut self, identity: TestIdentity) -> BackendResult<()> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        debug!(
            "Opening '{}' ({}) in batch '{}'",
            identity.test_name, identity.viewport, identity.batch.name
        );
        self.identity = Some(identity);
        self.steps.clear();
        Ok(())
    }

    fn check_step(&mut self, image: &DynamicImage, step_name: &str) -> BackendResult<()> {
        let status = self.compare_step(image, step_name)?;
        self.steps.push(StepRecord {
            name: step_name.to_string(),
            status,
        });
        Ok(())
    }

    fn close(&mut self) -> BackendResult<Verdict> {
        self.identity()?;
        self.closed = true;

        let mismatches: Vec<String> = self
            .steps
            .iter()
            .filter_map(|step| match step.status {
                StepStatus::Mismatch { diff_percent } => {
                    Some(format!("'{}' differs by {:.2}%", step.name, diff_percent))
                }
                _ => None,
            })
            .collect();

        if !mismatches.is_empty() {
            return Ok(Verdict::Failed(mismatches.join(", ")));
        }
        if !self.steps.is_empty() && self.steps.iter().all(|s| s.status == StepStatus::New) {
            return Ok(Verdict::NewBaseline);
        }
        Ok(Verdict::Passed)
    }

    fn abort(&mut self) {
        if let Some(identity) = &self.identity {
            debug!("Aborting session for '{}'", identity.test_name);
        }
        self.closed = true;
    }
}

/// Directory holding the baselines of one test on one branch
fn test_dir(root: &Path, identity: &TestIdentity, branch: Option<&str>) -> PathBuf {
    let environment = identity.baseline_env_name.clone().unwrap_or_else(|| {
        match (&identity.host_os, &identity.host_app) {
            (None, None) => DEFAULT_SEGMENT.to_string(),
            (os, app) => format!(
                "{}_{}",
                os.as_deref().unwrap_or("any"),
                app.as_deref().unwrap_or("any")
            ),
        }
    });

    let mut dir = root
        .join(encode_component(&identity.app_name))
        .join(encode_component(&environment))
        .join(encode_component(branch.unwrap_or(DEFAULT_SEGMENT)));
    for component in identity.test_name.split('/') {
        dir.push(encode_component(component));
    }
    dir
}

/// Write `image` to `path` through a temp file and rename
fn write_baseline(path: &Path, image: &DynamicImage) -> BackendResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| BackendError::Unavailable(format!("invalid baseline path {}", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    image.write_to(tmp.as_file_mut(), ImageFormat::Png)?;
    tmp.persist(path).map_err(|e| BackendError::Io(e.error))?;
    Ok(())
}

/// Percentage of pixels whose channels differ by more than `tolerance`.
///
/// Images of different dimensions differ completely.
pub fn diff_percent(actual: &RgbaImage, baseline: &RgbaImage, tolerance: u8) -> f64 {
    if actual.dimensions() != baseline.dimensions() {
        return 100.0;
    }
    if hash_pixels(actual) == hash_pixels(baseline) {
        return 0.0;
    }

    let (width, height) = actual.dimensions();
    let total = u64::from(width) * u64::from(height);
    if total == 0 {
        return 0.0;
    }

    let differing = actual
        .pixels()
        .zip(baseline.pixels())
        .filter(|(a, b)| {
            a.0.iter()
                .zip(b.0.iter())
                .any(|(x, y)| x.abs_diff(*y) > tolerance)
        })
        .count() as u64;

    (differing as f64 / total as f64) * 100.0
}

/// Smallest shift `(dx, dy)` within `max_shift` under which every overlapping
/// pixel of `actual` matches `baseline[x - dx, y - dy]`.
///
/// Only images of equal dimensions, larger than the shift, are considered.
pub fn find_displacement(actual: &RgbaImage, baseline: &RgbaImage, tolerance: u8, max_shift: u32) -> Option<(i64, i64)> {
    if actual.dimensions() != baseline.dimensions() {
        return None;
    }
    let (width, height) = actual.dimensions();
    if width <= max_shift || height <= max_shift {
        return None;
    }

    let max = i64::from(max_shift);
    let mut shifts: Vec<(i64, i64)> = (-max..=max)
        .flat_map(|dx| (-max..=max).map(move |dy| (dx, dy)))
        .filter(|&shift| shift != (0, 0))
        .collect();
    shifts.sort_by_key(|(dx, dy)| dx.abs() + dy.abs());

    let (w, h) = (i64::from(width), i64::from(height));
    shifts.into_iter().find(|&(dx, dy)| {
        let xs = dx.max(0)..(w + dx.min(0));
        let ys = dy.max(0)..(h + dy.min(0));
        ys.clone().all(|y| {
            xs.clone().all(|x| {
                let a = actual.get_pixel(x as u32, y as u32);
                let b = baseline.get_pixel((x - dx) as u32, (y - dy) as u32);
                a.0.iter().zip(b.0.iter()).all(|(p, q)| p.abs_diff(*q) <= tolerance)
            })
        })
    })
}

fn hash_pixels(image: &RgbaImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.as_raw());
    hex::encode(hasher.finalize())
}

/// Encode a name as a single path component.
///
/// ASCII letters, digits, `-` and `_` are kept; every other byte becomes
/// `%XX`, and the empty name becomes `%`. Distinct names never share a
/// component.
pub fn encode_component(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
