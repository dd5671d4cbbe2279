//! Test units: the independently executed pieces of a suite.
//!
//! A unit enumerates its checkpoints (ordered images) and submits them, in
//! order, to the one session it is given:
//! - [`FolderTest`] - the images directly inside a directory, one step each
//! - [`SingleFileTest`] - one image file
//! - [`DocumentTest`] - the rendered pages of a PDF or PostScript document

pub mod document;
pub mod folder;
pub mod single;

pub use document::DocumentTest;
pub use folder::FolderTest;
pub use single::SingleFileTest;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

use crate::backend::{TestIdentity, Verdict, VisualSession};
use crate::config::{Config, Viewport};
use crate::convert::DocumentFormat;
use crate::error::{UnitError, UnitResult};
use crate::report::ExecutionOutcome;

/// Extensions of files treated as checkpoint images
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff"];

/// How a file participates in discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Document,
    Other,
}

impl FileKind {
    pub fn of(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        match ext {
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => FileKind::Image,
            _ if DocumentFormat::from_path(path).is_some() => FileKind::Document,
            _ => FileKind::Other,
        }
    }
}

/// Variant of a unit, for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Folder,
    SingleFile,
    Document,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Folder => write!(f, "folder"),
            UnitKind::SingleFile => write!(f, "file"),
            UnitKind::Document => write!(f, "document"),
        }
    }
}

/// One named image submitted as a step of a test
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub step_name: String,
    pub image: DynamicImage,
}

impl Checkpoint {
    /// Load an image file; the step is named after the file stem
    pub fn load(path: &Path) -> UnitResult<Self> {
        let image = image::open(path).map_err(|source| UnitError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        let step_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self { step_name, image })
    }
}

/// Unit of execution.
///
/// A unit is consumed by exactly one worker, and its checkpoints are always
/// submitted sequentially to that worker's session.
pub trait TestUnit: Send {
    /// Effective test name, the baseline key together with the batch
    fn name(&self) -> &str;

    /// File or directory backing the unit
    fn path(&self) -> &Path;

    fn kind(&self) -> UnitKind;

    fn config(&self) -> &Config;

    /// Ordered checkpoints of this unit
    fn checkpoints(&self) -> UnitResult<Vec<Checkpoint>>;

    /// Submit every checkpoint to `session` and close it.
    ///
    /// Errors are converted into an `Errored` outcome and the session is
    /// aborted; nothing propagates past this boundary.
    fn run(&self, session: &mut dyn VisualSession) -> ExecutionOutcome {
        match submit(self.name(), self.config(), self.checkpoints(), session) {
            Ok(verdict) => ExecutionOutcome::from(verdict),
            Err(e) => {
                warn!("{} '{}' errored: {}", self.kind(), self.name(), e);
                session.abort();
                ExecutionOutcome::Errored(e.to_string())
            }
        }
    }
}

fn submit(
    name: &str,
    config: &Config,
    checkpoints: UnitResult<Vec<Checkpoint>>,
    session: &mut dyn VisualSession,
) -> UnitResult<Verdict> {
    let checkpoints = checkpoints?;
    let first = checkpoints.first().ok_or(UnitError::NoCheckpoints)?;
    let viewport = config
        .viewport
        .unwrap_or_else(|| Viewport::new(first.image.width(), first.image.height()));

    session.open(TestIdentity::new(config, name, viewport))?;
    for checkpoint in &checkpoints {
        debug!("'{}' step '{}'", name, checkpoint.step_name);
        session.check_step(&checkpoint.image, &checkpoint.step_name)?;
    }
    Ok(session.close()?)
}
