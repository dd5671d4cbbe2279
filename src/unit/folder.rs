use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Checkpoint, TestUnit, UnitKind};
use crate::config::{Config, SplitNaming};
use crate::error::UnitResult;

/// A directory whose direct image children are the ordered steps of one test
#[derive(Debug, Clone)]
pub struct FolderTest {
    name: String,
    dir: PathBuf,
    images: Vec<PathBuf>,
    config: Arc<Config>,
}

impl FolderTest {
    /// `images` are sorted by file name
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, mut images: Vec<PathBuf>, config: Arc<Config>) -> Self {
        images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Self {
            name: name.into(),
            dir: dir.into(),
            images,
            config,
        }
    }

    pub fn images(&self) -> &[PathBuf] {
        &self.images
    }

    /// One single-step test per image, in image order.
    ///
    /// Each split test is named `<name> - <image file name>`, except that with a
    /// forced name and [`SplitNaming::Shared`] every split test keeps the bare
    /// forced name.
    pub fn split(self) -> Vec<FolderTest> {
        let shared = self.config.forced_name.is_some() && self.config.split_naming == SplitNaming::Shared;
        let Self {
            name,
            dir,
            images,
            config,
        } = self;

        images
            .into_iter()
            .map(|image| {
                let unit_name = if shared {
                    name.clone()
                } else {
                    let file = image
                        .file_name()
                        .map(|f| f.to_string_lossy().to_string())
                        .unwrap_or_default();
                    format!("{} - {}", name, file)
                };
                FolderTest {
                    name: unit_name,
                    dir: dir.clone(),
                    images: vec![image],
                    config: Arc::clone(&config),
                }
            })
            .collect()
    }
}

impl TestUnit for FolderTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.dir
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Folder
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn checkpoints(&self) -> UnitResult<Vec<Checkpoint>> {
        self.images.iter().map(|path| Checkpoint::load(path)).collect()
    }
}
