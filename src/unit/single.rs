use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Checkpoint, TestUnit, UnitKind};
use crate::config::Config;
use crate::error::UnitResult;

/// One image file tested on its own
#[derive(Debug, Clone)]
pub struct SingleFileTest {
    name: String,
    path: PathBuf,
    config: Arc<Config>,
}

impl SingleFileTest {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, config: Arc<Config>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            config,
        }
    }
}

impl TestUnit for SingleFileTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> UnitKind {
        UnitKind::SingleFile
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn checkpoints(&self) -> UnitResult<Vec<Checkpoint>> {
        Ok(vec![Checkpoint::load(&self.path)?])
    }
}
