use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Checkpoint, TestUnit, UnitKind};
use crate::config::Config;
use crate::convert::DocumentConverter;
use crate::error::UnitResult;

/// A PDF or PostScript document whose rendered pages are the steps of one test.
///
/// Pages are rendered lazily, on the worker that runs the unit.
#[derive(Clone)]
pub struct DocumentTest {
    name: String,
    path: PathBuf,
    config: Arc<Config>,
    converter: Arc<dyn DocumentConverter>,
}

impl DocumentTest {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        config: Arc<Config>,
        converter: Arc<dyn DocumentConverter>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            config,
            converter,
        }
    }
}

impl fmt::Debug for DocumentTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentTest")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TestUnit for DocumentTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Document
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn checkpoints(&self) -> UnitResult<Vec<Checkpoint>> {
        let pages = self.converter.convert(&self.path, &self.config.document)?;
        Ok(pages
            .into_iter()
            .map(|page| Checkpoint {
                step_name: format!("Page {}", page.number),
                image: page.image,
            })
            .collect())
    }
}
