//! Image Tester - batch visual regression testing of image files and documents.
//!
//! This crate provides:
//! - Suite discovery over a directory tree (folder, single-file and document tests)
//! - A bounded worker pool executing every test unit with its own backend session
//! - PDF / PostScript rasterization through external converters
//! - A local file-system baseline backend
//! - Per-unit outcome aggregation and JSON reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use image_tester::{Config, Executor, LocalBaselineFactory, RunReport, SuiteBuilder};
//!
//! let config = Arc::new(Config::new("MyApp"));
//! let suite = SuiteBuilder::new(Arc::clone(&config)).build(Path::new("./screens")).unwrap();
//! let executor = Executor::new(3, Arc::new(LocalBaselineFactory::new("./baselines")), config).unwrap();
//! let started = chrono::Utc::now();
//! executor.run(suite);
//! RunReport::from_records(executor.results().snapshot(), started).print_table();
//! ```

pub mod backend;
pub mod config;
pub mod convert;
pub mod error;
pub mod executor;
pub mod report;
pub mod suite;
pub mod unit;

#[cfg(test)]
mod test_support;

// Re-export configuration
pub use config::{BackendSettings, BatchInfo, Capabilities, Config, DocumentOptions, MatchLevel, SplitNaming, Viewport};

// Re-export errors
pub use error::{BackendError, ConversionError, DiscoveryError, ExecutorError, UnitError};

// Re-export discovery and execution
pub use executor::{CompletionCallback, Executor};
pub use suite::{DirectoryNode, Suite, SuiteBuilder};
pub use unit::{Checkpoint, DocumentTest, FolderTest, SingleFileTest, TestUnit, UnitKind};

// Re-export backends and converters
pub use backend::{LocalBaselineFactory, SessionFactory, TestIdentity, Verdict, VisualSession};
pub use convert::{DocumentConverter, ExternalConverter, PageSelection, RenderedPage};

// Re-export reporting
pub use report::{ExecutionOutcome, ResultAggregator, RunReport, UnitRecord};
