//! Run configuration with environment variable support.
//!
//! A [`Config`] is built once per run (by the CLI or programmatically through
//! its builder methods), wrapped in an `Arc`, and only read afterwards. Every
//! component of the run sees the same snapshot.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `IMAGE_TESTER_APP_NAME` | Application name reported to the backend | `ImageTester` |
//! | `IMAGE_TESTER_THREADS` | Worker pool size | `3` |
//! | `IMAGE_TESTER_BASELINE_DIR` | Root of the local baseline store | `./baselines` |
//! | `IMAGE_TESTER_DPI` | Document conversion resolution | `250` |
//! | `JOB_NAME` + `IMAGE_TESTER_BATCH_ID` | CI flat batch (both must be set) | unset |

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Default Values
// ============================================================================

/// Default application name
pub const DEFAULT_APP_NAME: &str = "ImageTester";

/// Default worker pool size
pub const DEFAULT_THREADS: usize = 3;

/// Default document conversion resolution (dots per inch)
pub const DEFAULT_DPI: f32 = 250.0;

/// Default local baseline directory
pub const DEFAULT_BASELINE_DIR: &str = "./baselines";

// ============================================================================
// Environment Variable Names
// ============================================================================

/// Environment variable for the application name
pub const ENV_APP_NAME: &str = "IMAGE_TESTER_APP_NAME";

/// Environment variable for the worker pool size
pub const ENV_THREADS: &str = "IMAGE_TESTER_THREADS";

/// Environment variable for the baseline directory
pub const ENV_BASELINE_DIR: &str = "IMAGE_TESTER_BASELINE_DIR";

/// Environment variable for the conversion DPI
pub const ENV_DPI: &str = "IMAGE_TESTER_DPI";

/// CI job name, used as the flat batch name
pub const ENV_CI_JOB_NAME: &str = "JOB_NAME";

/// CI batch id, used as the flat batch id
pub const ENV_CI_BATCH_ID: &str = "IMAGE_TESTER_BATCH_ID";

// ============================================================================
// Value types
// ============================================================================

/// Fixed viewport size declared for every test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Viewport {
    type Err = String;

    /// Parses `WxH`, e.g. `1000x600`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(['x', 'X']).collect();
        if parts.len() != 2 {
            return Err(format!("invalid viewport '{}', expected <width>x<height>", s));
        }
        let width: u32 = parts[0]
            .parse()
            .map_err(|_| format!("invalid viewport width in '{}'", s))?;
        let height: u32 = parts[1]
            .parse()
            .map_err(|_| format!("invalid viewport height in '{}'", s))?;
        if width == 0 || height == 0 {
            return Err(format!("viewport '{}' must be non-empty", s));
        }
        Ok(Self { width, height })
    }
}

/// Batch a test result is grouped under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub name: String,
    pub id: Option<String>,
}

impl BatchInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Flat batch from the CI environment, when both the job name and the
    /// batch id are present and non-empty
    pub fn from_ci_env() -> Option<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`BatchInfo::from_ci_env`], reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let job = lookup(ENV_CI_JOB_NAME).filter(|s| !s.is_empty())?;
        let id = lookup(ENV_CI_BATCH_ID).filter(|s| !s.is_empty())?;
        Some(Self::new(job).with_id(id))
    }
}

/// How strictly the backend compares a checkpoint with its baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MatchLevel {
    Exact,
    #[default]
    Strict,
    Content,
    Layout,
}

impl MatchLevel {
    /// Allowed per-channel difference before a pixel counts as changed
    pub fn channel_tolerance(self) -> u8 {
        match self {
            MatchLevel::Exact => 0,
            MatchLevel::Strict => 5,
            MatchLevel::Content => 24,
            MatchLevel::Layout => 64,
        }
    }
}

/// Naming of split units when a forced name is also set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SplitNaming {
    /// `<forced name> - <image file name>` per split unit
    #[default]
    Suffixed,
    /// Every split unit keeps the bare forced name
    Shared,
}

/// Document rasterization parameters, only read by document tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentOptions {
    pub dpi: f32,
    pub password: Option<String>,
    /// Page selection expression such as `1,3-5`
    pub pages: Option<String>,
    pub include_page_numbers: bool,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            dpi: DEFAULT_DPI,
            password: None,
            pages: None,
            include_page_numbers: false,
        }
    }
}

/// Identity and behavior settings passed through to the comparison backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    pub match_level: MatchLevel,
    pub branch: Option<String>,
    pub parent_branch: Option<String>,
    pub baseline_env_name: Option<String>,
    pub host_os: Option<String>,
    pub host_app: Option<String>,
    /// Overwrite mismatching baselines with the new image
    pub auto_save: bool,
    /// Accept a checkpoint whose content only moved by a few pixels
    pub ignore_displacement: bool,
}

/// Features probed once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Document converter tooling is installed
    pub document_conversion: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            document_conversion: true,
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Immutable per-run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub app_name: String,
    /// When unset, the first checkpoint's size is used
    pub viewport: Option<Viewport>,
    /// Overrides path-derived test names
    pub forced_name: Option<String>,
    pub split_steps: bool,
    pub split_naming: SplitNaming,
    /// Groups every unit of the run under one batch
    pub flat_batch: Option<BatchInfo>,
    pub document: DocumentOptions,
    pub backend: BackendSettings,
    pub capabilities: Capabilities,
}

impl Config {
    /// Create a configuration with defaults and the given application name
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            viewport: None,
            forced_name: None,
            split_steps: false,
            split_naming: SplitNaming::default(),
            flat_batch: None,
            document: DocumentOptions::default(),
            backend: BackendSettings::default(),
            capabilities: Capabilities::default(),
        }
    }

    pub fn viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = Some(viewport);
        self
    }

    pub fn forced_name(mut self, name: impl Into<String>) -> Self {
        self.forced_name = Some(name.into());
        self
    }

    pub fn split_steps(mut self, split: bool) -> Self {
        self.split_steps = split;
        self
    }

    pub fn split_naming(mut self, naming: SplitNaming) -> Self {
        self.split_naming = naming;
        self
    }

    pub fn flat_batch(mut self, batch: BatchInfo) -> Self {
        self.flat_batch = Some(batch);
        self
    }

    pub fn document(mut self, document: DocumentOptions) -> Self {
        self.document = document;
        self
    }

    pub fn backend(mut self, backend: BackendSettings) -> Self {
        self.backend = backend;
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Batch a unit named `unit_name` reports under
    pub fn batch_for(&self, unit_name: &str) -> BatchInfo {
        self.flat_batch
            .clone()
            .unwrap_or_else(|| BatchInfo::new(unit_name))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_APP_NAME)
    }
}
