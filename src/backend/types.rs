// Contract between test units and the visual comparison backend

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::config::{BatchInfo, Config, MatchLevel, Viewport};
use crate::error::BackendResult;

/// Everything the backend needs to find the baseline of one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestIdentity {
    pub app_name: String,
    pub test_name: String,
    pub batch: BatchInfo,
    pub viewport: Viewport,
    pub match_level: MatchLevel,
    pub ignore_displacement: bool,
    pub branch: Option<String>,
    pub parent_branch: Option<String>,
    pub baseline_env_name: Option<String>,
    pub host_os: Option<String>,
    pub host_app: Option<String>,
    /// Machine the run executes on
    pub host_name: Option<String>,
}

impl TestIdentity {
    /// Build the identity of `test_name` from the run configuration
    pub fn new(config: &Config, test_name: &str, viewport: Viewport) -> Self {
        Self {
            app_name: config.app_name.clone(),
            test_name: test_name.to_string(),
            batch: config.batch_for(test_name),
            viewport,
            match_level: config.backend.match_level,
            ignore_displacement: config.backend.ignore_displacement,
            branch: config.backend.branch.clone(),
            parent_branch: config.backend.parent_branch.clone(),
            baseline_env_name: config.backend.baseline_env_name.clone(),
            host_os: config.backend.host_os.clone(),
            host_app: config.backend.host_app.clone(),
            host_name: hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().to_string()),
        }
    }
}

/// Result of closing a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Passed,
    /// At least one step differs from its baseline
    Failed(String),
    /// No baseline existed; this run's images became the baseline
    NewBaseline,
}

/// One open visual test, from open to close.
///
/// A session holds the ordered steps of exactly one test and is never shared
/// between units.
pub trait VisualSession: Send {
    /// Start the test identified by `identity`
    fn open(&mut self, identity: TestIdentity) -> BackendResult<()>;

    /// Submit the next checkpoint of the test
    fn check_step(&mut self, image: &DynamicImage, step_name: &str) -> BackendResult<()>;

    /// Finish the test and obtain its verdict
    fn close(&mut self) -> BackendResult<Verdict>;

    /// Release the session without a verdict, after a failure
    fn abort(&mut self);
}

/// Builds a fresh session for every unit.
///
/// Implementations must not hand out the same session twice; `new_session` may
/// be called concurrently from every worker.
pub trait SessionFactory: Send + Sync {
    fn new_session(&self, config: &Config, unit_name: &str) -> BackendResult<Box<dyn VisualSession>>;
}
