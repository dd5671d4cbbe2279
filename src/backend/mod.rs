pub mod local;
pub mod types;

pub use local::{LocalBaselineFactory, LocalSession};
pub use types::{SessionFactory, TestIdentity, Verdict, VisualSession};
