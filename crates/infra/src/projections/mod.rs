//! Projection implementations (read model builders).
//!
//! Each projection is a pure fold over the log, run through a
//! `ProjectionRunner`. All projections are:
//! - **Rebuildable**: reconstructed from genesis on registration or demand
//! - **Idempotent**: envelopes at or below a runner's position are skipped

pub mod automation;
pub mod builder;
pub mod performance;
pub mod scenes;
pub mod streaming;

pub use automation::{AutomationProjection, AutomationView, RecentExecution, RuleStats};
pub use builder::{ProjectionBuilder, ProjectionError};
pub use performance::{EventRate, PerformanceProjection, PerformanceView};
pub use scenes::{SceneProjection, SceneView};
pub use streaming::{StreamRun, StreamingProjection, StreamingView};
