//! Monitoring Module
//!
//! Observers that turn a run's event stream into reports.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Node start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{ExecutionTimeline, Mark, TimelineEntry};
