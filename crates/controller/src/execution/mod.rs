//! Execution engine: Tekton run submission, status watching, and log relay.

pub mod logs;
pub mod submitter;
pub mod watcher;

pub use logs::{BuildLogSink, LogRelay};
pub use submitter::{RunSubmitter, SubmittedRun};
pub use watcher::{CallbackRegistry, StatusCallback, StatusWatcher, Subscription};
