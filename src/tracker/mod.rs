pub mod git;

pub use git::{ChangeType, CommitInfo, FileDiff, GitTracker};
