//! Constants shared across the crate.

/// 2011-11-11 11:11:11 UTC, stamped on every checked-out and archived file.
pub const MAGIC_TIMESTAMP: i64 = 1_321_009_871;

/// Directory inside every installed artifact that holds `.meta` files.
pub const METADATA_DIR: &str = "baserock";

/// Name of the tree cache written under the artifacts root.
pub const TREES_FILE: &str = ".trees";

/// Fixed user name exported to every build.
pub const BUILD_USER: &str = "tomjon";

/// Number of log lines replayed when a build command fails.
pub const LOG_TAIL_LINES: usize = 200;
