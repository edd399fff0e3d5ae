//! ybd-lib: build engine for Baserock-style definitions
//!
//! The pieces, in the order a run uses them:
//! - `Definitions`: every component of a definitions tree, normalised
//! - `CacheKeys`: content-addressed keys for a target and everything it needs
//! - `Assembler`: composes artifacts depth-first in sandboxes, sharing work
//!   between instances through per-key locks
//! - `Store`: the local artifact cache, with optional remote (KBAS) exchange

pub mod arch;
pub mod assembly;
pub mod cache_key;
pub mod config;
pub mod consts;
pub mod defaults;
pub mod definitions;
pub mod remote;
pub mod repos;
pub mod run;
pub mod run_lock;
pub mod sandbox;
pub mod splitting;
pub mod store;
pub mod util;
