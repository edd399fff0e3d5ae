//! Whole builds against local git repositories, run on the host.

mod common;

mod build_tests;
mod remote_tests;
mod store_tests;
