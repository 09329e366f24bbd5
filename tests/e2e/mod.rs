//! End-to-end tests for saorsa-warden.
//!
//! These tests stand up a local release server and a scratch managed
//! executable, then drive a real warden against them.

#![cfg(unix)]

mod harness;
mod update_cycle;

pub use harness::{HarnessError, TestHarness};
