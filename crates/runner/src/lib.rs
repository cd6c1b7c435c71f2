// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Isolated workflow executor library.
//!
//! The embedding application builds its own runner binary: link this
//! crate, register the same workflow definitions and plugins the parent
//! registers, and hand the setup to [`run`]. The shipped
//! `dl-workflow-runner` binary is the bare template with nothing
//! registered.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod bootstrap;

pub use bootstrap::{
    read_stdin_config, run, run_with_config, BootstrapConfig, BootstrapError, Plugin, PluginRef,
    RunnerSetup,
};
