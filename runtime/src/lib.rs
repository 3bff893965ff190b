// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Harvest runtime library: resilient browser automation that collects
//! clinician productivity rows from a report viewer and reconciles them
//! into a store.
//!
//! This library crate exposes the core modules for integration testing.

#![allow(clippy::new_without_default, clippy::should_implement_trait)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod harvest;
pub mod maintenance;
pub mod model;
pub mod renderer;
pub mod session;
pub mod shutdown;
pub mod store;
