// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The X11-nested rendering backend for the Vitrine compositor.
//!
//! This backend lets the compositor run as an ordinary client of a host X11
//! server rather than driving the hardware display directly. It negotiates a
//! GPU-backed pixel buffer for each presented window over DRI2, imports that
//! buffer as a renderable image, and copies rendered regions back to the host
//! window, coalescing host-delivered exposure damage into at most one pending
//! repaint per output.
//!
//! The compositor core owns the event loop. It registers the backend's
//! connection with its poller via [`X11Backend::register`], calls
//! [`X11Backend::dispatch`] whenever the connection becomes readable, calls
//! [`X11Backend::present`] once per repaint cycle, and checks
//! [`X11Backend::should_exit`] after each turn.

mod backend;
mod config;
mod core;
mod error;

pub mod dri2;
pub mod host;
pub mod output;
pub mod render;

pub use backend::X11Backend;
pub use config::X11BackendConfig;
pub use core::{CompositorCore, BTN_LEFT};
pub use error::BackendError;

lazy_static::lazy_static! {
    /// Frame timestamps are milliseconds from this process-wide epoch.
    static ref EPOCH: std::time::Instant = std::time::Instant::now();
}
