// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

/// The evdev code for the left mouse button. Host buttons are numbered from
/// one, so host button N maps to `BTN_LEFT + N - 1`.
pub const BTN_LEFT: u32 = 0x110;

/// The seam between this backend and the generic compositor core.
///
/// Input notifications carry evdev codes and window-relative coordinates.
/// `schedule_repaint` asks the core to run a repaint cycle through its normal
/// scheduling path (which eventually calls [`crate::X11Backend::present`]);
/// `finish_frame` reports a completed presentation with a monotonic
/// millisecond timestamp.
pub trait CompositorCore {
    fn notify_key(&mut self, key: u32, pressed: bool);
    fn notify_button(&mut self, button: u32, pressed: bool);
    fn notify_motion(&mut self, x: i32, y: i32);
    fn schedule_repaint(&mut self);
    fn finish_frame(&mut self, timestamp_ms: u32);
}
