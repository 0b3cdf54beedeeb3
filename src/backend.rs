// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The backend proper: output creation, event dispatch, and presentation.

use std::sync::Arc;

use mio::unix::SourceFd;
use tracing::{debug, info, trace, warn};
use x11rb::{
    connection::Connection as _,
    properties::WmSizeHints,
    protocol,
    protocol::{
        dri2::{self as dri2_proto, ConnectionExt as _},
        xfixes::ConnectionExt as _,
        xproto::{self, ConnectionExt as _},
    },
    wrapper::ConnectionExt as _,
};

use crate::{
    config::X11BackendConfig,
    core::{CompositorCore, BTN_LEFT},
    dri2::{self, Dri2Version, GpuDevice},
    error::BackendError,
    host::{Atoms, HostConnection},
    output::{CopyScope, DamageRecord, Output},
    render::RenderContext,
    EPOCH,
};

/// Host keycodes are offset from evdev scancodes by the legacy minimum
/// keycode.
const KEYCODE_OFFSET: u8 = 8;

fn output_event_mask() -> xproto::EventMask {
    xproto::EventMask::KEY_PRESS
        | xproto::EventMask::KEY_RELEASE
        | xproto::EventMask::BUTTON_PRESS
        | xproto::EventMask::BUTTON_RELEASE
        | xproto::EventMask::POINTER_MOTION
        | xproto::EventMask::EXPOSURE
        | xproto::EventMask::STRUCTURE_NOTIFY
        | xproto::EventMask::ENTER_WINDOW
        | xproto::EventMask::LEAVE_WINDOW
}

/// A nested backend presenting compositor output as windows on a host X11
/// server.
///
/// All state is owned by one thread. Dispatch and presentation never run
/// concurrently; the owning event loop is the sole scheduler.
pub struct X11Backend<C> {
    host: HostConnection,
    gpu: GpuDevice,
    render: Arc<RenderContext>,

    dri2_version: Dri2Version,
    driver: String,

    outputs: Vec<Output>,
    repaints: RepaintQueue,
    focused: bool,
    shutdown: bool,
    title: String,

    core: C,
}

impl<C: CompositorCore> X11Backend<C> {
    /// Brings up the backend: host connection, DRI2 handshake, vulkan
    /// context, and the initial output. Every step is fatal on failure.
    pub fn new(config: X11BackendConfig, core: C) -> Result<Self, BackendError> {
        let host = HostConnection::connect(config.display.as_deref())?;

        let dri2_version = dri2::query_capabilities(&host.conn)?;
        let driver = dri2::connect(&host.conn, host.screen.root)?;
        let gpu = GpuDevice::open(&driver.device_path)?;
        dri2::authenticate(&host.conn, host.screen.root, &gpu)?;

        let render = RenderContext::new(&gpu)?;

        let mut backend = Self {
            host,
            gpu,
            render,
            dri2_version,
            driver: driver.driver,
            outputs: Vec::new(),
            repaints: RepaintQueue::default(),
            focused: false,
            shutdown: false,
            title: config.title,
            core,
        };

        backend.create_output(config.width, config.height)?;
        Ok(backend)
    }

    /// Creates and maps a host window of exactly the requested size and
    /// binds a negotiated back buffer to it.
    pub fn create_output(&mut self, width: u16, height: u16) -> Result<(), BackendError> {
        let output = self
            .setup_output(width, height)
            .map_err(|err| BackendError::OutputCreation(Box::new(err)))?;

        info!(
            window = output.window,
            width, height, "created output window"
        );

        self.outputs.push(output);
        Ok(())
    }

    fn setup_output(&self, width: u16, height: u16) -> Result<Output, BackendError> {
        let conn = &self.host.conn;
        let screen = &self.host.screen;
        let atoms = &self.host.atoms;

        let window = conn.generate_id()?;
        let aux = xproto::CreateWindowAux::new()
            .event_mask(output_event_mask())
            .cursor(self.host.blank_cursor);

        conn.create_window(
            screen.root_depth,
            window,
            screen.root,
            0,
            0,
            width,
            height,
            0,
            xproto::WindowClass::INPUT_OUTPUT,
            screen.root_visual,
            &aux,
        )?;

        // The window must not resize out from under the negotiated buffer.
        let mut hints = WmSizeHints::new();
        hints.min_size = Some((i32::from(width), i32::from(height)));
        hints.max_size = Some((i32::from(width), i32::from(height)));
        hints.set_normal_hints(conn, window)?;

        conn.change_property8(
            xproto::PropMode::REPLACE,
            window,
            atoms._NET_WM_NAME,
            atoms.UTF8_STRING,
            self.title.as_bytes(),
        )?;
        conn.change_property32(
            xproto::PropMode::REPLACE,
            window,
            atoms.WM_PROTOCOLS,
            xproto::AtomEnum::ATOM,
            &[atoms.WM_DELETE_WINDOW],
        )?;

        let region = conn.generate_id()?;
        conn.xfixes_create_region(
            region,
            &[xproto::Rectangle {
                x: 0,
                y: 0,
                width,
                height,
            }],
        )?;

        conn.dri2_create_drawable(window)?;
        conn.map_window(window)?;

        let reply =
            dri2::request_buffers(conn, window, &[dri2_proto::Attachment::BUFFER_BACK_LEFT])?;
        validate_buffer_geometry((width, height), (reply.width, reply.height))?;

        let target = self
            .render
            .import_buffer(&self.gpu, &reply.buffers[0], width, height)?;

        conn.flush()?;

        Ok(Output {
            window,
            region,
            width,
            height,
            target,
            damage: DamageRecord::default(),
        })
    }

    /// Drains all buffered host events, then runs any repaints the drained
    /// events armed. Never blocks waiting for more events.
    pub fn dispatch(&mut self) -> Result<(), BackendError> {
        while let Some(event) = self.host.poll_event()? {
            match translate_event(&self.host.atoms, &event) {
                HostEvent::Key { key, pressed } => self.core.notify_key(key, pressed),
                HostEvent::Button { button, pressed } => self.core.notify_button(button, pressed),
                HostEvent::Motion { x, y } => self.core.notify_motion(x, y),
                HostEvent::Damage { window, rect } => self.record_damage(window, rect),
                HostEvent::Focus(entered) => {
                    apply_focus(&mut self.focused, &mut self.core, entered)
                }
                HostEvent::Close => {
                    info!("host requested close");
                    self.shutdown = true;
                }
                HostEvent::Ignored => trace!("ignoring host event"),
            }
        }

        self.run_idle_repaints()?;
        self.host.conn.flush()?;
        Ok(())
    }

    fn record_damage(&mut self, window: xproto::Window, rect: xproto::Rectangle) {
        let Some(output) = self.outputs.iter_mut().find(|o| o.window == window) else {
            // Host window lifecycles can race with teardown.
            warn!(window, "damage for unknown window, ignoring");
            return;
        };

        let was_empty = output.damage.is_empty();
        output.damage.record(rect);

        if was_empty {
            self.repaints.arm(window);
        }
    }

    /// Runs each armed repaint: builds a copy region from the accumulated
    /// damage (or the whole window, past capacity) and copies back to front.
    fn run_idle_repaints(&mut self) -> Result<(), BackendError> {
        for window in self.repaints.drain() {
            let Some(output) = self.outputs.iter_mut().find(|o| o.window == window) else {
                continue;
            };

            // A present() may have gotten there first.
            if output.damage.is_empty() {
                continue;
            }

            let conn = &self.host.conn;
            trace!(window, rects = output.damage.count(), "idle repaint");

            let copy = match output.damage.scope() {
                CopyScope::Whole => dri2::copy_region(
                    conn,
                    window,
                    output.region,
                    dri2_proto::Attachment::BUFFER_FRONT_LEFT,
                    dri2_proto::Attachment::BUFFER_BACK_LEFT,
                )?,
                CopyScope::Precise(rects) => {
                    let region = conn.generate_id()?;
                    conn.xfixes_create_region(region, rects)?;

                    let copy = dri2::copy_region(
                        conn,
                        window,
                        region,
                        dri2_proto::Attachment::BUFFER_FRONT_LEFT,
                        dri2_proto::Attachment::BUFFER_BACK_LEFT,
                    )?;

                    conn.xfixes_destroy_region(region)?;
                    copy
                }
            };

            copy.retire();
            output.damage.clear();
        }

        Ok(())
    }

    /// Presents a full compositor frame: waits out pending rendering, then
    /// copies every output's whole region back to front, unconditionally.
    pub fn present(&mut self) -> Result<(), BackendError> {
        self.render.flush()?;

        for output in &mut self.outputs {
            let copy = dri2::copy_region(
                &self.host.conn,
                output.window,
                output.region,
                dri2_proto::Attachment::BUFFER_FRONT_LEFT,
                dri2_proto::Attachment::BUFFER_BACK_LEFT,
            )?;

            copy.retire();
            output.damage.clear();
        }

        self.host.conn.flush()?;

        let timestamp = EPOCH.elapsed().as_millis() as u32;
        self.core.finish_frame(timestamp);

        debug!(timestamp, outputs = self.outputs.len(), "presented frame");
        Ok(())
    }

    /// Set once the host delivers a close request; checked by the owning
    /// loop after each dispatch turn.
    pub fn should_exit(&self) -> bool {
        self.shutdown
    }

    pub fn focused(&self) -> bool {
        self.focused
    }

    pub fn dri2_version(&self) -> Dri2Version {
        self.dri2_version
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Registers the host connection with the compositor's poller. Dispatch
    /// should run whenever the fd becomes readable.
    pub fn register(&self, registry: &mio::Registry, token: mio::Token) -> std::io::Result<()> {
        let fd = self.host.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, mio::Interest::READABLE)
    }
}

/// A host event reduced to what the backend acts on.
#[derive(Debug, Clone, Copy)]
pub enum HostEvent {
    Key { key: u32, pressed: bool },
    Button { button: u32, pressed: bool },
    Motion { x: i32, y: i32 },
    Damage { window: xproto::Window, rect: xproto::Rectangle },
    Focus(bool),
    Close,
    Ignored,
}

impl PartialEq for HostEvent {
    fn eq(&self, other: &Self) -> bool {
        use crate::output::rect_fields;

        match (self, other) {
            (
                Self::Key { key, pressed },
                Self::Key {
                    key: other_key,
                    pressed: other_pressed,
                },
            ) => key == other_key && pressed == other_pressed,
            (
                Self::Button { button, pressed },
                Self::Button {
                    button: other_button,
                    pressed: other_pressed,
                },
            ) => button == other_button && pressed == other_pressed,
            (
                Self::Motion { x, y },
                Self::Motion {
                    x: other_x,
                    y: other_y,
                },
            ) => x == other_x && y == other_y,
            (
                Self::Damage { window, rect },
                Self::Damage {
                    window: other_window,
                    rect: other_rect,
                },
            ) => window == other_window && rect_fields(rect) == rect_fields(other_rect),
            (Self::Focus(entered), Self::Focus(other_entered)) => entered == other_entered,
            (Self::Close, Self::Close) => true,
            (Self::Ignored, Self::Ignored) => true,
            _ => false,
        }
    }
}

impl Eq for HostEvent {}

/// Maps a raw host event onto [`HostEvent`]. Unknown event kinds are a
/// no-op branch, not an error.
pub fn translate_event(atoms: &Atoms, event: &protocol::Event) -> HostEvent {
    match event {
        protocol::Event::KeyPress(e) => HostEvent::Key {
            key: u32::from(e.detail.saturating_sub(KEYCODE_OFFSET)),
            pressed: true,
        },
        protocol::Event::KeyRelease(e) => HostEvent::Key {
            key: u32::from(e.detail.saturating_sub(KEYCODE_OFFSET)),
            pressed: false,
        },
        protocol::Event::ButtonPress(e) => HostEvent::Button {
            button: BTN_LEFT + u32::from(e.detail) - 1,
            pressed: true,
        },
        protocol::Event::ButtonRelease(e) => HostEvent::Button {
            button: BTN_LEFT + u32::from(e.detail) - 1,
            pressed: false,
        },
        protocol::Event::MotionNotify(e) => HostEvent::Motion {
            x: i32::from(e.event_x),
            y: i32::from(e.event_y),
        },
        protocol::Event::Expose(e) => HostEvent::Damage {
            window: e.window,
            rect: xproto::Rectangle {
                x: e.x as i16,
                y: e.y as i16,
                width: e.width,
                height: e.height,
            },
        },
        protocol::Event::EnterNotify(_) => HostEvent::Focus(true),
        protocol::Event::LeaveNotify(_) => HostEvent::Focus(false),
        protocol::Event::ClientMessage(e) => {
            if e.data.as_data32()[0] == atoms.WM_DELETE_WINDOW {
                HostEvent::Close
            } else {
                HostEvent::Ignored
            }
        }
        _ => HostEvent::Ignored,
    }
}

/// Windows with a repaint armed but not yet run. Arming is idempotent: any
/// number of damage notifications before the repaint runs produce one entry.
#[derive(Debug, Default)]
struct RepaintQueue {
    windows: Vec<xproto::Window>,
}

impl RepaintQueue {
    fn arm(&mut self, window: xproto::Window) -> bool {
        if self.windows.contains(&window) {
            return false;
        }

        self.windows.push(window);
        true
    }

    fn drain(&mut self) -> Vec<xproto::Window> {
        std::mem::take(&mut self.windows)
    }
}

/// Focus changes always schedule a repaint, regardless of the prior state.
fn apply_focus<C: CompositorCore>(focused: &mut bool, core: &mut C, entered: bool) {
    *focused = entered;
    core.schedule_repaint();
}

fn validate_buffer_geometry(
    requested: (u16, u16),
    returned: (u32, u32),
) -> Result<(), BackendError> {
    let (width, height) = requested;
    if returned != (u32::from(width), u32::from(height)) {
        return Err(BackendError::BufferNegotiation(format!(
            "negotiated buffer is {}x{}, window is {width}x{height}",
            returned.0, returned.1,
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::{assert_eq, assert_ne};

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingCore {
        keys: Vec<(u32, bool)>,
        buttons: Vec<(u32, bool)>,
        motions: Vec<(i32, i32)>,
        repaints: usize,
        frames: Vec<u32>,
    }

    impl CompositorCore for RecordingCore {
        fn notify_key(&mut self, key: u32, pressed: bool) {
            self.keys.push((key, pressed));
        }

        fn notify_button(&mut self, button: u32, pressed: bool) {
            self.buttons.push((button, pressed));
        }

        fn notify_motion(&mut self, x: i32, y: i32) {
            self.motions.push((x, y));
        }

        fn schedule_repaint(&mut self) {
            self.repaints += 1;
        }

        fn finish_frame(&mut self, timestamp_ms: u32) {
            self.frames.push(timestamp_ms);
        }
    }

    fn test_atoms() -> Atoms {
        Atoms {
            WM_PROTOCOLS: 100,
            WM_NORMAL_HINTS: 101,
            WM_SIZE_HINTS: 102,
            WM_DELETE_WINDOW: 103,
            _NET_WM_NAME: 104,
            UTF8_STRING: 105,
        }
    }

    fn key_event(detail: u8) -> xproto::KeyPressEvent {
        xproto::KeyPressEvent {
            response_type: xproto::KEY_PRESS_EVENT,
            detail,
            sequence: 0,
            time: 0,
            root: 1,
            event: 2,
            child: x11rb::NONE,
            root_x: 0,
            root_y: 0,
            event_x: 0,
            event_y: 0,
            state: xproto::KeyButMask::from(0u16),
            same_screen: true,
        }
    }

    fn key_press(detail: u8) -> protocol::Event {
        protocol::Event::KeyPress(key_event(detail))
    }

    fn button_press(detail: u8) -> protocol::Event {
        protocol::Event::ButtonPress(xproto::ButtonPressEvent {
            response_type: xproto::BUTTON_PRESS_EVENT,
            detail,
            sequence: 0,
            time: 0,
            root: 1,
            event: 2,
            child: x11rb::NONE,
            root_x: 0,
            root_y: 0,
            event_x: 0,
            event_y: 0,
            state: xproto::KeyButMask::from(0u16),
            same_screen: true,
        })
    }

    fn client_message(payload: u32) -> protocol::Event {
        protocol::Event::ClientMessage(xproto::ClientMessageEvent::new(
            32,
            2,
            100u32,
            [payload, 0, 0, 0, 0],
        ))
    }

    #[test]
    fn test_key_translation() {
        let atoms = test_atoms();

        assert_eq!(
            translate_event(&atoms, &key_press(30)),
            HostEvent::Key {
                key: 22,
                pressed: true
            }
        );
        assert_eq!(
            translate_event(&atoms, &key_press(8)),
            HostEvent::Key {
                key: 0,
                pressed: true
            }
        );
        assert_eq!(
            translate_event(&atoms, &protocol::Event::KeyRelease(key_event(30))),
            HostEvent::Key {
                key: 22,
                pressed: false
            }
        );
    }

    #[test]
    fn test_button_translation() {
        let atoms = test_atoms();

        assert_eq!(
            translate_event(&atoms, &button_press(1)),
            HostEvent::Button {
                button: BTN_LEFT,
                pressed: true
            }
        );
        assert_eq!(
            translate_event(&atoms, &button_press(3)),
            HostEvent::Button {
                button: BTN_LEFT + 2,
                pressed: true
            }
        );
    }

    #[test]
    fn test_motion_translation() {
        let atoms = test_atoms();

        let event = protocol::Event::MotionNotify(xproto::MotionNotifyEvent {
            response_type: xproto::MOTION_NOTIFY_EVENT,
            detail: xproto::Motion::NORMAL,
            sequence: 0,
            time: 0,
            root: 1,
            event: 2,
            child: x11rb::NONE,
            root_x: 17,
            root_y: 3,
            event_x: 17,
            event_y: -3,
            state: xproto::KeyButMask::from(0u16),
            same_screen: true,
        });

        assert_eq!(
            translate_event(&atoms, &event),
            HostEvent::Motion { x: 17, y: -3 }
        );
    }

    #[test]
    fn test_expose_translation() {
        let atoms = test_atoms();

        let event = protocol::Event::Expose(xproto::ExposeEvent {
            response_type: xproto::EXPOSE_EVENT,
            sequence: 0,
            window: 42,
            x: 1,
            y: 2,
            width: 3,
            height: 4,
            count: 0,
        });

        assert_eq!(
            translate_event(&atoms, &event),
            HostEvent::Damage {
                window: 42,
                rect: xproto::Rectangle {
                    x: 1,
                    y: 2,
                    width: 3,
                    height: 4
                }
            }
        );
        assert_ne!(
            translate_event(&atoms, &event),
            HostEvent::Damage {
                window: 42,
                rect: xproto::Rectangle {
                    x: 1,
                    y: 2,
                    width: 3,
                    height: 5
                }
            }
        );
    }

    #[test]
    fn test_close_message() {
        let atoms = test_atoms();

        assert_eq!(
            translate_event(&atoms, &client_message(atoms.WM_DELETE_WINDOW)),
            HostEvent::Close
        );
        assert_eq!(
            translate_event(&atoms, &client_message(999)),
            HostEvent::Ignored
        );
    }

    #[test]
    fn test_unknown_events_ignored() {
        let atoms = test_atoms();

        let event = protocol::Event::MapNotify(xproto::MapNotifyEvent {
            response_type: xproto::MAP_NOTIFY_EVENT,
            sequence: 0,
            event: 2,
            window: 2,
            override_redirect: false,
        });
        assert_eq!(translate_event(&atoms, &event), HostEvent::Ignored);
    }

    #[test_log::test]
    fn test_repaint_queue_dedup() {
        let mut queue = RepaintQueue::default();

        assert!(queue.arm(1));
        assert!(!queue.arm(1));
        assert!(queue.arm(2));

        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.drain().is_empty());

        // Draining re-arms.
        assert!(queue.arm(1));
    }

    #[test_log::test]
    fn test_focus_always_schedules_repaint() {
        let mut core = RecordingCore::default();
        let mut focused = false;

        apply_focus(&mut focused, &mut core, true);
        assert!(focused);
        assert_eq!(core.repaints, 1);

        // Re-entering without leaving still repaints.
        apply_focus(&mut focused, &mut core, true);
        assert!(focused);
        assert_eq!(core.repaints, 2);

        apply_focus(&mut focused, &mut core, false);
        assert!(!focused);
        assert_eq!(core.repaints, 3);
    }

    #[test]
    fn test_buffer_geometry_must_match() {
        assert!(validate_buffer_geometry((1024, 640), (1024, 640)).is_ok());
        assert!(validate_buffer_geometry((1024, 640), (1024, 480)).is_err());
        assert!(validate_buffer_geometry((1024, 640), (800, 640)).is_err());
    }
}
