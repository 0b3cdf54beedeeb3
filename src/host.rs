// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The connection to the host X11 server.

use std::os::fd::{AsFd as _, AsRawFd as _, RawFd};

use tracing::debug;
use x11rb::{
    connection::Connection as _,
    protocol,
    protocol::xproto::{self, ConnectionExt as _},
    rust_connection::RustConnection,
};

use crate::error::BackendError;

x11rb::atom_manager! {
    /// Atoms used on presented windows.
    pub Atoms:
    AtomsCookie {
        WM_PROTOCOLS,
        WM_NORMAL_HINTS,
        WM_SIZE_HINTS,
        WM_DELETE_WINDOW,
        _NET_WM_NAME,
        UTF8_STRING,
    }
}

/// One process-wide handle to the host display server, alive for the
/// lifetime of the backend.
pub struct HostConnection {
    pub conn: RustConnection,
    pub screen: xproto::Screen,
    pub atoms: Atoms,
    /// A 1x1 transparent cursor, installed on presented windows so the host
    /// cursor stays hidden inside the compositor's client area.
    pub blank_cursor: xproto::Cursor,
}

impl HostConnection {
    /// Connects to the host server and interns the atom table. Interning is
    /// a fatal setup step; a missing reply means the connection is unusable.
    pub fn connect(display: Option<&str>) -> Result<Self, BackendError> {
        let (conn, screen_num) = x11rb::connect(display)?;
        let screen = conn.setup().roots[screen_num].clone();

        let atoms = Atoms::new(&conn)?.reply()?;
        let blank_cursor = create_blank_cursor(&conn, &screen)?;
        conn.flush()?;

        debug!(screen = screen_num, root = screen.root, "connected to host display");

        Ok(Self {
            conn,
            screen,
            atoms,
            blank_cursor,
        })
    }

    /// The connection's file descriptor, for registration with the
    /// compositor's poller.
    pub fn as_raw_fd(&self) -> RawFd {
        self.conn.stream().as_fd().as_raw_fd()
    }

    /// Returns the next already-buffered host event, without blocking.
    pub fn poll_event(&self) -> Result<Option<protocol::Event>, BackendError> {
        Ok(self.conn.poll_for_event()?)
    }
}

/// Allocates a cursor backed by a 1x1 transparent pixmap. The pixmap and
/// graphics context only exist long enough to build the cursor.
fn create_blank_cursor(
    conn: &RustConnection,
    screen: &xproto::Screen,
) -> Result<xproto::Cursor, BackendError> {
    let pixmap = conn.generate_id()?;
    let gc = conn.generate_id()?;

    conn.create_pixmap(1, pixmap, screen.root, 1, 1)?;
    conn.create_gc(gc, pixmap, &xproto::CreateGCAux::default())?;
    conn.put_image(
        xproto::ImageFormat::XY_PIXMAP,
        pixmap,
        gc,
        1,
        1,
        0,
        0,
        0,
        1,
        &[0, 0, 0, 0],
    )?;

    let cursor = conn.generate_id()?;
    conn.create_cursor(cursor, pixmap, pixmap, 0, 0, 0, 0, 0, 0, 1, 1)?;

    conn.free_gc(gc)?;
    conn.free_pixmap(pixmap)?;

    Ok(cursor)
}
