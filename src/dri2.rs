// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The DRI2 buffer-sharing handshake and buffer plumbing.
//!
//! The negotiation is a strict sequence: [`query_capabilities`], then
//! [`connect`], then [`GpuDevice::open`], then [`authenticate`]. Only after
//! authentication may buffers be requested for a window. Every step is fatal
//! on failure; the backend cannot run without a negotiated, authenticated
//! device.

use std::{
    fs::{File, OpenOptions},
    os::fd::{AsFd, AsRawFd as _, BorrowedFd, FromRawFd as _, OwnedFd},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};
use x11rb::{
    cookie::Cookie,
    protocol::{
        dri2::{self, ConnectionExt as _},
        xfixes::{self, ConnectionExt as _},
        xproto,
    },
    rust_connection::RustConnection,
};

use crate::error::BackendError;

/// The minimum xfixes major version with region support.
const MIN_XFIXES_MAJOR: u32 = 2;

/// The versions we advertise to the host.
const XFIXES_VERSION: (u32, u32) = (4, 0);
const DRI2_VERSION: (u32, u32) = (1, 3);

/// The DRI2 version negotiated with the host.
#[derive(Debug, Clone, Copy)]
pub struct Dri2Version {
    pub major: u32,
    pub minor: u32,
}

/// Validates the xfixes and DRI2 extensions. Both version requests are
/// pipelined before either reply is read. This check is mandatory before any
/// buffer request.
pub fn query_capabilities(conn: &RustConnection) -> Result<Dri2Version, BackendError> {
    let xfixes_cookie = conn.xfixes_query_version(XFIXES_VERSION.0, XFIXES_VERSION.1)?;
    let dri2_cookie = conn.dri2_query_version(DRI2_VERSION.0, DRI2_VERSION.1)?;

    let xfixes = xfixes_cookie
        .reply()
        .map_err(|err| BackendError::Capability {
            extension: "XFIXES",
            reason: err.to_string(),
        })?;
    if xfixes.major_version < MIN_XFIXES_MAJOR {
        return Err(BackendError::Capability {
            extension: "XFIXES",
            reason: format!(
                "host reports version {}.{}, need at least {}.0",
                xfixes.major_version, xfixes.minor_version, MIN_XFIXES_MAJOR
            ),
        });
    }

    let dri2 = dri2_cookie.reply().map_err(|err| BackendError::Capability {
        extension: "DRI2",
        reason: err.to_string(),
    })?;

    debug!(
        xfixes = format_args!("{}.{}", xfixes.major_version, xfixes.minor_version),
        dri2 = format_args!("{}.{}", dri2.major_version, dri2.minor_version),
        "host extensions validated"
    );

    Ok(Dri2Version {
        major: dri2.major_version,
        minor: dri2.minor_version,
    })
}

/// The host's answer to a DRI2 connect request: which driver it runs, and
/// which device node we should open.
#[derive(Debug, Clone)]
pub struct DriverConnection {
    pub driver: String,
    pub device_path: PathBuf,
}

/// Asks the host which DRI driver and device node serve the screen.
pub fn connect(
    conn: &RustConnection,
    root: xproto::Window,
) -> Result<DriverConnection, BackendError> {
    let reply = conn
        .dri2_connect(root, dri2::DriverType::DRI)?
        .reply()
        .map_err(|err| BackendError::Negotiation(err.to_string()))?;

    if reply.driver_name.is_empty() && reply.device_name.is_empty() {
        return Err(BackendError::Negotiation(
            "host has no usable DRI driver".to_string(),
        ));
    }

    let driver = String::from_utf8_lossy(&reply.driver_name).into_owned();
    let device_path = PathBuf::from(String::from_utf8_lossy(&reply.device_name).into_owned());

    info!(driver, path = %device_path.display(), "DRI2 driver negotiated");

    Ok(DriverConnection {
        driver,
        device_path,
    })
}

const DRM_IOCTL_BASE: u8 = b'd';

#[repr(C)]
struct DrmAuth {
    magic: u32,
}

#[repr(C)]
struct DrmGemOpen {
    name: u32,
    handle: u32,
    size: u64,
}

#[repr(C)]
struct DrmGemClose {
    handle: u32,
    pad: u32,
}

#[repr(C)]
struct DrmPrimeHandle {
    handle: u32,
    flags: u32,
    fd: i32,
}

nix::ioctl_readwrite!(drm_get_magic, DRM_IOCTL_BASE, 0x02, DrmAuth);
nix::ioctl_write_ptr!(drm_gem_close, DRM_IOCTL_BASE, 0x09, DrmGemClose);
nix::ioctl_readwrite!(drm_gem_open, DRM_IOCTL_BASE, 0x0b, DrmGemOpen);
nix::ioctl_readwrite!(drm_prime_handle_to_fd, DRM_IOCTL_BASE, 0x2d, DrmPrimeHandle);

/// The GPU device node negotiated over DRI2, opened read-write.
pub struct GpuDevice {
    file: File,
    path: PathBuf,
}

impl AsFd for GpuDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl GpuDevice {
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let mut options = OpenOptions::new();
        options.read(true);
        options.write(true);

        let file = options.open(path).map_err(|source| BackendError::DeviceOpen {
            path: path.to_owned(),
            source,
        })?;

        debug!(path = %path.display(), "opened GPU device node");

        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The device number of the node, for matching against render device
    /// properties.
    pub fn rdev(&self) -> Result<libc::dev_t, BackendError> {
        use std::os::unix::fs::MetadataExt as _;

        let meta = self.file.metadata().map_err(|source| BackendError::DeviceOpen {
            path: self.path.clone(),
            source,
        })?;

        Ok(meta.rdev())
    }

    /// The device-local magic token submitted to the host for
    /// authentication.
    fn magic(&self) -> Result<u32, BackendError> {
        let mut auth = DrmAuth { magic: 0 };
        unsafe { drm_get_magic(self.file.as_raw_fd(), &mut auth) }
            .map_err(|err| BackendError::Authentication(format!("DRM_IOCTL_GET_MAGIC: {err}")))?;

        Ok(auth.magic)
    }

    /// Exports a negotiated buffer, identified by its GEM flink name, as a
    /// dmabuf the render context can import. The intermediate GEM handle is
    /// closed before returning.
    pub fn export_buffer(&self, name: u32) -> Result<OwnedFd, BackendError> {
        let fd = self.file.as_raw_fd();

        let mut open = DrmGemOpen {
            name,
            handle: 0,
            size: 0,
        };
        unsafe { drm_gem_open(fd, &mut open) }
            .map_err(|err| BackendError::Import(format!("GEM open of buffer {name}: {err}")))?;

        let mut prime = DrmPrimeHandle {
            handle: open.handle,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            fd: -1,
        };
        let res = unsafe { drm_prime_handle_to_fd(fd, &mut prime) };

        let close = DrmGemClose {
            handle: open.handle,
            pad: 0,
        };
        if let Err(err) = unsafe { drm_gem_close(fd, &close) } {
            warn!(handle = open.handle, "failed to close GEM handle: {err}");
        }

        res.map_err(|err| {
            BackendError::Import(format!("PRIME export of buffer {name}: {err}"))
        })?;

        Ok(unsafe { OwnedFd::from_raw_fd(prime.fd) })
    }
}

/// Submits the device's magic token to the host. Must succeed exactly once
/// per opened device before any buffer request.
pub fn authenticate(
    conn: &RustConnection,
    root: xproto::Window,
    device: &GpuDevice,
) -> Result<(), BackendError> {
    let magic = device.magic()?;

    let reply = conn
        .dri2_authenticate(root, magic)?
        .reply()
        .map_err(|err| BackendError::Authentication(err.to_string()))?;

    if reply.authenticated == 0 {
        return Err(BackendError::Authentication(
            "host refused our magic token".to_string(),
        ));
    }

    debug!("authenticated with host DRI2");
    Ok(())
}

/// A reply count that differs from the requested attachment count is a fatal
/// integration error; the caller must abort output creation rather than
/// proceed with a partial list.
pub fn validate_buffer_count(requested: usize, returned: usize) -> Result<(), BackendError> {
    if returned != requested {
        return Err(BackendError::BufferNegotiation(format!(
            "requested {requested} buffers, host returned {returned}"
        )));
    }

    Ok(())
}

/// Requests one buffer per attachment for a DRI2 drawable.
pub fn request_buffers(
    conn: &RustConnection,
    window: xproto::Window,
    attachments: &[dri2::Attachment],
) -> Result<dri2::GetBuffersReply, BackendError> {
    let raw: Vec<u32> = attachments.iter().map(|a| u32::from(*a)).collect();

    let reply = conn
        .dri2_get_buffers(window, attachments.len() as u32, &raw)?
        .reply()
        .map_err(|err| BackendError::BufferNegotiation(err.to_string()))?;

    validate_buffer_count(attachments.len(), reply.buffers.len())?;

    Ok(reply)
}

/// An issued copy request whose reply has not been collected yet.
///
/// The reply must be retired, even if only to discard it; an abandoned reply
/// leaks host-side resources. Retiring before issuing the next copy for the
/// same output is what bounds us to one outstanding presentation request per
/// output.
pub struct PendingCopy<'c> {
    window: xproto::Window,
    cookie: Cookie<'c, RustConnection, dri2::CopyRegionReply>,
}

impl PendingCopy<'_> {
    /// Waits out the host's acknowledgement. A missing reply means the copy
    /// simply did not happen; the next damage episode recopies, so this is
    /// logged rather than surfaced.
    pub fn retire(self) {
        if let Err(err) = self.cookie.reply() {
            warn!(window = self.window, "copy region reply lost: {err}");
        }
    }
}

/// Issues an asynchronous copy between two attachments of a drawable,
/// scoped to `region`.
pub fn copy_region<'c>(
    conn: &'c RustConnection,
    window: xproto::Window,
    region: xfixes::Region,
    dest: dri2::Attachment,
    src: dri2::Attachment,
) -> Result<PendingCopy<'c>, BackendError> {
    let cookie = conn.dri2_copy_region(window, region, dest.into(), src.into())?;

    Ok(PendingCopy { window, cookie })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_buffer_count_must_match() {
        assert!(validate_buffer_count(1, 1).is_ok());
        assert!(validate_buffer_count(1, 0).is_err());
        assert!(validate_buffer_count(1, 2).is_err());

        let err = validate_buffer_count(1, 0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "buffer negotiation failed: requested 1 buffers, host returned 0"
        );
    }
}
