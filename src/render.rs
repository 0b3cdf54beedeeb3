// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Vulkan state for rendering into DRI2-negotiated buffers.
//!
//! The physical device is not chosen by enumeration order; it must be the
//! same device the host handed us over DRI2, matched by DRM node. Negotiated
//! buffers arrive as GEM flink names, get exported as dmabufs by
//! [`crate::dri2::GpuDevice::export_buffer`], and are imported here as
//! renderable images.

use std::{
    ffi::CStr,
    os::fd::{AsRawFd as _, IntoRawFd as _},
    sync::Arc,
};

use ash::vk;
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, info, trace};
use x11rb::protocol::dri2;

use crate::{dri2::GpuDevice, error::BackendError};

const REQUIRED_DEVICE_EXTENSIONS: &[&CStr] = &[
    ash::khr::external_memory_fd::NAME,
    ash::ext::external_memory_dma_buf::NAME,
    ash::ext::image_drm_format_modifier::NAME,
    ash::ext::physical_device_drm::NAME,
];

pub struct RenderContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub device: ash::Device,
    pub device_info: DeviceInfo,
    pub graphics_queue: vk::Queue,
    pub external_memory_api: ash::khr::external_memory_fd::Device,
}

pub struct DeviceInfo {
    pub pdevice: vk::PhysicalDevice,
    pub device_name: String,
    pub graphics_family: u32,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
}

impl RenderContext {
    /// Creates a vulkan context on the physical device backing `gpu`.
    pub fn new(gpu: &GpuDevice) -> Result<Arc<Self>, BackendError> {
        let entry = unsafe {
            ash::Entry::load().map_err(|err| context_err("failed to load vulkan libraries", err))?
        };

        let (major, minor) = match unsafe {
            entry
                .try_enumerate_instance_version()
                .map_err(|err| context_err("vkEnumerateInstanceVersion", err))?
        } {
            Some(version) => (
                vk::api_version_major(version),
                vk::api_version_minor(version),
            ),
            None => (1, 0),
        };

        if major < 1 || (major == 1 && minor < 1) {
            return Err(BackendError::Context(
                "vulkan 1.1 or higher is required".to_string(),
            ));
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"Vitrine")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"No Engine")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, major, minor, 0));

        let instance_create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe {
            entry
                .create_instance(&instance_create_info, None)
                .map_err(|err| context_err("vkCreateInstance", err))?
        };

        // The host told us which node it renders with. Anything else would
        // hand us images we can't share.
        let rdev = gpu.rdev()?;

        let device_info = match select_physical_device(&instance, rdev) {
            Ok(info) => info,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        info!(
            device = device_info.device_name,
            path = %gpu.path().display(),
            "selected vulkan device"
        );

        let device = {
            let queue_priorities = [1.0_f32];
            let queue_create_info = vk::DeviceQueueCreateInfo::default()
                .queue_family_index(device_info.graphics_family)
                .queue_priorities(&queue_priorities);

            let extensions: Vec<*const std::ffi::c_char> = REQUIRED_DEVICE_EXTENSIONS
                .iter()
                .map(|name| name.as_ptr())
                .collect();

            let queue_create_infos = [queue_create_info];
            let create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_create_infos)
                .enabled_extension_names(&extensions);

            match unsafe { instance.create_device(device_info.pdevice, &create_info, None) } {
                Ok(device) => device,
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(context_err("vkCreateDevice", err));
                }
            }
        };

        let graphics_queue = unsafe { device.get_device_queue(device_info.graphics_family, 0) };
        let external_memory_api = ash::khr::external_memory_fd::Device::new(&instance, &device);

        Ok(Arc::new(Self {
            entry,
            instance,
            device,
            device_info,
            graphics_queue,
            external_memory_api,
        }))
    }

    /// Blocks until all submitted rendering work has completed. Called before
    /// copying the back buffer to the window.
    pub fn flush(&self) -> Result<(), BackendError> {
        unsafe {
            self.device
                .queue_wait_idle(self.graphics_queue)
                .map_err(|err| context_err("vkQueueWaitIdle", err))
        }
    }

    /// Wraps a DRI2-negotiated buffer as a renderable image.
    ///
    /// The buffer is identified by its GEM flink name, exported as a dmabuf
    /// through the negotiated device, and imported with an explicit linear
    /// layout taken from the buffer's pitch.
    pub fn import_buffer(
        self: &Arc<Self>,
        gpu: &GpuDevice,
        buffer: &dri2::DRI2Buffer,
        width: u16,
        height: u16,
    ) -> Result<RenderTarget, BackendError> {
        let fd = gpu.export_buffer(buffer.name)?;
        let (width, height) = (u32::from(width), u32::from(height));

        let fourcc = buffer_fourcc(buffer.cpp).ok_or_else(|| {
            BackendError::Import(format!("unsupported buffer depth: {} bytes", buffer.cpp))
        })?;
        let vk_format = match fourcc {
            DrmFourcc::Argb8888 => vk::Format::B8G8R8A8_UNORM,
            _ => unreachable!(),
        };

        trace!(
            name = buffer.name,
            pitch = buffer.pitch,
            cpp = buffer.cpp,
            fd = fd.as_raw_fd(),
            "importing negotiated buffer"
        );

        let image = {
            let plane_layouts = [vk::SubresourceLayout {
                offset: 0,
                size: 0, // Must be zero, according to the spec.
                row_pitch: u64::from(buffer.pitch),
                ..Default::default()
            }];

            let mut format_modifier_info =
                vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
                    .drm_format_modifier(DrmModifier::Linear.into())
                    .plane_layouts(&plane_layouts);

            let mut external_memory_info = vk::ExternalMemoryImageCreateInfo::default()
                .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

            let create_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(vk_format)
                .extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                .samples(vk::SampleCountFlags::TYPE_1)
                .usage(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
                )
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .push_next(&mut external_memory_info)
                .push_next(&mut format_modifier_info);

            unsafe {
                self.device
                    .create_image(&create_info, None)
                    .map_err(|err| import_err("vkCreateImage", err))?
            }
        };

        let memory = {
            let mut fd_props = vk::MemoryFdPropertiesKHR::default();
            unsafe {
                self.external_memory_api
                    .get_memory_fd_properties(
                        vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                        fd.as_raw_fd(),
                        &mut fd_props,
                    )
                    .map_err(|err| import_err("vkGetMemoryFdPropertiesKHR", err))?;
            }

            let image_memory_req = unsafe { self.device.get_image_memory_requirements(image) };
            let memory_type_index = select_memory_type(
                &self.device_info.memory_props,
                vk::MemoryPropertyFlags::empty(),
                Some(image_memory_req.memory_type_bits & fd_props.memory_type_bits),
            )
            .ok_or_else(|| {
                BackendError::Import("no importable memory type for dmabuf".to_string())
            })?;

            let mut external_mem_info = vk::ImportMemoryFdInfoKHR::default()
                .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
                .fd(fd.into_raw_fd()); // Vulkan owns the fd now.

            // Only required on some NVIDIA cards, but it doesn't hurt
            // elsewhere.
            let mut dedicated_memory_info =
                vk::MemoryDedicatedAllocateInfo::default().image(image);

            let allocate_info = vk::MemoryAllocateInfo::default()
                .allocation_size(image_memory_req.size)
                .memory_type_index(memory_type_index)
                .push_next(&mut external_mem_info)
                .push_next(&mut dedicated_memory_info);

            match unsafe { self.device.allocate_memory(&allocate_info, None) } {
                Ok(memory) => memory,
                Err(err) => {
                    unsafe { self.device.destroy_image(image, None) };
                    return Err(import_err("vkAllocateMemory", err));
                }
            }
        };

        unsafe {
            if let Err(err) = self.device.bind_image_memory(image, memory, 0) {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
                return Err(import_err("vkBindImageMemory", err));
            }
        }

        let view = {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(vk_format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            match unsafe { self.device.create_image_view(&create_info, None) } {
                Ok(view) => view,
                Err(err) => {
                    unsafe {
                        self.device.destroy_image(image, None);
                        self.device.free_memory(memory, None);
                    }
                    return Err(import_err("vkCreateImageView", err));
                }
            }
        };

        debug!(width, height, pitch = buffer.pitch, "imported back buffer");

        Ok(RenderTarget {
            image,
            view,
            memory,
            format: vk_format,
            width,
            height,
            vk: self.clone(),
        })
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        debug!("destroying vulkan instance");

        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// An imported back buffer, renderable as a color attachment.
pub struct RenderTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: vk::DeviceMemory,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    vk: Arc<RenderContext>,
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        unsafe {
            self.vk.device.destroy_image_view(self.view, None);
            self.vk.device.destroy_image(self.image, None);
            self.vk.device.free_memory(self.memory, None);
        }
    }
}

fn select_physical_device(
    instance: &ash::Instance,
    rdev: libc::dev_t,
) -> Result<DeviceInfo, BackendError> {
    let devices = unsafe {
        instance
            .enumerate_physical_devices()
            .map_err(|err| context_err("vkEnumeratePhysicalDevices", err))?
    };

    for pdevice in devices {
        match query_device(instance, pdevice, rdev) {
            Ok(Some(info)) => return Ok(info),
            Ok(None) => (),
            Err(err) => debug!("skipping vulkan device: {err}"),
        }
    }

    Err(BackendError::Context(format!(
        "no vulkan device matches DRM node {}:{}",
        libc::major(rdev),
        libc::minor(rdev),
    )))
}

fn query_device(
    instance: &ash::Instance,
    pdevice: vk::PhysicalDevice,
    rdev: libc::dev_t,
) -> Result<Option<DeviceInfo>, BackendError> {
    let mut drm_props = vk::PhysicalDeviceDrmPropertiesEXT::default();
    let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut drm_props);
    unsafe { instance.get_physical_device_properties2(pdevice, &mut props) };

    let device_name = unsafe {
        CStr::from_ptr(props.properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned()
    };

    // DRI2 may hand out a primary node or a render node; accept either.
    let primary = drm_props.has_primary != 0
        && libc::makedev(drm_props.primary_major as u32, drm_props.primary_minor as u32) == rdev;
    let render = drm_props.has_render != 0
        && libc::makedev(drm_props.render_major as u32, drm_props.render_minor as u32) == rdev;

    if !primary && !render {
        return Ok(None);
    }

    let available_extensions = unsafe {
        instance
            .enumerate_device_extension_properties(pdevice)
            .map_err(|err| context_err("vkEnumerateDeviceExtensionProperties", err))?
            .into_iter()
            .map(|properties| {
                CStr::from_ptr(properties.extension_name.as_ptr()).to_owned()
            })
            .collect::<Vec<_>>()
    };

    for required in REQUIRED_DEVICE_EXTENSIONS {
        if !available_extensions
            .iter()
            .any(|ext| ext.as_c_str() == *required)
        {
            return Err(BackendError::Context(format!(
                "device {device_name:?} is missing {required:?}"
            )));
        }
    }

    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(pdevice) };

    let graphics_family = queue_families
        .iter()
        .position(|properties| properties.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
        .ok_or_else(|| {
            BackendError::Context(format!("device {device_name:?} has no graphics queue"))
        })?;

    let memory_props = unsafe { instance.get_physical_device_memory_properties(pdevice) };

    Ok(Some(DeviceInfo {
        pdevice,
        device_name,
        graphics_family,
        memory_props,
    }))
}

fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
    memory_type_bits: Option<u32>,
) -> Option<u32> {
    for i in 0..props.memory_type_count {
        if let Some(mask) = memory_type_bits {
            if mask & (1 << i) == 0 {
                continue;
            }
        }

        if flags.is_empty()
            || props.memory_types[i as usize]
                .property_flags
                .contains(flags)
        {
            return Some(i);
        }
    }

    None
}

/// DRI2 buffers don't carry an explicit format, only a byte depth; 32-bit
/// buffers are ARGB8888 by convention.
fn buffer_fourcc(cpp: u32) -> Option<DrmFourcc> {
    match cpp {
        4 => Some(DrmFourcc::Argb8888),
        _ => None,
    }
}

fn context_err(what: &str, err: impl std::fmt::Display) -> BackendError {
    BackendError::Context(format!("{what}: {err}"))
}

fn import_err(what: &str, err: impl std::fmt::Display) -> BackendError {
    BackendError::Import(format!("{what}: {err}"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_buffer_fourcc() {
        assert_eq!(buffer_fourcc(4), Some(DrmFourcc::Argb8888));
        assert_eq!(buffer_fourcc(2), None);
        assert_eq!(buffer_fourcc(0), None);
    }
}

