//! Vulkan dma-buf import adapter
//!
//! Imports capture-producer dma-bufs as Vulkan images using
//! `VK_EXT_external_memory_dma_buf` + `VK_EXT_image_drm_format_modifier`,
//! and turns kernel sync-files into timeline waits via
//! `VK_KHR_external_semaphore_fd`. The rest of the server never sees
//! Vulkan handles; imported images surface as opaque ids on the buffer's
//! transient GPU mapping.

use std::os::fd::{IntoRawFd, OwnedFd};

use ash::vk;
use tracing::{debug, info};

use super::{HwAccelError, Result};

/// One imported dma-buf image
pub struct ImportedImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    width: u32,
    height: u32,
}

impl ImportedImage {
    /// Opaque handle value for [`crate::buffer::GpuMapping::VulkanImage`]
    pub fn handle_value(&self) -> u64 {
        use ash::vk::Handle;
        self.image.as_raw()
    }

    /// Image dimensions
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Vulkan device wrapper for dma-buf import
pub struct VulkanImporter {
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    #[allow(dead_code)]
    physical_device: vk::PhysicalDevice,
    memory_props: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanImporter {
    /// Create an importer on the first physical device offering the
    /// required external-memory extensions
    pub fn new() -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| HwAccelError::Unavailable(format!("Failed to load Vulkan: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"boreal-rdp-server")
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| HwAccelError::Unavailable(format!("Failed to create instance: {e}")))?;

        let required_extensions = [
            ash::ext::external_memory_dma_buf::NAME,
            ash::ext::image_drm_format_modifier::NAME,
            ash::khr::external_memory_fd::NAME,
            ash::khr::external_semaphore_fd::NAME,
        ];

        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| HwAccelError::Unavailable(format!("Failed to enumerate devices: {e}")))?;

        let physical_device = physical_devices
            .into_iter()
            .find(|&device| {
                let extensions =
                    unsafe { instance.enumerate_device_extension_properties(device) }.unwrap_or_default();
                required_extensions.iter().all(|required| {
                    extensions.iter().any(|ext| {
                        ext.extension_name_as_c_str()
                            .map(|name| name == *required)
                            .unwrap_or(false)
                    })
                })
            })
            .ok_or_else(|| {
                HwAccelError::Unavailable("No device with dma-buf import extensions".into())
            })?;

        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(0)
            .queue_priorities(&queue_priorities);
        let extension_ptrs: Vec<_> = required_extensions.iter().map(|name| name.as_ptr()).collect();
        let queue_infos = [queue_info];
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs);

        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(|e| HwAccelError::Unavailable(format!("Failed to create device: {e}")))?;

        let memory_props = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        info!("Vulkan dma-buf importer initialized");

        Ok(Self {
            entry,
            instance,
            device,
            physical_device,
            memory_props,
        })
    }

    /// Import a BGRX dma-buf as a Vulkan image
    ///
    /// Ownership of `fd` transfers to the driver on success.
    pub fn import_dma_buf(
        &self,
        fd: OwnedFd,
        width: u32,
        height: u32,
        offset: u32,
        modifier: u64,
    ) -> Result<ImportedImage> {
        let plane_layout = vk::SubresourceLayout {
            offset: offset as u64,
            size: 0,
            row_pitch: width as u64 * 4,
            array_pitch: 0,
            depth_pitch: 0,
        };
        let plane_layouts = [plane_layout];
        let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
            .drm_format_modifier(modifier)
            .plane_layouts(&plane_layouts);
        let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let image_info = vk::ImageCreateInfo::default()
            .push_next(&mut modifier_info)
            .push_next(&mut external_info)
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::B8G8R8A8_UNORM)
            .extent(vk::Extent3D { width, height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| HwAccelError::ImportFailure(format!("Failed to create image: {e}")))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory_type_index = (0..self.memory_props.memory_type_count)
            .find(|&index| requirements.memory_type_bits & (1 << index) != 0)
            .ok_or_else(|| {
                unsafe { self.device.destroy_image(image, None) };
                HwAccelError::ImportFailure("No compatible memory type".into())
            })?;

        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(fd.into_raw_fd());
        let allocate_info = vk::MemoryAllocateInfo::default()
            .push_next(&mut import_info)
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None) }.map_err(|e| {
            unsafe { self.device.destroy_image(image, None) };
            HwAccelError::ImportFailure(format!("Failed to import dma-buf memory: {e}"))
        })?;

        if let Err(e) = unsafe { self.device.bind_image_memory(image, memory, 0) } {
            unsafe {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
            }
            return Err(HwAccelError::ImportFailure(format!("Failed to bind image memory: {e}")));
        }

        debug!("Imported dma-buf image {}x{} (modifier {:#x})", width, height, modifier);

        Ok(ImportedImage {
            image,
            memory,
            width,
            height,
        })
    }

    /// Release an imported image
    pub fn release_image(&self, image: ImportedImage) {
        unsafe {
            self.device.destroy_image(image.image, None);
            self.device.free_memory(image.memory, None);
        }
    }
}

impl Drop for VulkanImporter {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
