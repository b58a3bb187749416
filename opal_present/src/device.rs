use std::{
    ffi::{c_void, CStr, CString},
    mem::ManuallyDrop,
    sync::Arc,
};

use anyhow::{Context, Result};
use ash::{ext::debug_utils, khr, vk};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings,
};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;

use crate::meta::MetaOps;

pub(crate) struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    debug_utils: debug_utils::Instance,
    debug_utils_messenger: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    fn new(display_handle: RawDisplayHandle) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new("opal_present").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .api_version(vk::API_VERSION_1_3);

        let mut extension_names =
            ash_window::enumerate_required_extensions(display_handle)?.to_vec();
        extension_names.push(debug_utils::NAME.as_ptr());

        let layer_strings = if cfg!(debug_assertions) {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            Vec::new()
        };
        let layer_names: Vec<*const i8> =
            layer_strings.iter().map(|c_str| c_str.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);

        let raw = unsafe { entry.create_instance(&instance_info, None)? };

        let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_utils_callback));

        let debug_utils = debug_utils::Instance::new(&entry, &raw);
        let debug_utils_messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&debug_utils_info, None)? };

        Ok(Self {
            entry,
            raw,
            debug_utils,
            debug_utils_messenger,
        })
    }

    fn get_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        let physical_devices = unsafe { self.raw.enumerate_physical_devices()? };
        physical_devices
            .into_iter()
            .map(|phys_device| PhysicalDevice::new_from_vulkan_handle(&self.raw, phys_device))
            .collect::<Result<_>>()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("Instance dropped");
        unsafe {
            self.debug_utils
                .destroy_debug_utils_messenger(self.debug_utils_messenger, None);
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let severity = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => "[Verbose]",
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => "[Warning]",
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => "[Error]",
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => "[Info]",
        _ => "[Unknown]",
    };
    let types = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::debug!("[VK Debug]{}{}{:?}", severity, types, message);

    vk::FALSE
}

#[derive(Debug, Clone)]
pub(crate) struct PhysicalDevice {
    pub(crate) raw: vk::PhysicalDevice,
    name: String,
    device_type: vk::PhysicalDeviceType,
    queue_families: Vec<QueueFamily>,
    supported_extensions: Vec<String>,
}

impl PhysicalDevice {
    fn new_from_vulkan_handle(instance: &ash::Instance, raw: vk::PhysicalDevice) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(raw) };
        let name = unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
                .to_str()
                .unwrap()
                .to_owned()
        };
        let device_type = properties.device_type;

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(raw) };
        let queue_families = queue_family_properties
            .into_iter()
            .enumerate()
            .map(|(index, properties)| QueueFamily {
                index: index as _,
                properties,
            })
            .collect();

        let extension_properties = unsafe { instance.enumerate_device_extension_properties(raw)? };
        let supported_extensions = extension_properties
            .into_iter()
            .map(|prop| {
                let name = unsafe { CStr::from_ptr(prop.extension_name.as_ptr()) };
                name.to_str().unwrap().to_owned()
            })
            .collect();

        Ok(Self {
            raw,
            name,
            device_type,
            queue_families,
            supported_extensions,
        })
    }

    fn supports_extension(&self, extension: &CStr) -> bool {
        let extension = extension.to_str().unwrap();
        self.supported_extensions
            .iter()
            .any(|supported| supported == extension)
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueFamily {
    index: u32,
    properties: vk::QueueFamilyProperties,
}

impl QueueFamily {
    fn supports_graphics(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS)
    }
}

/// Prefers a discrete GPU, falls back to whatever comes first.
fn select_physical_device(devices: &[PhysicalDevice]) -> Result<PhysicalDevice> {
    let device = devices
        .iter()
        .find(|device| device.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| devices.first())
        .context("No Vulkan physical device available")?;

    Ok(device.clone())
}

/// Logical device plus everything the presentation machinery shares:
/// the allocator for user back buffers, the WSI function tables, the
/// cached blit pipelines, and the optional-extension availability that
/// steers the frame latency policy.
///
/// Should be used/passed around as an immutable reference; members are
/// internally mutable as required.
pub struct Device {
    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) meta: ManuallyDrop<MetaOps>,
    pub(crate) raw: ash::Device,

    pub(crate) swapchain_fns: khr::swapchain::Device,
    pub(crate) push_descriptor_fns: khr::push_descriptor::Device,
    pub(crate) present_wait_fns: Option<khr::present_wait::Device>,
    pub(crate) hdr_metadata_fns: Option<ash::ext::hdr_metadata::Device>,

    pub(crate) graphics_family_index: u32,
    pub(crate) physical_device: PhysicalDevice,
    pub(crate) instance: Instance,
}

impl Device {
    pub fn new(display_handle: RawDisplayHandle) -> Result<Arc<Self>> {
        let instance = Instance::new(display_handle)?;
        let physical_devices = instance.get_physical_devices()?;
        let physical_device = select_physical_device(&physical_devices)?;

        log::info!("Physical device name: {}", physical_device.name);

        let graphics_family_index = physical_device
            .queue_families
            .iter()
            .find(|family| family.supports_graphics() && family.properties.queue_count > 0)
            .context("No graphics queue family available")?
            .index;

        let supports_present_wait = physical_device.supports_extension(khr::present_id::NAME)
            && physical_device.supports_extension(khr::present_wait::NAME)
            && Self::query_present_wait_features(&instance, &physical_device);
        let supports_hdr_metadata =
            physical_device.supports_extension(ash::ext::hdr_metadata::NAME);

        let raw = Self::new_ash_device(
            &instance,
            &physical_device,
            graphics_family_index,
            supports_present_wait,
            supports_hdr_metadata,
        )?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: physical_device.raw,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        })?;
        let allocator = Mutex::new(allocator);

        let swapchain_fns = khr::swapchain::Device::new(&instance.raw, &raw);
        let push_descriptor_fns = khr::push_descriptor::Device::new(&instance.raw, &raw);
        let present_wait_fns = supports_present_wait
            .then(|| khr::present_wait::Device::new(&instance.raw, &raw));
        let hdr_metadata_fns = supports_hdr_metadata
            .then(|| ash::ext::hdr_metadata::Device::new(&instance.raw, &raw));

        let meta = MetaOps::new(raw.clone())?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(allocator),
            meta: ManuallyDrop::new(meta),
            raw,
            swapchain_fns,
            push_descriptor_fns,
            present_wait_fns,
            hdr_metadata_fns,
            graphics_family_index,
            physical_device,
            instance,
        }))
    }

    pub(crate) fn supports_present_wait(&self) -> bool {
        self.present_wait_fns.is_some()
    }

    fn query_present_wait_features(instance: &Instance, physical_device: &PhysicalDevice) -> bool {
        let mut present_id_features = vk::PhysicalDevicePresentIdFeaturesKHR::default();
        let mut present_wait_features = vk::PhysicalDevicePresentWaitFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut present_id_features)
            .push_next(&mut present_wait_features);
        unsafe {
            instance
                .raw
                .get_physical_device_features2(physical_device.raw, &mut features2);
        }

        present_id_features.present_id == vk::TRUE
            && present_wait_features.present_wait == vk::TRUE
    }

    fn new_ash_device(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        graphics_family_index: u32,
        enable_present_wait: bool,
        enable_hdr_metadata: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family_index)
            .queue_priorities(&queue_priorities)];

        let mut device_extensions = vec![
            khr::swapchain::NAME.as_ptr(),
            khr::push_descriptor::NAME.as_ptr(),
        ];
        if enable_present_wait {
            device_extensions.push(khr::present_id::NAME.as_ptr());
            device_extensions.push(khr::present_wait::NAME.as_ptr());
        }
        if enable_hdr_metadata {
            device_extensions.push(ash::ext::hdr_metadata::NAME.as_ptr());
        }

        let mut vulkan12_features =
            vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut present_id_features =
            vk::PhysicalDevicePresentIdFeaturesKHR::default().present_id(true);
        let mut present_wait_features =
            vk::PhysicalDevicePresentWaitFeaturesKHR::default().present_wait(true);

        let mut device_features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan12_features)
            .push_next(&mut vulkan13_features);
        if enable_present_wait {
            device_features2 = device_features2
                .push_next(&mut present_id_features)
                .push_next(&mut present_wait_features);
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extensions)
            .push_next(&mut device_features2);

        let device = unsafe {
            instance
                .raw
                .create_device(physical_device.raw, &device_create_info, None)?
        };

        Ok(device)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::trace!("Logical device dropped");
        unsafe {
            ManuallyDrop::take(&mut self.meta).destroy();
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}
