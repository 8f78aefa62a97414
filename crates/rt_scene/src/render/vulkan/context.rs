//! Headless Vulkan context
//!
//! Owns the instance, the selected ray-tracing capable physical device and the
//! logical device. No surface or swapchain is created; presentation belongs to
//! the embedding renderer.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{AccelerationStructure, DeferredHostOperations, RayTracingPipeline};
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};
use crate::core::config::DeviceConfig;
use crate::render::vulkan::{VulkanError, VulkanResult};

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

fn cstring(value: &str) -> VulkanResult<CString> {
    CString::new(value)
        .map_err(|e| VulkanError::InitializationFailed(format!("Invalid name {value:?}: {e}")))
}

/// Device extensions required for acceleration structures and ray tracing
fn required_device_extensions() -> [&'static CStr; 3] {
    [
        AccelerationStructure::name(),
        DeferredHostOperations::name(),
        RayTracingPipeline::name(),
    ]
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create a Vulkan 1.2 instance, optionally with validation routed to `log`
    pub fn new(app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name_cstr = cstring(app_name)?;
        let engine_name_cstr = cstring("rt_scene")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions: Vec<*const std::ffi::c_char> = Vec::new();
        let layer_names = if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
            vec![cstring(VALIDATION_LAYER)?]
        } else {
            Vec::new()
        };
        let layer_names_ptrs: Vec<*const std::ffi::c_char> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None).map_err(VulkanError::Api)? };

        let debug_utils = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&debug_utils)?;
            Some((debug_utils, messenger))
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// `minAccelerationStructureScratchOffsetAlignment`
    pub min_scratch_alignment: u64,
    /// `maxInstanceCount`
    pub max_instance_count: u64,
    /// Queue family supporting compute and transfer
    pub queue_family: u32,
}

impl PhysicalDeviceInfo {
    /// Select the first device exposing the ray-tracing extensions
    pub fn select_suitable_device(instance: &Instance) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(VulkanError::Api)? };

        for device in devices {
            match Self::evaluate_device(instance, device) {
                Ok(info) => {
                    log::info!("Selected GPU: {}", info.name());
                    return Ok(info);
                }
                Err(e) => log::debug!("Skipping physical device: {e}"),
            }
        }

        Err(VulkanError::InitializationFailed(
            "No GPU with acceleration structure support found".to_string(),
        ))
    }

    fn evaluate_device(instance: &Instance, device: vk::PhysicalDevice) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let queue_family = queue_families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .map(|index| index as u32)
            .ok_or_else(|| VulkanError::InitializationFailed("No compute queue family found".to_string()))?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let missing: Vec<&CStr> = required_device_extensions()
            .into_iter()
            .filter(|required| {
                !extensions.iter().any(|available| {
                    let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
                    name == *required
                })
            })
            .collect();
        if !missing.is_empty() {
            return Err(VulkanError::InitializationFailed(format!(
                "Missing device extensions: {missing:?}"
            )));
        }

        let mut acceleration_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        {
            let mut properties2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut acceleration_properties);
            unsafe { instance.get_physical_device_properties2(device, &mut properties2) };
        }

        Ok(Self {
            device,
            properties,
            min_scratch_alignment: u64::from(
                acceleration_properties.min_acceleration_structure_scratch_offset_alignment,
            ),
            max_instance_count: acceleration_properties.max_instance_count,
            queue_family,
        })
    }

    /// Device name reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Queue used for uploads and builds
    pub queue: vk::Queue,
    /// Index of the queue family
    pub queue_family: u32,
    /// Acceleration-structure extension loader
    pub acceleration_structure: AccelerationStructure,
}

impl LogicalDevice {
    /// Create a logical device with buffer device address, acceleration
    /// structures and ray-tracing pipelines enabled
    pub fn new(instance: &Instance, physical_device_info: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(physical_device_info.queue_family)
            .queue_priorities(&priorities)
            .build()];

        let required_extensions: Vec<*const std::ffi::c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .scalar_block_layout(true)
            .runtime_descriptor_array(true);
        let mut acceleration_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);
        let device_features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true).build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&device_features)
            .push_next(&mut features12)
            .push_next(&mut acceleration_features)
            .push_next(&mut pipeline_features);

        let device = unsafe {
            instance
                .create_device(physical_device_info.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };
        let queue = unsafe { device.get_device_queue(physical_device_info.queue_family, 0) };
        let acceleration_structure = AccelerationStructure::new(instance, &device);

        Ok(Self {
            device,
            queue,
            queue_family: physical_device_info.queue_family,
            acceleration_structure,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Instance, physical device and logical device of a headless renderer
///
/// Fields drop in declaration order: the logical device before the instance.
pub struct VulkanContext {
    /// Logical device for operations
    pub device: LogicalDevice,
    /// Selected physical device information
    pub physical_device: PhysicalDeviceInfo,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Create a context from device configuration
    pub fn new(config: &DeviceConfig) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(&config.application_name, config.validation_enabled())?;
        let physical_device = PhysicalDeviceInfo::select_suitable_device(&instance.instance)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        log::info!(
            "Vulkan context ready (queue family {}, scratch alignment {})",
            device.queue_family,
            physical_device.min_scratch_alignment
        );

        Ok(Self {
            device,
            physical_device,
            instance,
        })
    }

    /// Get a reference to the Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Get the raw Device handle
    pub fn raw_device(&self) -> &Device {
        &self.device.device
    }
}
