//! Vulkan instance creation.
//!
//! The instance enables exactly what presenting to a window needs:
//! `VK_KHR_surface`, the platform surface extensions reported by the
//! windowing layer, and, when requested and installed, the Khronos
//! validation layer with its messages routed into `tracing`.
//!
//! # Example
//!
//! ```no_run
//! use swapframe_rhi::instance::Instance;
//!
//! # fn example(surface_extensions: &[*const std::ffi::c_char]) -> swapframe_rhi::RhiResult<()> {
//! let instance = Instance::new(surface_extensions, cfg!(debug_assertions))?;
//! let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::ffi::{CStr, c_char, c_void};

use ash::{Entry, vk};
use tracing::{debug, error, info, warn};

use crate::error::RhiResult;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// A loaded Vulkan 1.3 instance.
///
/// The debug messenger, if any, is destroyed before the instance.
pub struct Instance {
    entry: Entry,
    instance: ash::Instance,
    messenger: Option<DebugMessenger>,
}

/// Validation output routed to [`vulkan_message`].
struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    /// Loads Vulkan and creates an instance with `surface_extensions` enabled.
    ///
    /// Missing validation layers are not an error: the instance is created
    /// without them and a warning is logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the Vulkan library cannot be loaded, or instance
    /// or messenger creation fails.
    pub fn new(surface_extensions: &[*const c_char], enable_validation: bool) -> RhiResult<Self> {
        let entry = unsafe { Entry::load()? };

        let validation = enable_validation && layer_available(&entry, VALIDATION_LAYER)?;
        if enable_validation && !validation {
            warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"swapframe")
            .engine_name(c"swapframe")
            .api_version(vk::API_VERSION_1_3);
        let extensions = instance_extensions(surface_extensions, validation);
        let layers: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        let instance = unsafe { entry.create_instance(&create_info, None)? };

        info!(
            "Vulkan 1.3 instance created with {} extension(s), validation {}",
            extensions.len(),
            if validation { "on" } else { "off" }
        );

        let messenger = if validation {
            match DebugMessenger::new(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            messenger,
        })
    }

    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Whether validation messages are being reported.
    #[inline]
    pub fn has_validation(&self) -> bool {
        self.messenger.is_some()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some(messenger) = self.messenger.take() {
            unsafe {
                messenger
                    .loader
                    .destroy_debug_utils_messenger(messenger.handle, None)
            };
        }
        unsafe { self.instance.destroy_instance(None) };
        info!("Vulkan instance destroyed");
    }
}

impl DebugMessenger {
    fn new(entry: &Entry, instance: &ash::Instance) -> RhiResult<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_message));
        let handle = unsafe { loader.create_debug_utils_messenger(&create_info, None)? };
        debug!("Debug messenger created");
        Ok(Self { loader, handle })
    }
}

/// `VK_KHR_surface`, the surface extensions, and `VK_EXT_debug_utils` when
/// validating, each enabled once.
fn instance_extensions(
    surface_extensions: &[*const c_char],
    validation: bool,
) -> Vec<*const c_char> {
    let mut names: Vec<&'static CStr> = vec![ash::khr::surface::NAME];
    // SAFETY: windowing layers report static, null-terminated names.
    names.extend(surface_extensions.iter().map(|&ptr| unsafe { CStr::from_ptr(ptr) }));
    if validation {
        names.push(ash::ext::debug_utils::NAME);
    }

    let mut extensions: Vec<*const c_char> = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        if !names[..i].contains(name) {
            extensions.push(name.as_ptr());
        }
    }
    extensions
}

fn layer_available(entry: &Entry, layer: &CStr) -> RhiResult<bool> {
    let layers = unsafe { entry.enumerate_instance_layer_properties()? };
    Ok(layers
        .iter()
        .any(|properties| {
            properties
                .layer_name_as_c_str()
                .is_ok_and(|name| name == layer)
        }))
}

/// Logs one validation message at the matching level.
unsafe extern "system" fn vulkan_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let data = unsafe { &*data };
    let id = unsafe { lossy(data.p_message_id_name) };
    let message = unsafe { lossy(data.p_message) };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "[{}] {}", id, message);
    } else {
        warn!(target: "vulkan", "[{}] {}", id, message);
    }
    vk::FALSE
}

unsafe fn lossy<'a>(ptr: *const c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed("-")
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
    }
}
