// Vulkan rendering instance
//
// This holds the common instance code for the Vulkan context: the
// entry loader, the instance itself and the debug messenger used when
// validation is requested.

use ash::extensions::ext;
use ash::{vk, Entry};
use raw_window_handle::HasRawDisplayHandle;

use crate::{Result, TormentaError};

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

// this happy little debug callback is from the ash examples
// all it does is print any errors/warnings thrown.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    let message = CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message);
    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}] {:?}", message_types, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}] {:?}", message_types, message);
    } else {
        log::debug!("[VK][{:?}] {:?}", message_types, message);
    }
    vk::FALSE
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to find a
/// device and surface which the renderer will present on.
pub struct Instance {
    /// debug callback sugar mentioned earlier
    i_debug_loader: Option<ext::DebugUtils>,
    i_debug_callback: vk::DebugUtilsMessengerEXT,

    /// the entry just loads function pointers from the dynamic library
    pub(crate) i_loader: Entry,
    /// the big vulkan instance.
    pub(crate) i_inst: ash::Instance,
    pub(crate) i_debug_enabled: bool,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (ext::DebugUtils, vk::DebugUtilsMessengerEXT) {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .unwrap()
        };
        (dr_loader, callback)
    }

    fn validation_available(entry: &Entry) -> bool {
        let props = match entry.enumerate_instance_layer_properties() {
            Ok(props) => props,
            Err(_) => return false,
        };

        props.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name.to_bytes() == b"VK_LAYER_KHRONOS_validation"
        })
    }

    /// Create a vkInstance
    ///
    /// This enables the surface extensions for the target display
    /// plus debug utils when validation is requested. Requesting
    /// validation without the layers installed is an error, silently
    /// dropping it would hide the misconfiguration.
    pub fn new(info: &crate::CreateInfo) -> Result<Self> {
        let entry = Entry::linked();
        let app_name = CString::new("tormenta").unwrap();

        let debug = info.debug_mode;
        if debug && !Self::validation_available(&entry) {
            log::error!("Validation layers requested but VK_LAYER_KHRONOS_validation is missing");
            return Err(TormentaError::VALIDATION_NOT_PRESENT);
        }

        let layer_names: Vec<CString> = if debug {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            Vec::new()
        };
        let layer_names_raw: Vec<*const i8> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let mut extension_names_raw =
            ash_window::enumerate_required_extensions(info.display.raw_display_handle())
                .or(Err(TormentaError::VK_SURF_NOT_SUPPORTED))?
                .to_vec();
        if debug {
            extension_names_raw.push(ext::DebugUtils::name().as_ptr());
        }

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(info.app_version)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw);

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .or(Err(TormentaError::UNKNOWN))?
        };

        let (debug_loader, debug_callback) = if debug {
            let (loader, callback) = Self::setup_debug(&entry, &instance);
            (Some(loader), callback)
        } else {
            (None, vk::DebugUtilsMessengerEXT::null())
        };

        Ok(Self {
            i_loader: entry,
            i_inst: instance,
            i_debug_loader: debug_loader,
            i_debug_callback: debug_callback,
            i_debug_enabled: debug,
        })
    }

    /// Label a Vulkan object in validation and capture tools.
    pub(crate) fn set_object_name<H: vk::Handle>(
        &self,
        dev: &ash::Device,
        handle: H,
        name: &str,
    ) {
        let loader = match &self.i_debug_loader {
            Some(loader) => loader,
            None => return,
        };
        if name.is_empty() {
            return;
        }

        let cname = match CString::new(name) {
            Ok(cname) => cname,
            Err(_) => return,
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&cname);

        unsafe {
            let _ = loader.set_debug_utils_object_name(dev.handle(), &info);
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(loader) = &self.i_debug_loader {
                loader.destroy_debug_utils_messenger(self.i_debug_callback, None);
            }
            self.i_inst.destroy_instance(None);
        }
    }
}
