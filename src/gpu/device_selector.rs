use std::ffi::CStr;

use ash::vk;
use ash::Entry;

use super::error::{GPUError, Result};

#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceType {
    Dedicated,
    Integrated,
    #[default]
    Other,
}

impl From<vk::PhysicalDeviceType> for DeviceType {
    fn from(value: vk::PhysicalDeviceType) -> Self {
        match value {
            vk::PhysicalDeviceType::DISCRETE_GPU => DeviceType::Dedicated,
            vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceType::Integrated,
            _ => DeviceType::Other,
        }
    }
}

#[derive(Default, Clone, Debug)]
pub struct AdapterInfo {
    pub name: String,
    pub kind: DeviceType,
    pub driver_version: u32,
    /// Sum of all DEVICE_LOCAL heap sizes.
    pub local_memory_bytes: u64,
    pub display_capable: bool,
}

#[derive(Default, Clone)]
pub struct SelectedDevice {
    pub(crate) device_id: usize,
    pub info: AdapterInfo,
}

impl std::fmt::Display for SelectedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[Name {} -- Driver Ver {} -- ID {}]",
            self.info.name, self.info.driver_version, self.device_id
        )
    }
}

pub struct DeviceSelector {
    devices: Vec<AdapterInfo>,
}

impl DeviceSelector {
    /// Enumerates adapters with a throwaway instance. The real instance is
    /// created later by the device with the chosen id.
    pub fn new() -> Result<DeviceSelector> {
        let app_info = vk::ApplicationInfo {
            api_version: vk::make_api_version(0, 1, 2, 0),
            ..Default::default()
        };

        let entry = unsafe { Entry::load() }?;
        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::builder().application_info(&app_info),
                None,
            )
        }?;

        let mut infos: Vec<AdapterInfo> = Vec::new();
        let pdevices = unsafe { instance.enumerate_physical_devices()? };
        for device in pdevices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let mem = unsafe { instance.get_physical_device_memory_properties(device) };
            let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;

            let local_memory_bytes = mem.memory_heaps[..mem.memory_heap_count as usize]
                .iter()
                .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
                .map(|h| h.size)
                .sum();

            let display_capable = extensions.iter().any(|ext| unsafe {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    == ash::extensions::khr::Swapchain::name()
            });

            infos.push(AdapterInfo {
                name: unsafe {
                    CStr::from_ptr(props.device_name.as_ptr())
                        .to_str()
                        .unwrap_or("UNKNOWN")
                        .to_string()
                },
                kind: props.device_type.into(),
                driver_version: props.driver_version,
                local_memory_bytes,
                display_capable,
            });
        }

        unsafe { instance.destroy_instance(None) };
        Ok(Self { devices: infos })
    }

    pub fn devices(&self) -> &[AdapterInfo] {
        &self.devices
    }

    pub fn select_by_id(&self, id: usize) -> SelectedDevice {
        SelectedDevice {
            device_id: id,
            info: self.devices[id].clone(),
        }
    }

    /// Automatic primary selection: dedicated beats integrated beats other,
    /// with local memory size descending as the tie-break.
    pub fn select_primary(&self) -> Result<SelectedDevice> {
        let id = primary_index(&self.devices).ok_or(GPUError::NoSuitableDevice)?;
        let selected = self.select_by_id(id);
        log::info!("selected primary gpu {}", selected);
        Ok(selected)
    }
}

fn kind_rank(kind: DeviceType) -> u8 {
    match kind {
        DeviceType::Dedicated => 2,
        DeviceType::Integrated => 1,
        DeviceType::Other => 0,
    }
}

fn primary_index(devices: &[AdapterInfo]) -> Option<usize> {
    devices
        .iter()
        .enumerate()
        .max_by_key(|(_, d)| (kind_rank(d.kind), d.local_memory_bytes))
        .map(|(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(kind: DeviceType, mem: u64) -> AdapterInfo {
        AdapterInfo {
            name: String::new(),
            kind,
            driver_version: 0,
            local_memory_bytes: mem,
            display_capable: true,
        }
    }

    #[test]
    fn dedicated_wins_over_bigger_integrated() {
        let devices = [
            adapter(DeviceType::Integrated, 16 << 30),
            adapter(DeviceType::Dedicated, 4 << 30),
        ];
        assert_eq!(primary_index(&devices), Some(1));
    }

    #[test]
    fn memory_breaks_ties_descending() {
        let devices = [
            adapter(DeviceType::Dedicated, 4 << 30),
            adapter(DeviceType::Dedicated, 12 << 30),
            adapter(DeviceType::Dedicated, 8 << 30),
        ];
        assert_eq!(primary_index(&devices), Some(1));
    }

    #[test]
    fn empty_enumeration_selects_nothing() {
        assert_eq!(primary_index(&[]), None);
    }
}
