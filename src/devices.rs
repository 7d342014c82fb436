use std::collections::HashMap;
use std::fmt::Display;

/// Device string reserved for sharded data and executions that span every local device. Sharded arrays and the
/// outputs of replicated executions are tagged with this virtual device instead of a physical one.
pub const SPMD_DEVICE: &str = "SPMD:0";

/// Identifier that the underlying driver assigns to a device. Driver ids are unique but possibly sparse
/// (e.g., `0, 2, 5`); dense ordinals are assigned by the [`DeviceRegistry`].
pub type DeviceId = i32;

/// Represents a constant attribute value reported for a [`Device`] (e.g., core counts or memory sizes).
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub enum AttributeValue {
    Bool(bool),
    I64(i64),
    I64List(Vec<i64>),
    F32(f32),
    String(String),
}

impl Display for AttributeValue {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(value) => write!(formatter, "{value}"),
            Self::I64(value) => write!(formatter, "{value}"),
            Self::I64List(value) => write!(formatter, "{value:?}"),
            Self::F32(value) => write!(formatter, "{value}"),
            Self::String(value) => write!(formatter, "\"{value}\""),
        }
    }
}

/// Represents a named [`AttributeValue`] reported for a [`Device`].
#[derive(Clone, Debug, PartialEq)]
pub struct NamedAttribute {
    /// Name of the attribute.
    pub name: String,

    /// Underlying attribute value.
    pub value: AttributeValue,
}

impl NamedAttribute {
    /// Creates a new [`NamedAttribute`] with the provided name and value.
    pub fn new<S: Into<String>, V: Into<AttributeValue>>(name: S, value: V) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<Vec<i64>> for AttributeValue {
    fn from(value: Vec<i64>) -> Self {
        Self::I64List(value)
    }
}

impl From<f32> for AttributeValue {
    fn from(value: f32) -> Self {
        Self::F32(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

/// Device enumerated by the underlying driver.
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    /// Driver-assigned [`DeviceId`] of this device. Unique, but possibly sparse across the device set.
    pub id: DeviceId,

    /// Index of the process that can address this device. In a single-process setting this is always `0`.
    pub process_index: usize,

    /// Attributes reported for this device by the driver.
    pub attributes: Vec<NamedAttribute>,
}

impl Device {
    /// Creates a new [`Device`] with the provided driver id and owning process index, and no attributes.
    pub fn new(id: DeviceId, process_index: usize) -> Self {
        Self { id, process_index, attributes: Vec::new() }
    }

    /// Returns the [`AttributeValue`] with the provided name, if this device reports one.
    pub fn attribute<S: AsRef<str>>(&self, name: S) -> Option<&AttributeValue> {
        let name = name.as_ref();
        self.attributes.iter().find(|attribute| attribute.name == name).map(|attribute| &attribute.value)
    }
}

/// Maintains the bijection between driver devices and the `"<PLATFORM>:<ordinal>"` device strings that the public
/// API speaks. Global ordinals are dense and `0`-based: they are assigned by sorting the driver ids in ascending
/// order at construction, so the mapping is a pure function of the enumerated device set and is stable for the
/// registry's lifetime.
///
/// # Fatal checks
///
/// Constructing a registry over zero devices, looking up a device string that was never produced by this registry,
/// and mapping a driver id that was never enumerated are all contract violations and panic.
pub struct DeviceRegistry {
    /// Uppercase platform name used as the prefix of every device string.
    platform: String,

    /// Enumerated devices sorted by ascending driver id; the index of a device in this vector is its global ordinal.
    devices: Vec<Device>,

    /// Global ordinal of each enumerated driver id.
    ordinals: HashMap<DeviceId, usize>,

    /// Index of the process this registry was constructed for.
    process_index: usize,

    /// Device strings of the devices addressable by this process, in ordinal order.
    local_devices: Vec<String>,

    /// Device strings of every enumerated device, in ordinal order.
    all_devices: Vec<String>,
}

impl DeviceRegistry {
    /// Creates a new [`DeviceRegistry`] over the provided enumerated devices, for the process with the provided
    /// index. Panics if `devices` is empty.
    pub fn new<S: Into<String>>(platform: S, mut devices: Vec<Device>, process_index: usize) -> Self {
        if devices.is_empty() {
            panic!("device registry requires at least one enumerated device");
        }
        let platform = platform.into().to_uppercase();
        devices.sort_by_key(|device| device.id);
        let ordinals = devices.iter().enumerate().map(|(ordinal, device)| (device.id, ordinal)).collect();
        let all_devices: Vec<String> =
            (0..devices.len()).map(|ordinal| format!("{platform}:{ordinal}")).collect();
        let local_devices = devices
            .iter()
            .enumerate()
            .filter(|(_, device)| device.process_index == process_index)
            .map(|(ordinal, _)| all_devices[ordinal].clone())
            .collect();
        Self { platform, devices, ordinals, process_index, local_devices, all_devices }
    }

    /// Returns the uppercase platform name used as the prefix of every device string.
    pub fn platform(&self) -> &str {
        self.platform.as_str()
    }

    /// Returns the device string of the device with the provided driver id.
    /// Panics if the id was never enumerated.
    pub fn device_to_string(&self, id: DeviceId) -> &str {
        match self.ordinals.get(&id) {
            Some(ordinal) => self.all_devices[*ordinal].as_str(),
            None => panic!("device id {id} was not enumerated by this registry"),
        }
    }

    /// Returns the [`Device`] named by the provided device string. Panics if the string was never produced
    /// by this registry.
    pub fn string_to_device<S: AsRef<str>>(&self, device: S) -> &Device {
        let device = device.as_ref();
        match self.all_devices.iter().position(|candidate| candidate == device) {
            Some(ordinal) => &self.devices[ordinal],
            None => panic!("unknown device '{device}'"),
        }
    }

    /// Returns the global ordinal of the device named by the provided device string. Panics if the string was
    /// never produced by this registry.
    pub fn ordinal<S: AsRef<str>>(&self, device: S) -> usize {
        let device = device.as_ref();
        match self.all_devices.iter().position(|candidate| candidate == device) {
            Some(ordinal) => ordinal,
            None => panic!("unknown device '{device}'"),
        }
    }

    /// Returns the device strings of the devices addressable by this process, in ordinal order.
    pub fn local_devices(&self) -> &[String] {
        self.local_devices.as_slice()
    }

    /// Returns the device strings of every enumerated device, in ordinal order.
    pub fn all_devices(&self) -> &[String] {
        self.all_devices.as_slice()
    }

    /// Returns the device string of the default device (i.e., the first device addressable by this process).
    pub fn default_device(&self) -> &str {
        self.local_devices[0].as_str()
    }

    /// Returns the number of enumerated devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Returns the index of the process this registry was constructed for.
    pub fn process_index(&self) -> usize {
        self.process_index
    }

    /// Returns the number of processes that participate in the device set (i.e., the maximum enumerated
    /// process index plus one).
    pub fn process_count(&self) -> usize {
        self.devices.iter().map(|device| device.process_index).max().map_or(1, |index| index + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_ordinals_with_sparse_ids() {
        let devices = vec![Device::new(5, 0), Device::new(2, 0), Device::new(9, 0)];
        let registry = DeviceRegistry::new("cpu", devices.clone(), 0);
        assert_eq!(registry.platform(), "CPU");
        assert_eq!(registry.device_to_string(2), "CPU:0");
        assert_eq!(registry.device_to_string(5), "CPU:1");
        assert_eq!(registry.device_to_string(9), "CPU:2");
        assert_eq!(registry.string_to_device("CPU:1").id, 5);
        assert_eq!(registry.ordinal("CPU:2"), 2);

        // Re-deriving the registry over a permutation of the same device set yields the same mapping.
        let mut shuffled = devices;
        shuffled.reverse();
        let rederived = DeviceRegistry::new("cpu", shuffled, 0);
        for id in [2, 5, 9] {
            assert_eq!(rederived.device_to_string(id), registry.device_to_string(id));
        }
    }

    #[test]
    fn test_registry_local_and_all_devices() {
        let devices = vec![Device::new(0, 0), Device::new(1, 0), Device::new(2, 1), Device::new(3, 1)];
        let registry = DeviceRegistry::new("cpu", devices, 1);
        assert_eq!(registry.all_devices(), &["CPU:0", "CPU:1", "CPU:2", "CPU:3"]);
        assert_eq!(registry.local_devices(), &["CPU:2", "CPU:3"]);
        assert_eq!(registry.default_device(), "CPU:2");
        assert_eq!(registry.device_count(), 4);
        assert_eq!(registry.process_count(), 2);
    }

    #[test]
    fn test_device_attributes() {
        let mut device = Device::new(0, 0);
        device.attributes.push(NamedAttribute::new("num_cores", 8i64));
        device.attributes.push(NamedAttribute::new("kind", "host"));
        assert_eq!(device.attribute("num_cores"), Some(&AttributeValue::I64(8)));
        assert_eq!(device.attribute("kind"), Some(&AttributeValue::String("host".to_string())));
        assert_eq!(device.attribute("missing"), None);
    }

    #[test]
    #[should_panic(expected = "at least one enumerated device")]
    fn test_registry_requires_devices() {
        DeviceRegistry::new("cpu", Vec::new(), 0);
    }

    #[test]
    #[should_panic(expected = "unknown device 'CPU:9'")]
    fn test_registry_unknown_device_string_panics() {
        let registry = DeviceRegistry::new("cpu", vec![Device::new(0, 0)], 0);
        registry.string_to_device("CPU:9");
    }

    #[test]
    #[should_panic(expected = "was not enumerated")]
    fn test_registry_unknown_device_id_panics() {
        let registry = DeviceRegistry::new("cpu", vec![Device::new(0, 0)], 0);
        registry.device_to_string(7);
    }
}
