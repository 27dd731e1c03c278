//! Active device/channel/object selection supplied by the host application

use std::collections::{BTreeMap, BTreeSet};

/// Static description of the active device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Device name, possibly with a `-Set` suffix
    pub name: String,
    /// Raw log extensions the device parser understands, lowercase
    pub import_extensions: BTreeSet<String>,
    /// Channels recorded together; a channel outside every group mixes only with itself
    pub channel_mixes: Vec<BTreeSet<u32>>,
    /// Display labels used to name raw import recordsets
    pub channel_labels: BTreeMap<u32, String>,
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            import_extensions: BTreeSet::new(),
            channel_mixes: Vec::new(),
            channel_labels: BTreeMap::new(),
        }
    }

    pub fn with_import_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.import_extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_channel_mix<I: IntoIterator<Item = u32>>(mut self, channels: I) -> Self {
        self.channel_mixes.push(channels.into_iter().collect());
        self
    }

    pub fn with_channel_label(mut self, channel: u32, label: impl Into<String>) -> Self {
        self.channel_labels.insert(channel, label.into());
        self
    }

    /// Device name without the `-Set` suffix; also the device folder name
    pub fn pure_name(&self) -> &str {
        self.name.strip_suffix("-Set").unwrap_or(&self.name)
    }

    /// Channels mixed with `channel`, always including `channel` itself
    pub fn channel_mix_numbers(&self, channel: u32) -> BTreeSet<u32> {
        let mut mix = self
            .channel_mixes
            .iter()
            .find(|group| group.contains(&channel))
            .cloned()
            .unwrap_or_default();
        mix.insert(channel);
        mix
    }

    pub fn channel_label(&self, channel: u32) -> String {
        self.channel_labels
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| format!("Channel {}", channel))
    }
}

/// Read-only selection snapshot taken once per rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveContext {
    pub device: DeviceProfile,
    pub channel_number: u32,
    /// Empty when no object is selected
    pub object_key: String,
    /// Object keys known to the application
    pub realized_object_keys: BTreeSet<String>,
    pub retrospect_months: u32,
    /// Accept trusses whose object key does not match the active one
    pub ignore_log_object_key: bool,
}

impl ActiveContext {
    pub fn new(device: DeviceProfile, channel_number: u32) -> Self {
        Self {
            device,
            channel_number,
            object_key: String::new(),
            realized_object_keys: BTreeSet::new(),
            retrospect_months: 12,
            ignore_log_object_key: false,
        }
    }

    pub fn with_object_key(mut self, object_key: impl Into<String>) -> Self {
        self.object_key = object_key.into();
        if !self.object_key.is_empty() {
            self.realized_object_keys.insert(self.object_key.clone());
        }
        self
    }

    pub fn with_realized_object_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.realized_object_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_retrospect_months(mut self, months: u32) -> Self {
        self.retrospect_months = months;
        self
    }

    pub fn with_ignore_log_object_key(mut self, ignore: bool) -> Self {
        self.ignore_log_object_key = ignore;
        self
    }

    pub fn has_object_key(&self) -> bool {
        !self.object_key.is_empty()
    }

    pub fn channel_mix_numbers(&self) -> BTreeSet<u32> {
        self.device.channel_mix_numbers(self.channel_number)
    }
}

/// Source of the active context, queried at the start of each rebuild
pub trait ContextProvider {
    fn active_context(&self) -> ActiveContext;
}

impl ContextProvider for ActiveContext {
    fn active_context(&self) -> ActiveContext {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pure_name_strips_set_suffix() {
        assert_eq!(DeviceProfile::new("UniLog2-Set").pure_name(), "UniLog2");
        assert_eq!(DeviceProfile::new("HoTTViewer").pure_name(), "HoTTViewer");
    }

    #[test]
    fn test_channel_mix_numbers() {
        let device = DeviceProfile::new("Dev").with_channel_mix([1, 2]);
        assert_eq!(device.channel_mix_numbers(2), BTreeSet::from([1, 2]));
        assert_eq!(device.channel_mix_numbers(3), BTreeSet::from([3]));
    }

    #[test]
    fn test_import_extensions_normalized() {
        let device = DeviceProfile::new("Dev").with_import_extensions([".BIN", "log"]);
        assert!(device.import_extensions.contains("bin"));
        assert!(device.import_extensions.contains("log"));
    }

    #[test]
    fn test_object_key_is_realized() {
        let ctx = ActiveContext::new(DeviceProfile::new("Dev"), 1).with_object_key("Plane");
        assert!(ctx.has_object_key());
        assert!(ctx.realized_object_keys.contains("Plane"));
    }
}
