// Store paths shared by the firmware and the backend rules.

pub const PATH_SWITCH: &str = "controls/switch";
pub const PATH_TEMPERATURE: &str = "sensors/temperature";
pub const PATH_HUMIDITY: &str = "sensors/humidity";
