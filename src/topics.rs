#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
}

impl Topics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Topics {
            namespace: namespace.into(),
        }
    }

    pub fn telemetry_wildcard(&self) -> String {
        format!("{}/rooms/+/telemetry", self.namespace)
    }

    pub fn device_subscription(&self, room: &str) -> String {
        format!("{}/devices/+/{}", self.namespace, room)
    }

    pub fn active_scan_set(&self, room: &str) -> String {
        self.room_setting(room, "active_scan")
    }

    pub fn absorption_set(&self, room: &str) -> String {
        self.room_setting(room, "absorption")
    }

    pub fn max_distance_set(&self, room: &str) -> String {
        self.room_setting(room, "max_distance")
    }

    fn room_setting(&self, room: &str, setting: &str) -> String {
        format!("{}/rooms/{}/{}/set", self.namespace, room, setting)
    }

    /// Room name of a telemetry topic.
    pub fn match_telemetry<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let room = self
            .strip_namespace(topic)?
            .strip_prefix("rooms/")?
            .strip_suffix("/telemetry")?;
        segment(room)
    }

    /// Device id of a sighting topic published for `room`.
    pub fn match_device<'a>(&self, topic: &'a str, room: &str) -> Option<&'a str> {
        let device = self
            .strip_namespace(topic)?
            .strip_prefix("devices/")?
            .strip_suffix(room)?
            .strip_suffix('/')?;
        segment(device)
    }

    fn strip_namespace<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic.strip_prefix(self.namespace.as_str())?.strip_prefix('/')
    }
}

fn segment(value: &str) -> Option<&str> {
    if value.is_empty() || value.contains('/') {
        None
    } else {
        Some(value)
    }
}
