use anyhow::ensure;
use serde_derive::{Deserialize, Serialize};

/// Raw event handed from the MQTT event loop to the manager.
#[derive(Clone, Debug)]
pub enum Inbound {
    Connected,
    Publish { topic: String, payload: Vec<u8> },
}

/// Health report of a node, published on its room's telemetry topic.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub ip: String,
    pub firm: String,
    pub uptime: u64,
    pub rssi: f64,
    pub ver: String,
    pub adverts: Option<u64>,
    pub seen: Option<u64>,
    pub reported: Option<u64>,
    pub free_heap: Option<u64>,
    pub max_alloc_heap: Option<u64>,
    pub mem_frag: Option<f64>,
    pub reset_reason: Option<String>,
    pub scan_high_water: Option<u64>,
    pub report_high_water: Option<u64>,
}

/// A single sighting of a device by a room's node.
#[allow(dead_code)]
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceSighting {
    pub id: String,
    pub rssi: f64,
    pub distance: f64,
    pub mac: String,
    pub name: Option<String>,
    pub disc: Option<String>,
    #[serde(rename = "idType")]
    pub id_type: Option<f64>,
    #[serde(rename = "rssi@1m")]
    pub rssi_at_1m: Option<f64>,
    pub raw: Option<f64>,
    pub speed: Option<f64>,
    pub interval: Option<f64>,
}

impl Telemetry {
    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl DeviceSighting {
    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        let sighting: DeviceSighting = serde_json::from_slice(payload)?;
        ensure!(!sighting.id.is_empty(), "device sighting without id");
        Ok(sighting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_telemetry() {
        let payload = br#"{"ip":"192.168.1.40","uptime":1234,"firm":"esp32","rssi":-61,"ver":"v3.1.2","adverts":80,"seen":12,"reported":3,"freeHeap":120000,"maxAllocHeap":64000,"memFrag":12.5,"resetReason":"Power on","scanHighWater":1024,"reportHighWater":900}"#;
        let telemetry = Telemetry::decode(payload).unwrap();
        assert_eq!(telemetry.ip, "192.168.1.40");
        assert_eq!(telemetry.firm, "esp32");
        assert_eq!(telemetry.rssi, -61.0);
        assert_eq!(telemetry.free_heap, Some(120000));
        assert_eq!(telemetry.reset_reason.as_deref(), Some("Power on"));
    }

    #[test]
    fn test_telemetry_requires_identity_fields() {
        assert!(Telemetry::decode(br#"{"ip":"10.0.0.2","firm":"esp32","uptime":3,"rssi":-50}"#).is_err());
        assert!(Telemetry::decode(b"online").is_err());
        assert!(
            Telemetry::decode(br#"{"ip":"10.0.0.2","firm":"esp32","uptime":3,"rssi":-50,"ver":"1"}"#)
                .is_ok()
        );
    }

    #[test]
    fn test_decode_sighting() {
        let payload = br#"{"id":"apple:iphone10-6","disc":"ad","idType":105,"rssi@1m":-65,"rssi":-72,"raw":2.37,"distance":1.9,"speed":0.02,"mac":"4a1b2c3d4e5f","interval":210}"#;
        let sighting = DeviceSighting::decode(payload).unwrap();
        assert_eq!(sighting.id, "apple:iphone10-6");
        assert_eq!(sighting.rssi_at_1m, Some(-65.0));
        assert_eq!(sighting.id_type, Some(105.0));
        assert_eq!(sighting.distance, 1.9);
    }

    #[test]
    fn test_sighting_validation() {
        assert!(DeviceSighting::decode(br#"{"id":"","rssi":-70,"distance":1,"mac":"aa"}"#).is_err());
        assert!(DeviceSighting::decode(br#"{"id":"x","rssi":-70,"mac":"aa"}"#).is_err());
        assert!(DeviceSighting::decode(br#"{"id":"x","rssi":"loud","distance":1,"mac":"aa"}"#).is_err());
        assert!(DeviceSighting::decode(b"{not json").is_err());
        assert!(DeviceSighting::decode(br#"{"id":"x","rssi":-70,"distance":1,"mac":"aa"}"#).is_ok());
    }

    #[test]
    fn test_fractional_raw_fields_accepted() {
        let sighting = DeviceSighting::decode(
            br#"{"id":"tile:1","rssi":-80,"distance":3.2,"mac":"aa","idType":5.0,"interval":98.5}"#,
        )
        .unwrap();
        assert_eq!(sighting.interval, Some(98.5));
    }
}
