use std::fmt;

use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize,
};
use thiserror::Error;

/// Operating state reported by the vehicle.
///
/// Serializes to the strings the tracking firmware and the dashboards use.
/// English snake_case names are accepted on the way in as well.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationalStatus {
    #[serde(rename = "กำลังวิ่ง", alias = "running")]
    Running,
    #[serde(rename = "รอผู้โดยสาร", alias = "awaiting_passengers")]
    AwaitingPassengers,
    #[serde(rename = "ถึงปลายทาง", alias = "arrived")]
    Arrived,
    #[serde(rename = "หยุดให้บริการ", alias = "off_duty")]
    OffDuty,
}

impl OperationalStatus {
    pub fn label(self) -> &'static str {
        match self {
            OperationalStatus::Running => "running",
            OperationalStatus::AwaitingPassengers => "awaiting passengers",
            OperationalStatus::Arrived => "arrived",
            OperationalStatus::OffDuty => "off-duty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    pub fn new(lat: f64, lng: f64) -> Result<Self, FrameError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(FrameError::Invalid(format!("latitude out of range: {lat}")));
        }
        if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
            return Err(FrameError::Invalid(format!("longitude out of range: {lng}")));
        }
        Ok(Self { lat, lng })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid report JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("report violates invariants: {0}")]
    Invalid(String),
}

/// Wire shape of a report as the device sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportFrame {
    #[serde(deserialize_with = "whole_number")]
    bus_id: u32,
    lat: f64,
    lng: f64,
    status: OperationalStatus,
    #[serde(deserialize_with = "whole_number")]
    passengers: u32,
    speed: f64,
    #[serde(deserialize_with = "whole_number")]
    battery_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gps_valid: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_whole_number"
    )]
    timestamp: Option<u64>,
}

/// Non-negative integer that may arrive in float notation (`85.0`, `1.7e12`).
struct WholeNumber(u64);

impl<'de> Deserialize<'de> for WholeNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct WholeNumberVisitor;

        impl<'de> Visitor<'de> for WholeNumberVisitor {
            type Value = WholeNumber;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a non-negative whole number")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<WholeNumber, E> {
                Ok(WholeNumber(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<WholeNumber, E> {
                u64::try_from(v)
                    .map(WholeNumber)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<WholeNumber, E> {
                // 2^64 is the first float past u64::MAX
                let in_range = v >= 0.0 && v < 18_446_744_073_709_551_616.0;
                if v.is_finite() && in_range && v.fract() == 0.0 {
                    Ok(WholeNumber(v as u64))
                } else {
                    Err(E::invalid_value(de::Unexpected::Float(v), &self))
                }
            }
        }

        deserializer.deserialize_any(WholeNumberVisitor)
    }
}

fn whole_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let WholeNumber(n) = WholeNumber::deserialize(deserializer)?;
    T::try_from(n).map_err(|_| de::Error::custom(format!("{n} is out of range")))
}

fn optional_whole_number<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<WholeNumber>::deserialize(deserializer)?.map(|WholeNumber(n)| n))
}

/// One immutable snapshot of a tracked vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ReportFrame", into = "ReportFrame")]
pub struct TelemetryReport {
    vehicle_id: u32,
    position: Position,
    status: OperationalStatus,
    passenger_count: u32,
    speed_kph: f64,
    battery_percent: u8,
    gps_valid: Option<bool>,
    timestamp: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReportFields {
    pub vehicle_id: u32,
    pub position: Position,
    pub status: OperationalStatus,
    pub passenger_count: u32,
    pub speed_kph: f64,
    pub battery_percent: u8,
    pub gps_valid: Option<bool>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<u64>,
}

impl TelemetryReport {
    pub fn new(fields: ReportFields) -> Result<Self, FrameError> {
        if fields.battery_percent > 100 {
            return Err(FrameError::Invalid(format!(
                "battery level must be within 0..=100, got {}",
                fields.battery_percent
            )));
        }
        if !fields.speed_kph.is_finite() || fields.speed_kph < 0.0 {
            return Err(FrameError::Invalid(format!(
                "speed must be a non-negative number, got {}",
                fields.speed_kph
            )));
        }
        // revalidate so hand-built positions get the same checks as decoded ones
        let position = Position::new(fields.position.lat, fields.position.lng)?;

        Ok(Self {
            vehicle_id: fields.vehicle_id,
            position,
            status: fields.status,
            passenger_count: fields.passenger_count,
            speed_kph: fields.speed_kph,
            battery_percent: fields.battery_percent,
            gps_valid: fields.gps_valid,
            timestamp: fields.timestamp,
        })
    }

    pub fn vehicle_id(&self) -> u32 {
        self.vehicle_id
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn status(&self) -> OperationalStatus {
        self.status
    }

    pub fn passenger_count(&self) -> u32 {
        self.passenger_count
    }

    pub fn speed_kph(&self) -> f64 {
        self.speed_kph
    }

    pub fn battery_percent(&self) -> u8 {
        self.battery_percent
    }

    pub fn gps_valid(&self) -> Option<bool> {
        self.gps_valid
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }
}

impl TryFrom<ReportFrame> for TelemetryReport {
    type Error = FrameError;

    fn try_from(frame: ReportFrame) -> Result<Self, Self::Error> {
        TelemetryReport::new(ReportFields {
            vehicle_id: frame.bus_id,
            position: Position::new(frame.lat, frame.lng)?,
            status: frame.status,
            passenger_count: frame.passengers,
            speed_kph: frame.speed,
            battery_percent: frame.battery_level,
            gps_valid: frame.gps_valid,
            timestamp: frame.timestamp,
        })
    }
}

impl From<TelemetryReport> for ReportFrame {
    fn from(report: TelemetryReport) -> Self {
        ReportFrame {
            bus_id: report.vehicle_id,
            lat: report.position.lat,
            lng: report.position.lng,
            status: report.status,
            passengers: report.passenger_count,
            speed: report.speed_kph,
            battery_level: report.battery_percent,
            gps_valid: report.gps_valid,
            timestamp: report.timestamp,
        }
    }
}

/// Decodes one inbound device frame.
pub fn decode_report(raw: &str) -> Result<TelemetryReport, FrameError> {
    // two steps so invariant violations surface as FrameError::Invalid
    let frame: ReportFrame = serde_json::from_str(raw)?;
    TelemetryReport::try_from(frame)
}

/// Well-known device commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    GetData,
    Emergency,
    Reset,
}

impl DeviceCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceCommand::GetData => "get_data",
            DeviceCommand::Emergency => "emergency",
            DeviceCommand::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandFrame {
    pub command: String,
}

pub fn encode_command(command: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&CommandFrame {
        command: command.to_string(),
    })
}

#[cfg(test)]
pub(crate) fn sample_report(vehicle_id: u32) -> TelemetryReport {
    TelemetryReport::new(ReportFields {
        vehicle_id,
        position: Position {
            lat: 16.4325,
            lng: 103.366,
        },
        status: OperationalStatus::Running,
        passenger_count: 12,
        speed_kph: 30.0,
        battery_percent: 88,
        gps_valid: Some(true),
        timestamp: Some(1_700_000_000_000),
    })
    .expect("sample report is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn decodes_device_frame_with_thai_status() {
        let raw = r#"{"busId":1,"lat":16.4325,"lng":103.366,"status":"รอผู้โดยสาร","passengers":7,"speed":0,"batteryLevel":91,"gpsValid":true,"timestamp":1700000000000}"#;
        let report = decode_report(raw).unwrap();

        assert_eq!(report.vehicle_id(), 1);
        assert_eq!(report.status(), OperationalStatus::AwaitingPassengers);
        assert_eq!(report.passenger_count(), 7);
        assert_eq!(report.battery_percent(), 91);
        assert_eq!(report.gps_valid(), Some(true));
        assert_eq!(report.timestamp(), Some(1_700_000_000_000));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let raw = r#"{"busId":3,"lat":16.4,"lng":103.3,"status":"arrived","passengers":0,"speed":0.0,"batteryLevel":50}"#;
        let report = decode_report(raw).unwrap();

        assert_eq!(report.status(), OperationalStatus::Arrived);
        assert!(report.gps_valid().is_none());
        assert!(report.timestamp().is_none());
    }

    #[test]
    fn integer_fields_accept_float_notation() {
        let raw = r#"{"busId":2.0,"lat":16.4,"lng":103.3,"status":"running","passengers":12.0,"speed":20,"batteryLevel":85.0,"timestamp":1.7e12}"#;
        let report = decode_report(raw).unwrap();

        assert_eq!(report.vehicle_id(), 2);
        assert_eq!(report.passenger_count(), 12);
        assert_eq!(report.battery_percent(), 85);
        assert_eq!(report.timestamp(), Some(1_700_000_000_000));
    }

    #[test]
    fn integer_fields_reject_fractions_and_negatives() {
        let fractional = r#"{"busId":1,"lat":16.4,"lng":103.3,"status":"running","passengers":12.5,"speed":20,"batteryLevel":85}"#;
        let negative = r#"{"busId":1,"lat":16.4,"lng":103.3,"status":"running","passengers":-3,"speed":20,"batteryLevel":85}"#;
        let overflow = r#"{"busId":1,"lat":16.4,"lng":103.3,"status":"running","passengers":1,"speed":20,"batteryLevel":300.0}"#;

        for raw in [fractional, negative, overflow] {
            assert!(matches!(decode_report(raw), Err(FrameError::Json(_))), "{raw}");
        }
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(decode_report("hello"), Err(FrameError::Json(_))));
    }

    #[test]
    fn rejects_unknown_status() {
        let raw = r#"{"busId":1,"lat":16.4,"lng":103.3,"status":"flying","passengers":1,"speed":1,"batteryLevel":50}"#;
        assert!(decode_report(raw).is_err());
    }

    #[test]
    fn rejects_battery_above_hundred() {
        let raw = r#"{"busId":1,"lat":16.4,"lng":103.3,"status":"running","passengers":1,"speed":1,"batteryLevel":150}"#;
        assert!(matches!(decode_report(raw), Err(FrameError::Invalid(_))));
    }

    #[test]
    fn rejects_negative_counts_and_speed() {
        let negative_passengers = r#"{"busId":1,"lat":16.4,"lng":103.3,"status":"running","passengers":-1,"speed":1,"batteryLevel":50}"#;
        let negative_speed = r#"{"busId":1,"lat":16.4,"lng":103.3,"status":"running","passengers":1,"speed":-3.5,"batteryLevel":50}"#;

        assert!(decode_report(negative_passengers).is_err());
        assert!(matches!(
            decode_report(negative_speed),
            Err(FrameError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_latitude() {
        let raw = r#"{"busId":1,"lat":123.0,"lng":103.3,"status":"running","passengers":1,"speed":1,"batteryLevel":50}"#;
        assert!(matches!(decode_report(raw), Err(FrameError::Invalid(_))));
    }

    #[test]
    fn serializes_back_to_device_field_names() {
        let report = sample_report(4);
        let v: Value = serde_json::to_value(&report).unwrap();

        assert_eq!(v["busId"], 4);
        assert_eq!(v["status"], "กำลังวิ่ง");
        assert_eq!(v["batteryLevel"], 88);
        assert_eq!(v["passengers"], 12);
        assert_eq!(v["gpsValid"], true);
    }

    #[test]
    fn validated_deserialize_matches_decode() {
        let v = json!({
            "busId": 2, "lat": 16.43, "lng": 103.36, "status": "off_duty",
            "passengers": 0, "speed": 0, "batteryLevel": 100
        });
        let report: TelemetryReport = serde_json::from_value(v).unwrap();
        assert_eq!(report.status(), OperationalStatus::OffDuty);

        let bad = json!({
            "busId": 2, "lat": 16.43, "lng": 103.36, "status": "off_duty",
            "passengers": 0, "speed": 0, "batteryLevel": 101
        });
        assert!(serde_json::from_value::<TelemetryReport>(bad).is_err());
    }

    #[test]
    fn command_frame_shape() {
        let encoded = encode_command(DeviceCommand::Emergency.as_str()).unwrap();
        assert_eq!(encoded, r#"{"command":"emergency"}"#);
    }
}
