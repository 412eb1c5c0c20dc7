//! Reading record and the fixed field-name schema.
//!
//! Field order and names are the wire/storage contract shared by the backlog
//! file and the uplink payload: `timestamp`, the 32 register-backed values,
//! then `phase_imbalance`, `meter_id`, `ip_address`.

use crate::error::{DecodeFault, MeterError, Result};

/// Timestamp layout used in payloads and backlog rows (second resolution).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Field names for the register-backed values, in register-map order.
pub const REGISTER_FIELDS: [&str; 32] = [
    "r_vtg",
    "y_vtg",
    "b_vtg",
    "r_curr",
    "y_curr",
    "b_curr",
    "r_active_curr",
    "y_active_curr",
    "b_active_curr",
    "r_reactive_curr",
    "y_reactive_curr",
    "b_reactive_curr",
    "r_pf",
    "y_pf",
    "b_pf",
    "r_active_pwr",
    "y_active_pwr",
    "b_active_pwr",
    "r_react_pwr",
    "y_react_pwr",
    "b_react_pwr",
    "r_apparent_pwr",
    "y_apparent_pwr",
    "b_apparent_pwr",
    "r_vtg_thd",
    "y_vtg_thd",
    "b_vtg_thd",
    "r_curr_thd",
    "y_curr_thd",
    "b_curr_thd",
    "abs_active_energy",
    "total_energy_imp",
];

/// Names of the three phase-current fields used for the imbalance metric.
pub const PHASE_CURRENT_FIELDS: [&str; 3] = ["r_curr", "y_curr", "b_curr"];

/// Complete schema: timestamp, register fields, derived/identity fields.
pub fn field_names() -> Vec<&'static str> {
    let mut names = Vec::with_capacity(REGISTER_FIELDS.len() + 4);
    names.push("timestamp");
    names.extend_from_slice(&REGISTER_FIELDS);
    names.push("phase_imbalance");
    names.push("meter_id");
    names.push("ip_address");
    names
}

/// Total number of fields in a serialized record.
pub fn field_count() -> usize {
    REGISTER_FIELDS.len() + 4
}

/// One complete acquisition cycle's worth of data. Always fully populated:
/// a cycle that cannot fill every field produces no `Reading` at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Wall-clock acquisition time, formatted per [`TIMESTAMP_FORMAT`].
    pub timestamp: String,
    /// Decoded register values, one per [`REGISTER_FIELDS`] entry, in order.
    pub values: Vec<f64>,
    /// max/mean ratio of the three phase currents.
    pub phase_imbalance: f64,
    /// Modbus unit id of the originating meter.
    pub meter_id: u8,
    /// Best-effort address of the host this service runs on.
    pub ip_address: String,
}

impl Reading {
    /// Serialize to a flat text record in schema order.
    ///
    /// f64 values use `Display`, which is shortest-round-trip, so a record
    /// read back from the backlog reproduces the original values exactly.
    pub fn to_record(&self) -> Vec<String> {
        let mut record = Vec::with_capacity(field_count());
        record.push(self.timestamp.clone());
        record.extend(self.values.iter().map(|v| v.to_string()));
        record.push(self.phase_imbalance.to_string());
        record.push(self.meter_id.to_string());
        record.push(self.ip_address.clone());
        record
    }

    /// Parse a flat text record in schema order.
    pub fn from_record(record: &[String]) -> Result<Self> {
        if record.len() != field_count() {
            return Err(MeterError::decode(
                "record",
                DecodeFault::BadField(format!(
                    "expected {} fields, got {}",
                    field_count(),
                    record.len()
                )),
            ));
        }

        let parse_f64 = |field: &'static str, raw: &str| -> Result<f64> {
            raw.parse::<f64>().map_err(|_| {
                MeterError::decode(field, DecodeFault::BadField(raw.to_string()))
            })
        };

        let mut values = Vec::with_capacity(REGISTER_FIELDS.len());
        for (field, raw) in REGISTER_FIELDS.iter().zip(&record[1..]) {
            values.push(parse_f64(field, raw)?);
        }

        let n = REGISTER_FIELDS.len();
        let phase_imbalance = parse_f64("phase_imbalance", &record[1 + n])?;
        let meter_id = record[2 + n].parse::<u8>().map_err(|_| {
            MeterError::decode("meter_id", DecodeFault::BadField(record[2 + n].clone()))
        })?;

        Ok(Reading {
            timestamp: record[0].clone(),
            values,
            phase_imbalance,
            meter_id,
            ip_address: record[3 + n].clone(),
        })
    }

    /// Flat key-value pairs for the uplink POST body.
    pub fn form_pairs(&self) -> Vec<(&'static str, String)> {
        field_names().into_iter().zip(self.to_record()).collect()
    }
}

#[cfg(test)]
impl Reading {
    /// Test fixture with a recognizable timestamp tag.
    pub(crate) fn sample(tag: &str) -> Self {
        Reading {
            timestamp: tag.to_string(),
            values: (0..REGISTER_FIELDS.len()).map(|i| i as f64 * 1.5 + 0.25).collect(),
            phase_imbalance: 1.125,
            meter_id: 101,
            ip_address: "10.0.0.5".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_shape() {
        let names = field_names();
        assert_eq!(names.len(), 36);
        assert_eq!(names[0], "timestamp");
        assert_eq!(names[1], "r_vtg");
        assert_eq!(names[33], "phase_imbalance");
        assert_eq!(names[35], "ip_address");
    }

    #[test]
    fn record_round_trip() {
        let reading = Reading::sample("2024-03-01 12:00:00");
        let record = reading.to_record();
        assert_eq!(record.len(), field_count());

        let parsed = Reading::from_record(&record).unwrap();
        assert_eq!(parsed, reading);
    }

    #[test]
    fn record_round_trip_preserves_awkward_floats() {
        let mut reading = Reading::sample("2024-03-01 12:00:01");
        reading.values[0] = 0.1 + 0.2; // 0.30000000000000004
        reading.values[31] = 123456789.123456;
        let parsed = Reading::from_record(&reading.to_record()).unwrap();
        assert_eq!(parsed.values[0], reading.values[0]);
        assert_eq!(parsed.values[31], reading.values[31]);
    }

    #[test]
    fn short_record_rejected() {
        let record = vec!["2024-03-01 12:00:00".to_string()];
        assert!(Reading::from_record(&record).is_err());
    }

    #[test]
    fn unparseable_value_rejected() {
        let mut record = Reading::sample("t").to_record();
        record[5] = "not-a-number".to_string();
        assert!(Reading::from_record(&record).is_err());
    }

    #[test]
    fn form_pairs_follow_schema_order() {
        let reading = Reading::sample("2024-03-01 12:00:00");
        let pairs = reading.form_pairs();
        assert_eq!(pairs.len(), 36);
        assert_eq!(pairs[0].0, "timestamp");
        assert_eq!(pairs[0].1, "2024-03-01 12:00:00");
        assert_eq!(pairs[34].0, "meter_id");
        assert_eq!(pairs[34].1, "101");
    }
}
