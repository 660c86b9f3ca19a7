//! Telemetry field set and line decoding.
//!
//! The stream pushes one comma-separated line per update. Values are
//! positional: the first is always the timestamp in epoch milliseconds,
//! followed by the requested fields in request order.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DecodeError;

/// A named value the streaming endpoint can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamField {
    Timestamp,
    Odometer,
    Speed,
    Soc,
    Elevation,
    EstHeading,
    EstLat,
    EstLng,
    Power,
    ShiftState,
    Range,
    EstRange,
    Heading,
}

/// Every field, in the order the full feed reports them.
pub const FIELD_ORDER: [StreamField; 13] = [
    StreamField::Timestamp,
    StreamField::Odometer,
    StreamField::Speed,
    StreamField::Soc,
    StreamField::Elevation,
    StreamField::EstHeading,
    StreamField::EstLat,
    StreamField::EstLng,
    StreamField::Power,
    StreamField::ShiftState,
    StreamField::Range,
    StreamField::EstRange,
    StreamField::Heading,
];

impl StreamField {
    /// Name used in the `values=` query parameter.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Odometer => "odometer",
            Self::Speed => "speed",
            Self::Soc => "soc",
            Self::Elevation => "elevation",
            Self::EstHeading => "est_heading",
            Self::EstLat => "est_lat",
            Self::EstLng => "est_lng",
            Self::Power => "power",
            Self::ShiftState => "shift_state",
            Self::Range => "range",
            Self::EstRange => "est_range",
            Self::Heading => "heading",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        FIELD_ORDER.into_iter().find(|f| f.wire_name() == name)
    }
}

impl fmt::Display for StreamField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Ordered list of fields a session subscribes to. Always starts with
/// [`StreamField::Timestamp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSet {
    fields: Vec<StreamField>,
}

impl Default for FieldSet {
    fn default() -> Self {
        Self {
            fields: FIELD_ORDER.to_vec(),
        }
    }
}

impl FieldSet {
    /// Build a field set in the given order. The timestamp is moved to
    /// the front (or added) and duplicates are dropped.
    pub fn new(fields: impl IntoIterator<Item = StreamField>) -> Self {
        let mut ordered = vec![StreamField::Timestamp];
        for field in fields {
            if !ordered.contains(&field) {
                ordered.push(field);
            }
        }
        Self { fields: ordered }
    }

    pub fn fields(&self) -> &[StreamField] {
        &self.fields
    }

    /// Number of values on every well-formed line.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value of the `values=` query parameter. The server adds the
    /// timestamp on its own, so it is not requested.
    pub fn query_values(&self) -> String {
        self.fields[1..]
            .iter()
            .map(|f| f.wire_name())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Decode one line against this field set.
    ///
    /// # Errors
    /// [`DecodeError::Arity`] when the value count differs from the field
    /// count, [`DecodeError::BadToken`] when the timestamp is not an integer.
    pub fn decode(&self, line: &str) -> Result<StreamRecord, DecodeError> {
        let values: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(',').collect();
        if values.len() != self.fields.len() {
            return Err(DecodeError::Arity {
                expected: self.fields.len(),
                found: values.len(),
            });
        }

        let raw_timestamp = values[0].trim();
        let timestamp = raw_timestamp
            .parse::<i64>()
            .map_err(|_| DecodeError::BadToken {
                field: StreamField::Timestamp.wire_name(),
                value: raw_timestamp.to_string(),
            })?;

        let values = self
            .fields
            .iter()
            .zip(values)
            .skip(1)
            .map(|(field, value)| (*field, value.trim().to_string()))
            .collect();

        Ok(StreamRecord { timestamp, values })
    }
}

/// One decoded telemetry update.
///
/// Values other than the timestamp are kept as sent; an empty value means
/// the vehicle did not report that field (e.g. speed while parked).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamRecord {
    timestamp: i64,
    values: BTreeMap<StreamField, String>,
}

impl StreamRecord {
    /// Epoch milliseconds at which the vehicle sampled the values.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Raw value of `field`, if it was subscribed.
    pub fn raw(&self, field: StreamField) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }

    /// Numeric value of `field`, if present and finite.
    pub fn number(&self, field: StreamField) -> Option<f64> {
        self.raw(field)?
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
    }

    /// Speed, with a missing or unparsable value reported as zero.
    pub fn speed(&self) -> f64 {
        self.number(StreamField::Speed).unwrap_or(0.0)
    }

    pub fn odometer(&self) -> Option<f64> {
        self.number(StreamField::Odometer)
    }

    pub fn soc(&self) -> Option<f64> {
        self.number(StreamField::Soc)
    }

    pub fn power(&self) -> Option<f64> {
        self.number(StreamField::Power)
    }

    /// Estimated position as `(latitude, longitude)`.
    pub fn location(&self) -> Option<(f64, f64)> {
        Some((
            self.number(StreamField::EstLat)?,
            self.number(StreamField::EstLng)?,
        ))
    }

    pub fn shift_state(&self) -> Option<&str> {
        self.raw(StreamField::ShiftState).filter(|s| !s.is_empty())
    }

    pub fn fields(&self) -> impl Iterator<Item = (StreamField, &str)> {
        self.values.iter().map(|(f, v)| (*f, v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timestamp_and_speed() -> FieldSet {
        FieldSet::new([StreamField::Timestamp, StreamField::Speed])
    }

    #[test]
    fn test_decode_timestamp_and_speed() {
        let record = timestamp_and_speed().decode("1000,55.5").unwrap();
        assert_eq!(record.timestamp(), 1000);
        assert_eq!(record.raw(StreamField::Speed), Some("55.5"));
        assert!((record.speed() - 55.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_too_few_values_is_malformed() {
        let err = timestamp_and_speed().decode("1000").unwrap_err();
        assert_eq!(
            err,
            DecodeError::Arity {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_too_many_values_is_malformed() {
        let err = timestamp_and_speed().decode("1000,1,2").unwrap_err();
        assert!(matches!(err, DecodeError::Arity { found: 3, .. }));
    }

    #[test]
    fn test_bad_timestamp_is_malformed() {
        let err = timestamp_and_speed().decode("soon,12").unwrap_err();
        assert!(matches!(err, DecodeError::BadToken { field: "timestamp", .. }));
    }

    #[test]
    fn test_unparsable_speed_is_zero() {
        let fields = timestamp_and_speed();
        assert_eq!(fields.decode("1000,").unwrap().speed(), 0.0);
        assert_eq!(fields.decode("1000,fast").unwrap().speed(), 0.0);
        assert_eq!(fields.decode("1000,NaN").unwrap().speed(), 0.0);
    }

    #[test]
    fn test_default_field_set_query() {
        let fields = FieldSet::default();
        assert_eq!(fields.len(), 13);
        assert_eq!(
            fields.query_values(),
            "odometer,speed,soc,elevation,est_heading,est_lat,est_lng,power,shift_state,range,est_range,heading"
        );
    }

    #[test]
    fn test_field_set_puts_timestamp_first() {
        let fields = FieldSet::new([StreamField::Speed, StreamField::Timestamp, StreamField::Speed]);
        assert_eq!(fields.fields(), &[StreamField::Timestamp, StreamField::Speed]);
        assert_eq!(fields.query_values(), "speed");
    }

    #[test]
    fn test_full_line_decodes() {
        let line = "1388534400000,12345.6,,88,102,181,37.4,-122.1,-3,,201,180,182";
        let record = FieldSet::default().decode(line).unwrap();
        assert_eq!(record.odometer(), Some(12345.6));
        assert_eq!(record.speed(), 0.0);
        assert_eq!(record.soc(), Some(88.0));
        assert_eq!(record.location(), Some((37.4, -122.1)));
        assert_eq!(record.shift_state(), None);
        assert_eq!(
            record.observed_at().unwrap().to_rfc3339(),
            "2014-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_wire_names_round_trip() {
        for field in FIELD_ORDER {
            assert_eq!(StreamField::from_wire_name(field.wire_name()), Some(field));
        }
        assert_eq!(StreamField::from_wire_name("altitude"), None);
    }
}
