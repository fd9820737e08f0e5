use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Signed millisecond-precision time span.
///
/// Text form is an integer followed by `ms`, `s`, or `m`; the canonical
/// form emitted on output is always milliseconds. A zero span serializes
/// as JSON `null`. Negative spans parse but are rejected at configuration
/// boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Millis(i64);

impl Millis {
    pub const ZERO: Millis = Millis(0);

    pub fn from_millis(ms: i64) -> Self {
        Millis(ms)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Truncates to whole milliseconds.
    pub fn from_std(d: Duration) -> Self {
        Millis(d.as_millis() as i64)
    }

    /// Saturates negative spans to zero.
    pub fn to_std(self) -> Duration {
        Duration::from_millis(self.0.max(0) as u64)
    }
}

impl fmt::Display for Millis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl FromStr for Millis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, scale) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1_000)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000)
        } else {
            return Err("invalid duration format: must end with 'ms', 's', or 'm'".to_string());
        };
        value
            .parse::<i64>()
            .ok()
            .and_then(|v| v.checked_mul(scale))
            .map(Millis)
            .ok_or_else(|| format!("invalid duration value: '{s}'"))
    }
}

impl Serialize for Millis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0 == 0 {
            serializer.serialize_unit()
        } else {
            serializer.serialize_str(&self.to_string())
        }
    }
}

impl<'de> Deserialize<'de> for Millis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MillisVisitor;

        impl Visitor<'_> for MillisVisitor {
            type Value = Millis;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string such as \"250ms\", \"5s\", or \"5m\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Millis, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Millis, E> {
                Ok(Millis::ZERO)
            }

            fn visit_none<E: de::Error>(self) -> Result<Millis, E> {
                Ok(Millis::ZERO)
            }
        }

        deserializer.deserialize_any(MillisVisitor)
    }
}

/// Local-time format of the `ReqTime` attribute.
pub const REQ_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One request's outcome: the nine-column record exchanged between tester
/// and collector. Field declaration order is the wire order of the form
/// keys and the column order of the collector's CSV output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResult {
    #[serde(rename = "ReqTime")]
    pub req_time: String,
    #[serde(rename = "TestName")]
    pub test_name: String,
    #[serde(rename = "ReqID")]
    pub req_id: String,
    #[serde(rename = "ReqNum")]
    pub req_num: String,
    #[serde(rename = "ReqMethod")]
    pub req_method: String,
    #[serde(rename = "ReqPath")]
    pub req_path: String,
    #[serde(rename = "RespCode")]
    pub resp_code: String,
    #[serde(rename = "RoundDuration")]
    pub round_duration: String,
    #[serde(rename = "TimedOut")]
    pub timed_out: String,
}

impl TestResult {
    pub const COLUMNS: [&'static str; 9] = [
        "ReqTime",
        "TestName",
        "ReqID",
        "ReqNum",
        "ReqMethod",
        "ReqPath",
        "RespCode",
        "RoundDuration",
        "TimedOut",
    ];

    /// Column values in wire order.
    pub fn as_row(&self) -> [&str; 9] {
        [
            &self.req_time,
            &self.test_name,
            &self.req_id,
            &self.req_num,
            &self.req_method,
            &self.req_path,
            &self.resp_code,
            &self.round_duration,
            &self.timed_out,
        ]
    }

    pub fn format_req_time(t: DateTime<Local>) -> String {
        t.format(REQ_TIME_FORMAT).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!("5m".parse::<Millis>().unwrap(), Millis::from_millis(300_000));
        assert_eq!("5s".parse::<Millis>().unwrap(), Millis::from_millis(5_000));
        assert_eq!("250ms".parse::<Millis>().unwrap(), Millis::from_millis(250));
        assert_eq!("-100ms".parse::<Millis>().unwrap(), Millis::from_millis(-100));
    }

    #[test]
    fn rejects_unknown_units() {
        assert!("5".parse::<Millis>().is_err());
        assert!("5h".parse::<Millis>().is_err());
        assert!("ms".parse::<Millis>().is_err());
        assert!("1.5s".parse::<Millis>().is_err());
    }

    #[test]
    fn zero_serializes_as_null() {
        assert_eq!(serde_json::to_string(&Millis::ZERO).unwrap(), "null");
        assert_eq!(
            serde_json::to_string(&Millis::from_millis(250)).unwrap(),
            "\"250ms\""
        );
        assert_eq!(serde_json::from_str::<Millis>("null").unwrap(), Millis::ZERO);
        assert_eq!(
            serde_json::from_str::<Millis>("\"5s\"").unwrap(),
            Millis::from_millis(5_000)
        );
    }

    #[test]
    fn result_form_round_trip() {
        let result = TestResult {
            req_time: "2025-03-01 12:30:05".to_string(),
            test_name: "t1".to_string(),
            req_id: "0c7f2bc0-8c8e-4e6a-b1ab-0e2a9f7c1d11".to_string(),
            req_num: "42".to_string(),
            req_method: "GET".to_string(),
            req_path: "/x".to_string(),
            resp_code: "200".to_string(),
            round_duration: "17ms".to_string(),
            timed_out: "false".to_string(),
        };
        let encoded = serde_urlencoded::to_string(&result).unwrap();
        let decoded: TestResult = serde_urlencoded::from_str(&encoded).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn missing_form_keys_decode_empty() {
        let decoded: TestResult = serde_urlencoded::from_str("TestName=t1&TimedOut=true").unwrap();
        assert_eq!(decoded.test_name, "t1");
        assert_eq!(decoded.timed_out, "true");
        assert_eq!(decoded.resp_code, "");
        assert_eq!(decoded.req_id, "");
    }

    #[test]
    fn row_matches_column_order() {
        let result = TestResult {
            req_time: "a".into(),
            timed_out: "z".into(),
            ..Default::default()
        };
        let row = result.as_row();
        assert_eq!(row.len(), TestResult::COLUMNS.len());
        assert_eq!(row[0], "a");
        assert_eq!(row[8], "z");
        assert_eq!(TestResult::COLUMNS[5], "ReqPath");
    }
}
