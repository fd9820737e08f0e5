use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::types::Millis;

/// Aggregate request rate, stored as requests per minute. Accepts `rps`,
/// `rpm`, and `rph` suffixes on input; always prints `rpm`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pace(u16);

impl Pace {
    pub fn from_rpm(rpm: u16) -> Self {
        Pace(rpm)
    }

    pub fn rpm(self) -> u16 {
        self.0
    }

    /// Global inter-request interval for this rate.
    pub fn interval(self) -> Millis {
        if self.0 == 0 {
            return Millis::ZERO;
        }
        Millis::from_millis(60_000 / i64::from(self.0))
    }
}

impl fmt::Display for Pace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}rpm", self.0)
    }
}

impl FromStr for Pace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid pace value: '{s}'");
        if let Some(v) = s.strip_suffix("rps") {
            let v = v.parse::<u16>().map_err(|_| invalid())?;
            u16::try_from(u32::from(v) * 60).map(Pace).map_err(|_| invalid())
        } else if let Some(v) = s.strip_suffix("rpm") {
            v.parse::<u16>().map(Pace).map_err(|_| invalid())
        } else if let Some(v) = s.strip_suffix("rph") {
            let v = v.parse::<u16>().map_err(|_| invalid())?;
            // round to nearest whole rpm
            Ok(Pace(((u32::from(v) + 30) / 60) as u16))
        } else {
            Err("invalid pace format: must end with 'rps', 'rpm', or 'rph'".to_string())
        }
    }
}

impl Serialize for Pace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// The standard HTTP verb set. Anything else fails parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Connect,
    Options,
    Trace,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Connect => reqwest::Method::CONNECT,
            Method::Options => reqwest::Method::OPTIONS,
            Method::Trace => reqwest::Method::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Http => f.write_str("http"),
            Schema::Https => f.write_str("https"),
        }
    }
}

/// How workers pick from the request list on each iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Choice {
    #[default]
    RoundRobin,
    Random,
}

/// HTTP protocol version carried in the test parameters, `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Default for Version {
    fn default() -> Self {
        Version { major: 1, minor: 1 }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split('.');
        let (Some(major), Some(minor), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(format!(
                "invalid version format: expected 'major.minor', got '{s}'"
            ));
        };
        let major = major
            .parse::<u8>()
            .map_err(|_| format!("invalid version major value: '{s}'"))?;
        let minor = minor
            .parse::<u8>()
            .map_err(|_| format!("invalid version minor value: '{s}'"))?;
        Ok(Version { major, minor })
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Multi-valued request headers. JSON values may be a single string or an
/// array of strings; value order within a name is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, Vec<String>)>);

impl Headers {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ordered values recorded under `name`, empty when absent.
    pub fn values(&self, name: &str) -> &[String] {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
            .unwrap_or_default()
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, values) in &self.0 {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of header names to a string or an array of strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Headers, A::Error> {
                let mut headers = Vec::new();
                while let Some((name, value)) = map.next_entry::<String, serde_json::Value>()? {
                    let values = match value {
                        serde_json::Value::String(s) => vec![s],
                        serde_json::Value::Array(items) => items
                            .into_iter()
                            .map(|item| match item {
                                serde_json::Value::String(s) => Ok(s),
                                _ => Err(de::Error::custom(format!(
                                    "invalid header {name} value"
                                ))),
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                        _ => {
                            return Err(de::Error::custom(format!("invalid header {name} value")));
                        }
                    };
                    headers.push((name, values));
                }
                Ok(Headers(headers))
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

/// One entry of the request list the workers replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub header: Headers,
    #[serde(default)]
    pub body: String,
}

fn default_req_id_header() -> String {
    "X-Request-ID".to_string()
}

/// Configuration of one test run, POSTed to `/test`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub duration: Millis,
    pub pace: Pace,
    pub parallel_testers: u8,
    #[serde(default)]
    pub timeout: Millis,
    #[serde(default)]
    pub choice: Choice,
    #[serde(default)]
    pub req_schema: Schema,
    #[serde(default)]
    pub req_version: Version,
    #[serde(rename = "reqIDHeader", default = "default_req_id_header")]
    pub req_id_header: String,
    #[serde(deserialize_with = "de_requests")]
    pub requests: Vec<RequestTemplate>,
}

fn de_requests<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<RequestTemplate>, D::Error> {
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .enumerate()
        .map(|(i, value)| {
            serde_json::from_value(value)
                .map_err(|err| de::Error::custom(format!("invalid request at index {i}: {err}")))
        })
        .collect()
}

impl TestParams {
    /// Boundary checks applied at admission; the remaining defaults are
    /// filled in during deserialization.
    pub fn validate(&mut self) -> Result<(), String> {
        if self.duration.is_negative() {
            return Err("Invalid test duration: must be >= 0".to_string());
        }
        if self.timeout.is_negative() {
            return Err("Invalid request timeout: must be >= 0".to_string());
        }
        if self.pace.rpm() == 0 {
            return Err("Invalid pace: must be at least 1rpm".to_string());
        }
        if self.parallel_testers == 0 {
            return Err("Invalid parallelTesters: must be at least 1".to_string());
        }
        if self.requests.is_empty() {
            return Err("At least one request is required".to_string());
        }
        if self.req_id_header.is_empty() {
            self.req_id_header = default_req_id_header();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> serde_json::Result<TestParams> {
        serde_json::from_str(raw)
    }

    #[test]
    fn full_params_parse() {
        let raw = r#"
        {
          "name": "test-run-001",
          "duration": "5m",
          "pace": "6000rpm",
          "parallelTesters": 10,
          "timeout": "5s",
          "choice": "roundrobin",
          "reqSchema": "https",
          "reqVersion": "1.1",
          "reqIDHeader": "X-Request-ID",
          "requests": [
            {
              "method": "GET",
              "path": "/api/status",
              "header": {
                "Connection": "keep-alive",
                "X-Test": ["a", "b", "c"]
              }
            }
          ]
        }"#;
        let p = parse(raw).unwrap();
        assert_eq!(p.duration, Millis::from_millis(300_000));
        assert_eq!(p.pace.rpm(), 6000);
        assert_eq!(p.parallel_testers, 10);
        assert_eq!(p.req_schema, Schema::Https);
        assert_eq!(p.req_version, Version { major: 1, minor: 1 });
        let header = &p.requests[0].header;
        assert_eq!(header.values("Connection"), ["keep-alive"]);
        assert_eq!(header.values("X-Test"), ["a", "b", "c"]);
    }

    #[test]
    fn defaults_applied_when_unset() {
        let raw = r#"
        {
          "name": "t",
          "duration": "2s",
          "pace": "60rpm",
          "parallelTesters": 1,
          "timeout": "500ms",
          "requests": [{"method": "GET", "path": "/x"}]
        }"#;
        let mut p = parse(raw).unwrap();
        p.validate().unwrap();
        assert_eq!(p.req_schema, Schema::Http);
        assert_eq!(p.req_version, Version { major: 1, minor: 1 });
        assert_eq!(p.req_id_header, "X-Request-ID");
        assert_eq!(p.choice, Choice::RoundRobin);
        assert!(p.requests[0].header.is_empty());
        assert_eq!(p.requests[0].body, "");
    }

    #[test]
    fn serialized_params_parse_back() {
        let raw = r#"
        {
          "name": "t",
          "duration": "1m",
          "pace": "2rps",
          "parallelTesters": 3,
          "timeout": "250ms",
          "choice": "random",
          "reqSchema": "https",
          "reqVersion": "2.10",
          "reqIDHeader": "X-Corr-ID",
          "requests": [
            {"method": "POST", "path": "/a", "header": {"X-Test": ["a", "b"]}, "body": "ping"}
          ]
        }"#;
        let p = parse(raw).unwrap();
        let round_tripped: TestParams =
            serde_json::from_str(&serde_json::to_string(&p).unwrap()).unwrap();
        assert_eq!(round_tripped, p);
    }

    #[test]
    fn pace_units() {
        assert_eq!("60rpm".parse::<Pace>().unwrap().rpm(), 60);
        assert_eq!("1rps".parse::<Pace>().unwrap().rpm(), 60);
        assert_eq!("3600rph".parse::<Pace>().unwrap().rpm(), 60);
        assert_eq!("120rph".parse::<Pace>().unwrap().rpm(), 2);
        assert_eq!("90rph".parse::<Pace>().unwrap().rpm(), 2);
        assert!("60".parse::<Pace>().is_err());
        assert!("60rpd".parse::<Pace>().is_err());
        // 2000 requests per second exceed the u16 rpm range
        assert!("2000rps".parse::<Pace>().is_err());
    }

    #[test]
    fn pace_interval_is_equivalent_across_units() {
        let per_second = "1rps".parse::<Pace>().unwrap();
        let per_minute = "60rpm".parse::<Pace>().unwrap();
        let per_hour = "3600rph".parse::<Pace>().unwrap();
        assert_eq!(per_second.interval(), per_minute.interval());
        assert_eq!(per_hour.interval(), per_minute.interval());
        assert_eq!(per_minute.interval(), Millis::from_millis(1000));
    }

    #[test]
    fn version_requires_two_fields() {
        assert_eq!(
            "2.10".parse::<Version>().unwrap(),
            Version { major: 2, minor: 10 }
        );
        assert!("1".parse::<Version>().is_err());
        assert!("1.2.3".parse::<Version>().is_err());
        assert!("1.999".parse::<Version>().is_err());
    }

    #[test]
    fn enums_are_case_sensitive() {
        assert!(serde_json::from_str::<Method>("\"GET\"").is_ok());
        assert!(serde_json::from_str::<Method>("\"get\"").is_err());
        assert!(serde_json::from_str::<Method>("\"FETCH\"").is_err());
        assert!(serde_json::from_str::<Schema>("\"https\"").is_ok());
        assert!(serde_json::from_str::<Schema>("\"HTTPS\"").is_err());
        assert!(serde_json::from_str::<Choice>("\"roundrobin\"").is_ok());
        assert!(serde_json::from_str::<Choice>("\"RoundRobin\"").is_err());
    }

    #[test]
    fn non_string_header_values_reject() {
        let raw = r#"{"method": "GET", "path": "/", "header": {"X-Test": [1, 2]}}"#;
        let err = serde_json::from_str::<RequestTemplate>(raw).unwrap_err();
        assert!(err.to_string().contains("invalid header X-Test value"));

        let raw = r#"{"method": "GET", "path": "/", "header": {"X-Test": 5}}"#;
        assert!(serde_json::from_str::<RequestTemplate>(raw).is_err());
    }

    #[test]
    fn malformed_request_reports_index() {
        let raw = r#"
        {
          "name": "t",
          "duration": "1s",
          "pace": "60rpm",
          "parallelTesters": 1,
          "requests": [
            {"method": "GET", "path": "/ok"},
            {"method": "NOPE", "path": "/bad"}
          ]
        }"#;
        let err = parse(raw).unwrap_err();
        assert!(err.to_string().contains("invalid request at index 1"));
    }

    #[test]
    fn validate_rejects_boundary_violations() {
        let raw = r#"
        {
          "name": "t",
          "duration": "-1s",
          "pace": "60rpm",
          "parallelTesters": 1,
          "requests": [{"method": "GET", "path": "/x"}]
        }"#;
        let mut p = parse(raw).unwrap();
        assert!(p.validate().is_err());

        let raw = r#"
        {
          "name": "t",
          "duration": "1s",
          "pace": "0rpm",
          "parallelTesters": 1,
          "requests": [{"method": "GET", "path": "/x"}]
        }"#;
        let mut p = parse(raw).unwrap();
        assert!(p.validate().is_err());
    }
}
