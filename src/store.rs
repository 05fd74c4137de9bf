//! Time-Series Store
//!
//! [`TimeSeriesStore`] is the write/query seam used by the fetch pipeline.
//! [`InfluxStore`] talks to the InfluxDB v2 HTTP API: writes use line
//! protocol, queries use Flux with a CSV response.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;

use crate::error::StoreError;
use crate::models::{FieldValue, MetricPoint};

pub const DEFAULT_RANGE: &str = "-30d";

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write_metric(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, FieldValue>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Points for one series in `range` (a Flux duration such as `-30d`),
    /// in the order the store returns them.
    async fn query_metric(
        &self,
        measurement: &str,
        series_id: &str,
        range: &str,
    ) -> Result<Vec<MetricPoint>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            token: String::new(),
            org: "globalpulsepro".to_string(),
            bucket: "trade_data".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct InfluxStore {
    client: reqwest::Client,
    config: InfluxConfig,
}

impl InfluxStore {
    pub fn new(config: InfluxConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    fn flux_query(&self, measurement: &str, series_id: &str, range: &str) -> String {
        format!(
            "from(bucket: \"{}\") |> range(start: {}) |> filter(fn: (r) => r._measurement == \"{}\") |> filter(fn: (r) => r.series_id == \"{}\")",
            escape_flux(&self.config.bucket),
            range,
            escape_flux(measurement),
            escape_flux(series_id),
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write_metric(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, FieldValue>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let line = encode_line(measurement, tags, fields, timestamp)?;
        debug!(%line, "influx write");

        let response = self
            .client
            .post(self.endpoint("/api/v2/write"))
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn query_metric(
        &self,
        measurement: &str,
        series_id: &str,
        range: &str,
    ) -> Result<Vec<MetricPoint>, StoreError> {
        let body = serde_json::json!({
            "query": self.flux_query(measurement, series_id, range),
            "type": "flux",
            "dialect": { "annotations": ["datatype"] },
        });

        let response = self
            .client
            .post(self.endpoint("/api/v2/query"))
            .query(&[("org", self.config.org.as_str())])
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Accept", "application/csv")
            .json(&body)
            .send()
            .await?;
        let csv = Self::check(response).await?.text().await?;
        parse_query_csv(&csv)
    }
}

fn escape_flux(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Escape a measurement name (commas and spaces).
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escape a tag key, tag value or field key (commas, equals signs, spaces).
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn encode_field(value: &FieldValue) -> Result<String, StoreError> {
    Ok(match value {
        FieldValue::Float(v) if !v.is_finite() => {
            return Err(StoreError::InvalidPoint(format!("non-finite float {v}")));
        }
        FieldValue::Float(v) => v.to_string(),
        FieldValue::Integer(v) => format!("{v}i"),
        FieldValue::Bool(v) => v.to_string(),
        FieldValue::Text(v) => format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")),
    })
}

/// Encode one point in InfluxDB line protocol.
pub fn encode_line(
    measurement: &str,
    tags: &BTreeMap<String, String>,
    fields: &BTreeMap<String, FieldValue>,
    timestamp: Option<DateTime<Utc>>,
) -> Result<String, StoreError> {
    if measurement.is_empty() {
        return Err(StoreError::InvalidPoint("empty measurement".to_string()));
    }
    if fields.is_empty() {
        return Err(StoreError::InvalidPoint("point has no fields".to_string()));
    }

    let mut line = escape_measurement(measurement);
    for (key, value) in tags {
        let _ = write!(line, ",{}={}", escape_key(key), escape_key(value));
    }

    let encoded: Result<Vec<String>, StoreError> = fields
        .iter()
        .map(|(key, value)| Ok(format!("{}={}", escape_key(key), encode_field(value)?)))
        .collect();
    line.push(' ');
    line.push_str(&encoded?.join(","));

    if let Some(ts) = timestamp {
        let nanos = ts
            .timestamp_nanos_opt()
            .ok_or_else(|| StoreError::InvalidPoint(format!("timestamp out of range: {ts}")))?;
        let _ = write!(line, " {nanos}");
    }

    Ok(line)
}

/// Column layout of one table in a Flux CSV response.
#[derive(Debug)]
struct TableColumns {
    time: usize,
    value: usize,
    field: usize,
    /// `#datatype` annotation of the `_value` column, when requested
    value_type: Option<String>,
}

impl TableColumns {
    fn is_header(record: &StringRecord) -> bool {
        record.iter().any(|c| c == "_time") && record.iter().any(|c| c == "_value")
    }

    fn from_header(
        header: &StringRecord,
        datatypes: Option<&StringRecord>,
    ) -> Result<Self, StoreError> {
        let position = |name: &str| header.iter().position(|c| c == name);
        let (Some(time), Some(value), Some(field)) =
            (position("_time"), position("_value"), position("_field"))
        else {
            return Err(StoreError::Decode(format!("unexpected header: {header:?}")));
        };
        Ok(Self {
            time,
            value,
            field,
            value_type: datatypes.and_then(|d| d.get(value)).map(str::to_string),
        })
    }

    fn point(&self, record: &StringRecord) -> Result<MetricPoint, StoreError> {
        let cell = |idx: usize| {
            record
                .get(idx)
                .ok_or_else(|| StoreError::Decode(format!("short row: {record:?}")))
        };
        let time = DateTime::parse_from_rfc3339(cell(self.time)?)
            .map_err(|e| StoreError::Decode(e.to_string()))?
            .with_timezone(&Utc);

        Ok(MetricPoint {
            time,
            value: decode_value(cell(self.value)?, self.value_type.as_deref())?,
            field: cell(self.field)?.to_string(),
        })
    }
}

/// Decode a `_value` cell using its annotated datatype, or infer one.
fn decode_value(raw: &str, datatype: Option<&str>) -> Result<FieldValue, StoreError> {
    let invalid = |e: String| StoreError::Decode(format!("bad {datatype:?} value {raw:?}: {e}"));
    match datatype {
        Some("double") => raw
            .parse::<f64>()
            .map(FieldValue::Float)
            .map_err(|e| invalid(e.to_string())),
        Some("long" | "unsignedLong") => match raw.parse::<i64>() {
            Ok(v) => Ok(FieldValue::Integer(v)),
            // unsignedLong above i64::MAX
            Err(_) => raw
                .parse::<f64>()
                .map(FieldValue::Float)
                .map_err(|e| invalid(e.to_string())),
        },
        Some("boolean") => raw
            .parse::<bool>()
            .map(FieldValue::Bool)
            .map_err(|e| invalid(e.to_string())),
        Some(_) => Ok(FieldValue::Text(raw.to_string())),
        None => Ok(if let Ok(v) = raw.parse::<f64>() {
            FieldValue::Float(v)
        } else if let Ok(b) = raw.parse::<bool>() {
            FieldValue::Bool(b)
        } else {
            FieldValue::Text(raw.to_string())
        }),
    }
}

/// Parse the CSV body of a Flux query.
///
/// Every table starts with its own header row (optionally preceded by a
/// `#datatype` annotation row); the blank lines between tables are skipped by
/// the reader, so a new header is what resets the column layout.
pub fn parse_query_csv(body: &str) -> Result<Vec<MetricPoint>, StoreError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut points = Vec::new();
    let mut datatypes: Option<StringRecord> = None;
    let mut table: Option<TableColumns> = None;

    for record in reader.records() {
        let record = record.map_err(|e| StoreError::Decode(e.to_string()))?;
        if record.get(0) == Some("#datatype") {
            datatypes = Some(record);
            table = None;
            continue;
        }
        if record.get(0).is_some_and(|c| c.starts_with('#')) {
            continue;
        }

        if TableColumns::is_header(&record) {
            table = Some(TableColumns::from_header(&record, datatypes.take().as_ref())?);
            continue;
        }
        let Some(columns) = &table else {
            return Err(StoreError::Decode(format!("row before header: {record:?}")));
        };
        points.push(columns.point(&record)?);
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_encode_line_with_timestamp() {
        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), FieldValue::from(101.5));
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let line = encode_line("fred", &tags(&[("series_id", "GDP")]), &fields, Some(ts)).unwrap();
        assert_eq!(line, "fred,series_id=GDP value=101.5 1704067200000000000");
    }

    #[test]
    fn test_encode_line_escapes_and_types() {
        let mut fields = BTreeMap::new();
        fields.insert("count".to_string(), FieldValue::from(3_i64));
        fields.insert("note".to_string(), FieldValue::from("say \"hi\""));
        fields.insert("ok".to_string(), FieldValue::from(true));

        let line = encode_line(
            "my metric",
            &tags(&[("region", "north america"), ("k=v", "a,b")]),
            &fields,
            None,
        )
        .unwrap();
        assert_eq!(
            line,
            "my\\ metric,k\\=v=a\\,b,region=north\\ america count=3i,note=\"say \\\"hi\\\"\",ok=true"
        );
    }

    #[test]
    fn test_rejects_points_without_fields_or_finite_values() {
        let no_tags: BTreeMap<String, String> = BTreeMap::new();
        let no_fields: BTreeMap<String, FieldValue> = BTreeMap::new();
        assert!(matches!(
            encode_line("fred", &no_tags, &no_fields, None),
            Err(StoreError::InvalidPoint(_))
        ));

        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), FieldValue::from(f64::NAN));
        assert!(matches!(
            encode_line("fred", &no_tags, &fields, None),
            Err(StoreError::InvalidPoint(_))
        ));
    }

    #[test]
    fn test_parse_multi_table_csv() {
        let csv = ",result,table,_start,_stop,_time,_value,_field,_measurement,series_id\r\n\
,_result,0,2024-01-01T00:00:00Z,2024-02-01T00:00:00Z,2024-01-05T00:00:00Z,3.7,value,fred,UNRATE\r\n\
,_result,0,2024-01-01T00:00:00Z,2024-02-01T00:00:00Z,2024-01-06T00:00:00Z,3.8,value,fred,UNRATE\r\n\
\r\n\
,result,table,_start,_stop,_time,_value,_field,_measurement,series_id\r\n\
,_result,1,2024-01-01T00:00:00Z,2024-02-01T00:00:00Z,2024-01-07T00:00:00Z,1,revision,fred,UNRATE\r\n";

        let points = parse_query_csv(csv).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].value, FieldValue::Float(3.7));
        assert_eq!(points[0].field, "value");
        assert_eq!(points[0].time, Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap());
        assert_eq!(points[2].field, "revision");
        assert_eq!(points[2].value.as_f64(), Some(1.0));
    }

    #[test]
    fn test_parse_quoted_cells_keep_columns_aligned() {
        let csv = ",result,table,_time,_value,_field,region\r\n\
,_result,0,2024-01-05T00:00:00Z,2.5,value,\"north, america\"\r\n\
,_result,0,2024-01-06T00:00:00Z,2.6,value,\"south, \"\"east\"\"\"\r\n";

        let points = parse_query_csv(csv).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, FieldValue::Float(2.5));
        assert_eq!(points[1].field, "value");
        assert_eq!(points[1].time, Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_mixed_field_types_from_annotations() {
        let csv = "#datatype,string,long,dateTime:RFC3339,double,string\r\n\
,result,table,_time,_value,_field\r\n\
,_result,0,2024-01-05T00:00:00Z,3.7,value\r\n\
\r\n\
#datatype,string,long,dateTime:RFC3339,string,string\r\n\
,result,table,_time,_value,_field\r\n\
,_result,1,2024-01-05T00:00:00Z,\"revised, final\",note\r\n\
\r\n\
#datatype,string,long,dateTime:RFC3339,boolean,string\r\n\
,result,table,_time,_value,_field\r\n\
,_result,2,2024-01-05T00:00:00Z,true,preliminary\r\n\
\r\n\
#datatype,string,long,dateTime:RFC3339,long,string\r\n\
,result,table,_time,_value,_field\r\n\
,_result,3,2024-01-05T00:00:00Z,42,count\r\n";

        let values: Vec<FieldValue> = parse_query_csv(csv)
            .unwrap()
            .into_iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(
            values,
            vec![
                FieldValue::Float(3.7),
                FieldValue::from("revised, final"),
                FieldValue::Bool(true),
                FieldValue::Integer(42),
            ]
        );
    }

    #[test]
    fn test_parse_infers_types_without_annotations() {
        let csv = ",result,table,_time,_value,_field\n\
,_result,0,2024-01-05T00:00:00Z,provisional,note\n\
,_result,0,2024-01-06T00:00:00Z,false,final\n";

        let points = parse_query_csv(csv).unwrap();
        assert_eq!(points[0].value, FieldValue::from("provisional"));
        assert_eq!(points[1].value, FieldValue::Bool(false));
    }

    #[test]
    fn test_parse_rejects_rows_before_header() {
        let csv = ",_result,0,2024-01-05T00:00:00Z,3.7,value\n";
        assert!(matches!(parse_query_csv(csv), Err(StoreError::Decode(_))));
    }

    #[test]
    fn test_parse_empty_csv() {
        assert!(parse_query_csv("").unwrap().is_empty());
        assert!(parse_query_csv("\r\n").unwrap().is_empty());
    }

    #[test]
    fn test_flux_query_escapes_identifiers() {
        let store = InfluxStore::new(InfluxConfig::default()).unwrap();
        let query = store.flux_query("fred", "GDP\") |> drop(", DEFAULT_RANGE);
        assert!(query.contains("range(start: -30d)"));
        assert!(query.contains("r.series_id == \"GDP\\\") |> drop(\""));
    }
}
