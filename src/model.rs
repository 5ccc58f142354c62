//! model.rs
//!
//! Shared shapes of stored metric points and of the results every storage
//! realization hands back: downsampling and time buckets, top-N rows,
//! zero-filled linear series and heatmap matrices.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CoreSettings;
use crate::errors::QueryError;
use crate::sparse::IntKeyLongMap;

/// Primary key column / document id.
pub const ID: &str = "id";
pub const ENTITY_ID: &str = "entity_id";
pub const TIME_BUCKET: &str = "time_bucket";
pub const SERVICE_ID: &str = "service_id";

// Heatmap record fields.
pub const STEP: &str = "step";
pub const NUM_OF_STEPS: &str = "num_of_steps";
pub const DETAIL_GROUP: &str = "detail_group";

pub const ID_SPLIT: &str = "_";

/// Upper bound on heatmap columns a single stored record may declare.
pub const MAX_HEATMAP_WIDTH: usize = 10_000;

/// Granularity at which metric points are bucketed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Downsampling {
    Minute,
    Hour,
    Day,
    Month,
}

impl Downsampling {
    /// Physical table / index holding `metric` at this granularity.
    pub fn table_name(self, metric: &str) -> String {
        match self {
            Downsampling::Minute => metric.to_string(),
            other => format!("{metric}{ID_SPLIT}{other}"),
        }
    }

    /// Encode a wall-clock instant, e.g. `202610191530` for minutes.
    pub fn time_bucket(self, at: DateTime<Utc>) -> i64 {
        let day = i64::from(at.year()) * 10_000 + i64::from(at.month()) * 100 + i64::from(at.day());
        match self {
            Downsampling::Minute => {
                day * 10_000 + i64::from(at.hour()) * 100 + i64::from(at.minute())
            }
            Downsampling::Hour => day * 100 + i64::from(at.hour()),
            Downsampling::Day => day,
            Downsampling::Month => day / 100,
        }
    }

    /// Start of the interval a bucket encodes.
    pub fn bucket_start(self, bucket: i64) -> Result<NaiveDateTime, QueryError> {
        let invalid = || QueryError::decode(TIME_BUCKET, format!("{bucket} is not a {self} bucket"));
        if bucket < 0 {
            return Err(invalid());
        }
        let (date, hour, minute) = match self {
            Downsampling::Minute => (bucket / 10_000, (bucket / 100) % 100, bucket % 100),
            Downsampling::Hour => (bucket / 100, bucket % 100, 0),
            Downsampling::Day => (bucket, 0, 0),
            Downsampling::Month => (bucket * 100 + 1, 0, 0),
        };
        let year = i32::try_from(date / 10_000).map_err(|_| invalid())?;
        NaiveDate::from_ymd_opt(year, ((date / 100) % 100) as u32, (date % 100) as u32)
            .and_then(|d| d.and_hms_opt(hour as u32, minute as u32, 0))
            .ok_or_else(invalid)
    }

    fn step(self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Downsampling::Minute => at.checked_add_signed(Duration::minutes(1)),
            Downsampling::Hour => at.checked_add_signed(Duration::hours(1)),
            Downsampling::Day => at.checked_add_signed(Duration::days(1)),
            Downsampling::Month => at.checked_add_months(Months::new(1)),
        }
    }

    /// Every bucket in the inclusive range `[start, end]`, in order.
    pub fn buckets_between(self, start: i64, end: i64) -> Result<Vec<i64>, QueryError> {
        let mut buckets = Vec::new();
        if start > end {
            return Ok(buckets);
        }
        let mut cursor = self.bucket_start(start)?;
        let last = self.bucket_start(end)?;
        while cursor <= last {
            buckets.push(self.time_bucket(cursor.and_utc()));
            cursor = match self.step(cursor) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(buckets)
    }
}

impl fmt::Display for Downsampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Downsampling::Minute => "minute",
            Downsampling::Hour => "hour",
            Downsampling::Day => "day",
            Downsampling::Month => "month",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn as_str(self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

/// Aggregation applied to a value column.
///
/// `None` stands for anything the caller named that is not recognised; it is
/// resolved against the configured fallback (avg unless overridden).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Function {
    None,
    Avg,
    Sum,
}

impl Function {
    pub fn resolve(self, fallback: Function) -> Function {
        match (self, fallback) {
            (Function::None, Function::None) => Function::Avg,
            (Function::None, fallback) => fallback,
            (chosen, _) => chosen,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Function::None => "none",
            Function::Avg => "avg",
            Function::Sum => "sum",
        }
    }
}

impl FromStr for Function {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "avg" => Function::Avg,
            "sum" => Function::Sum,
            _ => Function::None,
        })
    }
}

/// Which entities a top-N ranking is drawn from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopNScope {
    All,
    /// Only rows whose `service_id` equals the given id.
    Service(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopNCondition {
    pub metric: String,
    pub value_column: String,
    pub top_n: i64,
    pub downsampling: Downsampling,
    pub start_tb: i64,
    pub end_tb: i64,
    pub order: Order,
}

impl TopNCondition {
    pub fn table(&self) -> String {
        self.downsampling.table_name(&self.metric)
    }

    /// True when the answer is `[]` without asking storage.
    pub fn is_empty(&self) -> bool {
        self.top_n <= 0 || self.start_tb > self.end_tb
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopNEntity {
    pub id: String,
    pub value: f64,
}

/// One ANDed condition: `key` must equal one of `values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValues {
    pub key: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    pub conditions: Vec<KeyValues>,
}

impl ScopeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.conditions.push(KeyValues {
            key: key.into(),
            values,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KvInt {
    pub id: String,
    pub value: i64,
}

/// Values aligned with the requested id list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntValues {
    values: Vec<KvInt>,
}

impl IntValues {
    pub fn zero_filled(ids: &[String]) -> Self {
        Self {
            values: ids
                .iter()
                .map(|id| KvInt {
                    id: id.clone(),
                    value: 0,
                })
                .collect(),
        }
    }

    pub fn set(&mut self, index: usize, value: i64) {
        if let Some(kv) = self.values.get_mut(index) {
            kv.value = value;
        }
    }

    pub fn values(&self) -> &[KvInt] {
        &self.values
    }

    pub fn numbers(&self) -> Vec<i64> {
        self.values.iter().map(|kv| kv.value).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Value-distribution matrix: one row per requested time bucket, one column per step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Heatmap {
    pub axis_y_step: i64,
    pub num_of_steps: usize,
    /// Empty rows mark buckets with no record.
    pub rows: Vec<Vec<i64>>,
}

impl Heatmap {
    /// `[x, y, count]` triples, x being the bucket column and y the step.
    pub fn nodes(&self) -> Vec<[i64; 3]> {
        self.rows
            .iter()
            .enumerate()
            .flat_map(|(x, row)| {
                row.iter()
                    .enumerate()
                    .map(move |(y, value)| [x as i64, y as i64, *value])
            })
            .collect()
    }
}

/// Accumulates heatmap rows in request order; widths are settled in `finish`.
#[derive(Debug, Default)]
pub struct HeatmapBuilder {
    axis_y_step: i64,
    num_of_steps: usize,
    rows: Vec<Vec<i64>>,
}

impl HeatmapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_missing(&mut self) {
        self.rows.push(Vec::new());
    }

    pub fn push_record(
        &mut self,
        step: i64,
        num_of_steps: i64,
        detail_group: &str,
    ) -> Result<(), QueryError> {
        let width = num_of_steps
            .checked_add(1)
            .and_then(|w| usize::try_from(w).ok())
            .filter(|w| (1..=MAX_HEATMAP_WIDTH).contains(w))
            .ok_or_else(|| {
                QueryError::decode(
                    NUM_OF_STEPS,
                    format!("{num_of_steps} outside 0..{MAX_HEATMAP_WIDTH}"),
                )
            })?;
        let detail = IntKeyLongMap::decode(DETAIL_GROUP, detail_group)?;

        let mut row = vec![0; width];
        for (key, value) in detail.iter() {
            let slot = usize::try_from(key)
                .ok()
                .and_then(|k| row.get_mut(k))
                .ok_or_else(|| {
                    QueryError::decode(DETAIL_GROUP, format!("step {key} outside 0..{width}"))
                })?;
            *slot = value;
        }

        self.axis_y_step = step;
        self.num_of_steps = self.num_of_steps.max(width);
        self.rows.push(row);
        Ok(())
    }

    pub fn finish(self) -> Heatmap {
        let width = self.num_of_steps;
        let rows = self
            .rows
            .into_iter()
            .map(|mut row| {
                if !row.is_empty() {
                    row.resize(width, 0);
                }
                row
            })
            .collect();
        Heatmap {
            axis_y_step: self.axis_y_step,
            num_of_steps: width,
            rows,
        }
    }
}

/// Spread packed maps into one zero-filled series per requested index.
///
/// `packed_for` returns `None` for ids with no stored record.
pub fn multi_linear_series<F>(
    ids: &[String],
    linear_index: &[i32],
    mut packed_for: F,
) -> Result<Vec<IntValues>, QueryError>
where
    F: FnMut(&str) -> Result<Option<IntKeyLongMap>, QueryError>,
{
    let mut series: Vec<IntValues> = linear_index
        .iter()
        .map(|_| IntValues::zero_filled(ids))
        .collect();
    for (position, id) in ids.iter().enumerate() {
        if let Some(packed) = packed_for(id)? {
            for (values, index) in series.iter_mut().zip(linear_index) {
                values.set(position, packed.get(*index));
            }
        }
    }
    Ok(series)
}

/// Storage id of the point for `entity` at `bucket`.
pub fn record_id(entity: &str, bucket: i64) -> String {
    format!("{entity}{ID_SPLIT}{bucket}")
}

/// Ids of every point of `entity` across `[start, end]`, for linear queries.
pub fn point_ids(
    entity: &str,
    downsampling: Downsampling,
    start: i64,
    end: i64,
) -> Result<Vec<String>, QueryError> {
    Ok(downsampling
        .buckets_between(start, end)?
        .into_iter()
        .map(|bucket| record_id(entity, bucket))
        .collect())
}

/// Entity id of an endpoint, with the name cut to the configured length.
pub fn endpoint_entity_id(core: &CoreSettings, service_id: &str, endpoint_name: &str) -> String {
    format!(
        "{service_id}{ID_SPLIT}{}",
        core.format_endpoint_name(endpoint_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_buckets_per_granularity() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 15, 30, 42).unwrap();
        assert_eq!(Downsampling::Minute.time_bucket(at), 202610191530);
        assert_eq!(Downsampling::Hour.time_bucket(at), 2026101915);
        assert_eq!(Downsampling::Day.time_bucket(at), 20261019);
        assert_eq!(Downsampling::Month.time_bucket(at), 202610);
    }

    #[test]
    fn buckets_between_crosses_calendar_boundaries() {
        assert_eq!(
            Downsampling::Minute.buckets_between(202612312358, 202701010001).unwrap(),
            vec![202612312358, 202612312359, 202701010000, 202701010001]
        );
        assert_eq!(
            Downsampling::Month.buckets_between(202611, 202702).unwrap(),
            vec![202611, 202612, 202701, 202702]
        );
        assert!(Downsampling::Day.buckets_between(20261020, 20261019).unwrap().is_empty());
    }

    #[test]
    fn invalid_bucket_is_decode_error() {
        assert!(Downsampling::Day.bucket_start(20261341).is_err());
        assert!(Downsampling::Hour.bucket_start(-1).is_err());
    }

    #[test]
    fn table_names_follow_granularity() {
        assert_eq!(Downsampling::Minute.table_name("service_resp_time"), "service_resp_time");
        assert_eq!(Downsampling::Hour.table_name("service_resp_time"), "service_resp_time_hour");
    }

    #[test]
    fn unknown_function_falls_back() {
        let parsed: Function = "p99".parse().unwrap();
        assert_eq!(parsed, Function::None);
        assert_eq!(parsed.resolve(Function::Avg), Function::Avg);
        assert_eq!(parsed.resolve(Function::Sum), Function::Sum);
        assert_eq!(parsed.resolve(Function::None), Function::Avg);
        assert_eq!(Function::Sum.resolve(Function::Avg), Function::Sum);
    }

    #[test]
    fn empty_top_n_conditions() {
        let mut condition = TopNCondition {
            metric: "service_cpm".into(),
            value_column: "value".into(),
            top_n: 0,
            downsampling: Downsampling::Minute,
            start_tb: 100,
            end_tb: 101,
            order: Order::Desc,
        };
        assert!(condition.is_empty());
        condition.top_n = 5;
        assert!(!condition.is_empty());
        condition.start_tb = 102;
        assert!(condition.is_empty());
    }

    #[test]
    fn heatmap_rows_widen_to_largest_record() {
        let mut builder = HeatmapBuilder::new();
        builder.push_record(50, 2, "0,1|2,4").unwrap();
        builder.push_missing();
        builder.push_record(50, 4, "4,9").unwrap();
        let heatmap = builder.finish();

        assert_eq!(heatmap.axis_y_step, 50);
        assert_eq!(heatmap.num_of_steps, 5);
        assert_eq!(
            heatmap.rows,
            vec![vec![1, 0, 4, 0, 0], vec![], vec![0, 0, 0, 0, 9]]
        );
        assert_eq!(heatmap.nodes().len(), 10);
        assert_eq!(heatmap.nodes()[9], [2, 4, 9]);
    }

    #[test]
    fn heatmap_step_beyond_width_is_rejected() {
        let mut builder = HeatmapBuilder::new();
        assert!(builder.push_record(50, 1, "3,1").is_err());
    }

    #[test]
    fn heatmap_width_out_of_range_is_decode_error() {
        let mut builder = HeatmapBuilder::new();
        for num_of_steps in [i64::MAX, 1_000_000_000_000, -1, -2] {
            assert!(matches!(
                builder.push_record(50, num_of_steps, "0,1"),
                Err(QueryError::Decode { .. })
            ));
        }
        builder
            .push_record(50, (MAX_HEATMAP_WIDTH - 1) as i64, "0,1")
            .unwrap();
        assert_eq!(builder.finish().num_of_steps, MAX_HEATMAP_WIDTH);
    }

    #[test]
    fn multi_linear_reads_missing_keys_and_ids_as_zero() {
        let ids: Vec<String> = vec!["a_1".into(), "a_2".into()];
        let series = multi_linear_series(&ids, &[0, 3], |id| {
            Ok((id == "a_1").then(|| [(0, 7), (1, 8)].into_iter().collect()))
        })
        .unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].numbers(), vec![7, 0]);
        assert_eq!(series[1].numbers(), vec![0, 0]);
    }

    #[test]
    fn point_ids_cover_the_range() {
        assert_eq!(
            point_ids("svc", Downsampling::Hour, 2026101923, 2026102001).unwrap(),
            vec!["svc_2026101923", "svc_2026102000", "svc_2026102001"]
        );
    }

    #[test]
    fn endpoint_ids_use_configured_name_cap() {
        let core = CoreSettings {
            endpoint_name_max_length: 4,
        };
        assert_eq!(endpoint_entity_id(&core, "svc", "/orders/1"), "svc_/ord");
    }
}
