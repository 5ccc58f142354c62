//! relational.rs
//!
//! Query contracts answered by a relational engine through SQLx's `Any`
//! driver. `SqlExecutor` owns everything the engines share (statement
//! building, pooled execution, row mapping); the injected [`SqlDialect`]
//! supplies the few fragments that differ.
//!
//! Values are always bound parameters. Table and column names cannot be, so
//! they are checked against `[A-Za-z0-9_]+` before being quoted in.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use crate::config::{JdbcSettings, QuerySettings};
use crate::dialect::SqlDialect;
use crate::errors::QueryError;
use crate::metrics::QueryTimer;
use crate::model::{
    multi_linear_series, Downsampling, Function, Heatmap, HeatmapBuilder, IntValues, Order,
    ScopeFilter, TopNCondition, TopNEntity, TopNScope, ENTITY_ID, ID, NUM_OF_STEPS, SERVICE_ID,
    STEP, TIME_BUCKET,
};
use crate::query::{AggregationQueryDao, MetricsQueryDao};
use crate::sparse::IntKeyLongMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Long(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

pub fn validate_identifier(identifier: &str) -> Result<&str, QueryError> {
    if !identifier.is_empty()
        && identifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        Ok(identifier)
    } else {
        Err(QueryError::InvalidIdentifier(identifier.to_string()))
    }
}

/// Accumulates SQL text and its parameters, numbering bind markers in order.
pub struct SqlBuilder<'d> {
    dialect: &'d dyn SqlDialect,
    sql: String,
    params: Vec<SqlParam>,
}

impl<'d> SqlBuilder<'d> {
    pub fn new(dialect: &'d dyn SqlDialect) -> Self {
        Self {
            dialect,
            sql: String::with_capacity(128),
            params: Vec::new(),
        }
    }

    pub fn push(&mut self, fragment: &str) -> &mut Self {
        self.sql.push_str(fragment);
        self
    }

    pub fn ident(&mut self, identifier: &str) -> Result<&mut Self, QueryError> {
        let quoted = self.dialect.quote_identifier(validate_identifier(identifier)?);
        self.sql.push_str(&quoted);
        Ok(self)
    }

    /// Append a bind marker and remember its value.
    pub fn bind(&mut self, param: SqlParam) -> &mut Self {
        self.params.push(param);
        let marker = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&marker);
        self
    }

    /// `column IN (…)`; an empty list matches nothing.
    pub fn in_list(&mut self, column: &str, values: &[String]) -> Result<&mut Self, QueryError> {
        if values.is_empty() {
            self.sql.push_str("1 = 0");
            return Ok(self);
        }
        self.ident(column)?.push(" IN (");
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.bind(SqlParam::Text(value.clone()));
        }
        self.push(")");
        Ok(self)
    }

    pub fn time_range(&mut self, start_tb: i64, end_tb: i64) -> Result<&mut Self, QueryError> {
        self.ident(TIME_BUCKET)?.push(" >= ");
        self.bind(SqlParam::Long(start_tb)).push(" AND ");
        self.ident(TIME_BUCKET)?.push(" <= ");
        self.bind(SqlParam::Long(end_tb));
        Ok(self)
    }

    /// `CAST(AVG(column) AS <double>)`
    pub fn aggregate(&mut self, function: Function, column: &str) -> Result<&mut Self, QueryError> {
        let name = match function {
            Function::Sum => "SUM",
            _ => "AVG",
        };
        self.push("CAST(").push(name).push("(");
        self.ident(column)?;
        let double = self.dialect.double_type();
        self.push(") AS ").push(double).push(")");
        Ok(self)
    }

    pub fn limit(&mut self, rows: i64) -> &mut Self {
        self.params.push(SqlParam::Long(rows));
        let clause = self
            .dialect
            .limit_clause(&self.dialect.placeholder(self.params.len()));
        self.sql.push_str(&clause);
        self
    }

    pub fn finish(self) -> SqlStatement {
        SqlStatement {
            sql: self.sql,
            params: self.params,
        }
    }
}

pub fn top_n_statement(
    dialect: &dyn SqlDialect,
    condition: &TopNCondition,
    scope: &TopNScope,
    function: Function,
) -> Result<SqlStatement, QueryError> {
    let mut b = SqlBuilder::new(dialect);
    b.push("SELECT ").aggregate(function, &condition.value_column)?;
    b.push(" AS ").ident("value")?.push(", ").ident(ENTITY_ID)?;
    b.push(" FROM ").ident(&condition.table())?.push(" WHERE ");
    b.time_range(condition.start_tb, condition.end_tb)?;
    if let TopNScope::Service(service_id) = scope {
        b.push(" AND ").ident(SERVICE_ID)?.push(" = ");
        b.bind(SqlParam::Text(service_id.clone()));
    }
    b.push(" GROUP BY ").ident(ENTITY_ID)?;
    b.push(" ORDER BY ").ident("value")?;
    b.push(match condition.order {
        Order::Asc => " ASC, ",
        Order::Desc => " DESC, ",
    });
    b.ident(ENTITY_ID)?.push(" ASC");
    b.limit(condition.top_n);
    Ok(b.finish())
}

pub fn values_statement(
    dialect: &dyn SqlDialect,
    table: &str,
    start_tb: i64,
    end_tb: i64,
    filter: &ScopeFilter,
    value_column: &str,
    function: Function,
) -> Result<SqlStatement, QueryError> {
    let mut b = SqlBuilder::new(dialect);
    b.push("SELECT ").aggregate(function, value_column)?;
    b.push(" AS ").ident("value")?.push(", ").ident(ENTITY_ID)?;
    b.push(" FROM ").ident(table)?.push(" WHERE ");
    b.time_range(start_tb, end_tb)?;
    for condition in &filter.conditions {
        b.push(" AND ").in_list(&condition.key, &condition.values)?;
    }
    b.push(" GROUP BY ").ident(ENTITY_ID)?;
    Ok(b.finish())
}

/// `SELECT id, <columns> FROM table WHERE id IN (…)`
pub fn by_ids_statement(
    dialect: &dyn SqlDialect,
    table: &str,
    ids: &[String],
    columns: &[&str],
) -> Result<SqlStatement, QueryError> {
    let mut b = SqlBuilder::new(dialect);
    b.push("SELECT ").ident(ID)?;
    for column in columns {
        b.push(", ").ident(column)?;
    }
    b.push(" FROM ").ident(table)?.push(" WHERE ");
    b.in_list(ID, ids)?;
    Ok(b.finish())
}

/// Shared base of every relational engine: a pool plus the injected dialect.
pub struct SqlExecutor {
    pool: AnyPool,
    dialect: Arc<dyn SqlDialect>,
}

impl SqlExecutor {
    pub fn new(pool: AnyPool, dialect: Arc<dyn SqlDialect>) -> Self {
        Self { pool, dialect }
    }

    /// Open a bounded pool; waits for a free connection are capped by
    /// `acquire_timeout`.
    pub async fn connect(
        settings: &JdbcSettings,
        dialect: Arc<dyn SqlDialect>,
    ) -> Result<Self, QueryError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(&settings.url)
            .await?;
        info!(
            dialect = dialect.name(),
            max_connections = settings.max_connections,
            acquire_timeout = %humantime::format_duration(settings.acquire_timeout),
            "Connected to relational storage"
        );
        Ok(Self::new(pool, dialect))
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Run `statement` on a pooled connection, mapping each row as it streams
    /// in. Connection and cursor are released on every return path.
    pub async fn query<T, F>(&self, statement: &SqlStatement, mut map: F) -> Result<Vec<T>, QueryError>
    where
        F: FnMut(&AnyRow) -> Result<T, QueryError> + Send,
        T: Send,
    {
        let mut conn = self.pool.acquire().await?;

        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = match param {
                SqlParam::Long(v) => query.bind(*v),
                SqlParam::Text(v) => query.bind(v.clone()),
            };
        }

        let mut rows = query.fetch(&mut *conn);
        let mut mapped = Vec::new();
        while let Some(row) = rows.try_next().await? {
            mapped.push(map(&row)?);
        }
        debug!(dialect = self.dialect.name(), rows = mapped.len(), sql = %statement.sql, "Query complete");
        Ok(mapped)
    }
}

fn entity_value(row: &AnyRow) -> Result<(String, f64), QueryError> {
    let id: String = row.try_get(ENTITY_ID)?;
    let value: Option<f64> = row.try_get("value")?;
    Ok((id, value.unwrap_or(0.0)))
}

pub struct JdbcAggregationQueryDao {
    executor: Arc<SqlExecutor>,
    settings: QuerySettings,
}

impl JdbcAggregationQueryDao {
    pub fn new(executor: Arc<SqlExecutor>, settings: QuerySettings) -> Self {
        Self { executor, settings }
    }
}

#[async_trait]
impl AggregationQueryDao for JdbcAggregationQueryDao {
    async fn top_n(
        &self,
        condition: &TopNCondition,
        scope: &TopNScope,
    ) -> Result<Vec<TopNEntity>, QueryError> {
        if condition.is_empty() {
            return Ok(Vec::new());
        }
        let timer = QueryTimer::start(self.executor.dialect().name(), "top_n");
        let result: Result<_, QueryError> = async {
            let function = self.settings.top_n_function.resolve(Function::Avg);
            let statement = top_n_statement(self.executor.dialect(), condition, scope, function)?;
            self.executor
                .query(&statement, |row| {
                    entity_value(row).map(|(id, value)| TopNEntity { id, value })
                })
                .await
        }
        .await;
        timer.finish(result)
    }
}

pub struct JdbcMetricsQueryDao {
    executor: Arc<SqlExecutor>,
    settings: QuerySettings,
}

impl JdbcMetricsQueryDao {
    pub fn new(executor: Arc<SqlExecutor>, settings: QuerySettings) -> Self {
        Self { executor, settings }
    }

    fn backend(&self) -> &'static str {
        self.executor.dialect().name()
    }
}

#[async_trait]
impl MetricsQueryDao for JdbcMetricsQueryDao {
    async fn get_values(
        &self,
        metric: &str,
        downsampling: Downsampling,
        start_tb: i64,
        end_tb: i64,
        filter: &ScopeFilter,
        value_column: &str,
        function: Function,
    ) -> Result<BTreeMap<String, f64>, QueryError> {
        if start_tb > end_tb {
            return Ok(BTreeMap::new());
        }
        let timer = QueryTimer::start(self.backend(), "get_values");
        let result: Result<_, QueryError> = async {
            let function = function.resolve(self.settings.fallback_function);
            let statement = values_statement(
                self.executor.dialect(),
                &downsampling.table_name(metric),
                start_tb,
                end_tb,
                filter,
                value_column,
                function,
            )?;
            let rows = self.executor.query(&statement, entity_value).await?;
            Ok(rows.into_iter().collect())
        }
        .await;
        timer.finish(result)
    }

    async fn get_linear_int_values(
        &self,
        metric: &str,
        downsampling: Downsampling,
        ids: &[String],
        value_column: &str,
    ) -> Result<IntValues, QueryError> {
        let timer = QueryTimer::start(self.backend(), "get_linear_int_values");
        let result: Result<_, QueryError> = async {
            let mut values = IntValues::zero_filled(ids);
            if ids.is_empty() {
                return Ok(values);
            }
            let statement = by_ids_statement(
                self.executor.dialect(),
                &downsampling.table_name(metric),
                ids,
                &[value_column],
            )?;
            let found: HashMap<String, i64> = self
                .executor
                .query(&statement, |row| {
                    let id: String = row.try_get(ID)?;
                    let value: Option<i64> = row.try_get(value_column)?;
                    Ok((id, value.unwrap_or(0)))
                })
                .await?
                .into_iter()
                .collect();
            for (position, id) in ids.iter().enumerate() {
                if let Some(value) = found.get(id) {
                    values.set(position, *value);
                }
            }
            Ok(values)
        }
        .await;
        timer.finish(result)
    }

    async fn get_multiple_linear_int_values(
        &self,
        metric: &str,
        downsampling: Downsampling,
        ids: &[String],
        linear_index: &[i32],
        value_column: &str,
    ) -> Result<Vec<IntValues>, QueryError> {
        let timer = QueryTimer::start(self.backend(), "get_multiple_linear_int_values");
        let result: Result<_, QueryError> = async {
            let found: HashMap<String, IntKeyLongMap> = if ids.is_empty() {
                HashMap::new()
            } else {
                let statement = by_ids_statement(
                    self.executor.dialect(),
                    &downsampling.table_name(metric),
                    ids,
                    &[value_column],
                )?;
                self.executor
                    .query(&statement, |row| {
                        let id: String = row.try_get(ID)?;
                        let raw: Option<String> = row.try_get(value_column)?;
                        let packed = IntKeyLongMap::decode(value_column, raw.as_deref().unwrap_or(""))?;
                        Ok((id, packed))
                    })
                    .await?
                    .into_iter()
                    .collect()
            };
            multi_linear_series(ids, linear_index, |id| Ok(found.get(id).cloned()))
        }
        .await;
        timer.finish(result)
    }

    async fn get_thermodynamic(
        &self,
        metric: &str,
        downsampling: Downsampling,
        ids: &[String],
        value_column: &str,
    ) -> Result<Heatmap, QueryError> {
        let timer = QueryTimer::start(self.backend(), "get_thermodynamic");
        let result: Result<_, QueryError> = async {
            let mut builder = HeatmapBuilder::new();
            if ids.is_empty() {
                return Ok(builder.finish());
            }
            let statement = by_ids_statement(
                self.executor.dialect(),
                &downsampling.table_name(metric),
                ids,
                &[STEP, NUM_OF_STEPS, value_column],
            )?;
            let found: HashMap<String, (i64, i64, String)> = self
                .executor
                .query(&statement, |row| {
                    let id: String = row.try_get(ID)?;
                    let step: i64 = row.try_get(STEP)?;
                    let num_of_steps: i64 = row.try_get(NUM_OF_STEPS)?;
                    let detail: Option<String> = row.try_get(value_column)?;
                    Ok((id, (step, num_of_steps, detail.unwrap_or_default())))
                })
                .await?
                .into_iter()
                .collect();
            for id in ids {
                match found.get(id) {
                    None => builder.push_missing(),
                    Some((step, num_of_steps, detail)) => {
                        builder.push_record(*step, *num_of_steps, detail)?
                    }
                }
            }
            Ok(builder.finish())
        }
        .await;
        timer.finish(result)
    }
}
