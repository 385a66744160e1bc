//! Query executor.
//!
//! Runs a [`ValidatedQuery`] against the read-only [`DataStore`]. Safety
//! limits are re-applied here regardless of what the validator saw: every
//! operation gets an effective row cap, pipelines get a terminal `$limit`,
//! and every read runs under the policy's wall-clock budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::filter::Filter;
use super::invocation::{Operation, QueryBody, SortKey};
use super::pipeline::{Pipeline, Projection, sort_documents};
use super::validator::ValidatedQuery;
use super::value::{get_path, normalize, sort_cmp, values_equal};
use crate::error::QueryError;
use crate::policy::QueryPolicy;
use crate::storage::{DataStore, ReadBudget};

/// Extra time the async wrapper waits beyond the read budget before giving up
/// on a blocking read.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// Describes the operation that produced a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryInfo {
    /// Target collection.
    pub collection: String,
    /// Operation name.
    pub operation: String,
    /// Execution timestamp.
    pub executed_at: DateTime<Utc>,
}

impl QueryInfo {
    /// Stamps the current time.
    #[must_use]
    pub fn now(collection: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            operation: operation.into(),
            executed_at: Utc::now(),
        }
    }
}

/// Outcome of one tool call.
///
/// Serializes to the tool-result payload the planning engine sees.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Whether the operation ran.
    pub success: bool,
    /// Normalized result rows.
    pub rows: Vec<Value>,
    /// Rows returned, or the count for `countDocuments`/`distinct`.
    pub row_count: usize,
    /// Failure, when `success` is false.
    pub error: Option<QueryError>,
    /// What ran.
    pub query_info: Option<QueryInfo>,
}

impl ExecutionResult {
    /// Successful result.
    #[must_use]
    pub const fn ok(rows: Vec<Value>, row_count: usize, info: QueryInfo) -> Self {
        Self {
            success: true,
            rows,
            row_count,
            error: None,
            query_info: Some(info),
        }
    }

    /// Failed result.
    #[must_use]
    pub const fn failure(info: Option<QueryInfo>, error: QueryError) -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            row_count: 0,
            error: Some(error),
            query_info: info,
        }
    }

    /// Tool-result JSON payload.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        if !self.success {
            return json!({
                "success": false,
                "error": self.error.as_ref().map_or_else(|| "Query execution failed".to_string(), ToString::to_string),
                "code": self.error.as_ref().map_or("ExecutionFailure", QueryError::code),
                "data": [],
                "count": 0,
            });
        }
        let mut payload = Map::new();
        payload.insert("success".to_string(), Value::Bool(true));
        payload.insert("data".to_string(), Value::Array(self.rows.clone()));
        payload.insert("count".to_string(), Value::from(self.row_count));
        if let Some(info) = &self.query_info {
            payload.insert(
                "query_info".to_string(),
                serde_json::to_value(info).unwrap_or(Value::Null),
            );
        }
        Value::Object(payload)
    }
}

impl Serialize for ExecutionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_payload().serialize(serializer)
    }
}

/// A compiled, limit-applied execution plan.
#[derive(Debug, Clone)]
pub enum Plan {
    /// Filtered scan.
    Find {
        /// Compiled filter.
        filter: Filter,
        /// Sort keys.
        sort: Vec<SortKey>,
        /// Rows to skip.
        skip: usize,
        /// Effective row cap.
        limit: usize,
        /// Optional projection.
        projection: Option<Projection>,
    },
    /// Stage pipeline (already capped).
    Aggregate(Pipeline),
    /// Count of matches.
    Count(Filter),
    /// Distinct values of a field among matches.
    Distinct {
        /// Compiled filter.
        filter: Filter,
        /// Dotted field path.
        field: String,
    },
}

/// Rows produced by a plan plus the count reported to the caller.
type PlanOutput = (Vec<Value>, usize);

impl Plan {
    /// Evaluates the plan over a collection's documents.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ExecutionFailure`] on evaluation errors or when
    /// the budget runs out.
    pub fn run(&self, docs: Vec<Value>, budget: &ReadBudget) -> Result<PlanOutput, QueryError> {
        match self {
            Self::Find {
                filter,
                sort,
                skip,
                limit,
                projection,
            } => {
                let mut matched = matching(docs, filter, budget)?;
                sort_documents(&mut matched, sort);
                let rows = matched
                    .into_iter()
                    .skip(*skip)
                    .take(*limit)
                    .map(|doc| match projection {
                        Some(p) => p.apply(doc),
                        None => Ok(doc),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let n = rows.len();
                Ok((rows, n))
            }
            Self::Aggregate(pipeline) => {
                let rows = pipeline.run(docs, budget)?;
                let n = rows.len();
                Ok((rows, n))
            }
            Self::Count(filter) => {
                let n = matching(docs, filter, budget)?.len();
                Ok((vec![json!({ "count": n })], n))
            }
            Self::Distinct { filter, field } => {
                let mut values: Vec<Value> = Vec::new();
                for doc in matching(docs, filter, budget)? {
                    let candidates = match get_path(&doc, field) {
                        None => continue,
                        Some(Value::Array(items)) => items.clone(),
                        Some(v) => vec![v.clone()],
                    };
                    for v in candidates {
                        if !values.iter().any(|seen| values_equal(seen, &v)) {
                            values.push(v);
                        }
                    }
                }
                values.sort_by(|a, b| sort_cmp(Some(a), Some(b)));
                let n = values.len();
                Ok((vec![json!({ "values": values, "count": n })], n))
            }
        }
    }
}

fn matching(docs: Vec<Value>, filter: &Filter, budget: &ReadBudget) -> Result<Vec<Value>, QueryError> {
    let mut out = Vec::new();
    for (i, doc) in docs.into_iter().enumerate() {
        if i % 256 == 0 {
            budget.check()?;
        }
        if filter.matches(&doc) {
            out.push(doc);
        }
    }
    Ok(out)
}

/// Parses string stages, rejects non-object stages, and appends a
/// `{"$limit": cap}` stage unless the pipeline already ends with one.
///
/// # Errors
///
/// Returns [`QueryError::MalformedStage`] for unparseable or non-object
/// stages.
pub(crate) fn prepare_pipeline(
    stages: &[Value],
    cap: usize,
) -> Result<Vec<Map<String, Value>>, QueryError> {
    let mut prepared = Vec::with_capacity(stages.len() + 1);
    for (index, stage) in stages.iter().enumerate() {
        let parsed = match stage {
            Value::Object(map) => map.clone(),
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => {
                    debug!(index, "parsed pipeline stage from JSON string");
                    map
                }
                Ok(other) => {
                    return Err(QueryError::MalformedStage {
                        index,
                        message: format!("stage string must encode an object, got {other}"),
                    });
                }
                Err(e) => {
                    return Err(QueryError::MalformedStage {
                        index,
                        message: format!("invalid JSON string: {e}"),
                    });
                }
            },
            other => {
                return Err(QueryError::MalformedStage {
                    index,
                    message: format!("stage must be an object or JSON string, got {other}"),
                });
            }
        };
        prepared.push(parsed);
    }
    let capped = prepared.last().is_some_and(|s| s.contains_key("$limit"));
    if !capped {
        let mut limit = Map::new();
        limit.insert("$limit".to_string(), Value::from(cap));
        prepared.push(limit);
    }
    Ok(prepared)
}

/// Executes validated queries against a data store.
#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<dyn DataStore>,
    policy: Arc<QueryPolicy>,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl QueryExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(store: Arc<dyn DataStore>, policy: Arc<QueryPolicy>) -> Self {
        Self { store, policy }
    }

    /// Effective row cap: the requested limit clamped to the policy maximum;
    /// no limit (or zero) means the maximum.
    #[must_use]
    pub fn effective_limit(&self, requested: Option<u64>) -> usize {
        let max = self.policy.max_result_rows();
        requested
            .filter(|&n| n > 0)
            .map_or(max, |n| usize::try_from(n).map_or(max, |n| n.min(max)))
    }

    /// Builds the execution plan without touching the store.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::MissingField`] for `distinct` without a field,
    /// [`QueryError::MalformedStage`] for bad pipeline stages, and
    /// [`QueryError::ExecutionFailure`] for unsupported operators.
    pub fn plan(&self, query: &ValidatedQuery) -> Result<Plan, QueryError> {
        let limit = self.effective_limit(query.options().limit);
        match (query.operation(), query.body()) {
            (Operation::Aggregate, QueryBody::Pipeline(stages)) => {
                let stages = prepare_pipeline(stages, limit)?;
                Ok(Plan::Aggregate(Pipeline::compile(&stages)?))
            }
            (Operation::Distinct, QueryBody::Filter(filter)) => {
                let field = query.field().ok_or_else(|| QueryError::MissingField {
                    operation: Operation::Distinct.to_string(),
                })?;
                Ok(Plan::Distinct {
                    filter: Filter::compile(filter)?,
                    field: field.to_string(),
                })
            }
            (Operation::CountDocuments, QueryBody::Filter(filter)) => {
                Ok(Plan::Count(Filter::compile(filter)?))
            }
            (Operation::Find, QueryBody::Filter(filter)) => {
                let options = query.options();
                Ok(Plan::Find {
                    filter: Filter::compile(filter)?,
                    sort: options.sort.clone(),
                    skip: options
                        .skip
                        .map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX)),
                    limit,
                    projection: options
                        .projection
                        .as_ref()
                        .map(|p| Projection::compile(p, false))
                        .transpose()?,
                })
            }
            (op, _) => Err(QueryError::MalformedQuery {
                message: format!("query shape does not match {op}"),
            }),
        }
    }

    /// Executes a validated query.
    ///
    /// Never panics and never returns `Err`: failures are reported inside the
    /// [`ExecutionResult`] so they can be fed back to the planning engine.
    pub async fn execute(&self, query: &ValidatedQuery) -> ExecutionResult {
        let info = QueryInfo::now(query.collection(), query.operation().as_str());
        let plan = match self.plan(query) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(collection = info.collection, operation = info.operation, error = %e, "query planning failed");
                return ExecutionResult::failure(Some(info), e);
            }
        };

        let store = Arc::clone(&self.store);
        let collection = query.collection().to_string();
        let time_limit = self.policy.max_execution_time();
        let task = tokio::task::spawn_blocking(move || {
            let budget = ReadBudget::new(time_limit);
            let docs = store.scan(&collection, &budget)?;
            plan.run(docs, &budget)
        });

        let outcome = match tokio::time::timeout(time_limit + TIMEOUT_GRACE, task).await {
            Err(_) => Err(QueryError::from(ReadBudget::new(time_limit).exceeded())),
            Ok(Err(join)) => Err(QueryError::execution(format!("read task failed: {join}"))),
            Ok(Ok(result)) => result,
        };

        match outcome {
            Ok((mut rows, row_count)) => {
                rows.truncate(self.policy.max_result_rows());
                let rows: Vec<Value> = rows.into_iter().map(normalize).collect();
                info!(
                    collection = info.collection,
                    operation = info.operation,
                    rows = rows.len(),
                    count = row_count,
                    "query executed"
                );
                ExecutionResult::ok(rows, row_count, info)
            }
            Err(e) => {
                warn!(collection = info.collection, operation = info.operation, error = %e, "query execution failed");
                ExecutionResult::failure(Some(info), e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::StorageError;
    use crate::query::{ToolInvocation, Validator};

    /// In-memory store that counts reads.
    struct CountingStore {
        collections: HashMap<String, Vec<Value>>,
        scans: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            let trades = (0..1500)
                .map(|i: usize| {
                    let ticker = ["AAPL", "MSFT", "NVDA"][i % 3];
                    let side = if i % 3 == 0 { "Sell" } else { "Buy" };
                    json!({
                        "_id": {"$oid": format!("{i:024x}")},
                        "TradeTypeName": side,
                        "Ticker": ticker,
                        "Qty": i,
                        "TradeDate": {"$date": "2024-01-15T00:00:00Z"}
                    })
                })
                .collect();
            let holdings = vec![
                json!({"PortfolioName": "Alpha", "Ticker": "AAPL"}),
                json!({"PortfolioName": "Beta", "Ticker": "AAPL"}),
                json!({"PortfolioName": "Alpha", "Ticker": "MSFT"}),
            ];
            Self {
                collections: HashMap::from([
                    ("trades".to_string(), trades),
                    ("holdings".to_string(), holdings),
                ]),
                scans: AtomicUsize::new(0),
            }
        }
    }

    impl DataStore for CountingStore {
        fn collections(&self) -> Result<Vec<String>, StorageError> {
            Ok(self.collections.keys().cloned().collect())
        }

        fn scan(&self, collection: &str, budget: &ReadBudget) -> Result<Vec<Value>, StorageError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            budget.check()?;
            Ok(self.collections.get(collection).cloned().unwrap_or_default())
        }
    }

    fn setup() -> (Arc<CountingStore>, Validator, QueryExecutor) {
        let store = Arc::new(CountingStore::new());
        let policy = Arc::new(QueryPolicy::default());
        let executor = QueryExecutor::new(store.clone(), policy.clone());
        (store, Validator::new(policy), executor)
    }

    fn validated(validator: &Validator, inv: &ToolInvocation) -> ValidatedQuery {
        validator
            .validate(inv)
            .unwrap_or_else(|e| panic!("validation failed: {e}"))
    }

    #[tokio::test]
    async fn test_find_gets_default_limit() {
        let (_, validator, executor) = setup();
        let inv = ToolInvocation::new("trades", "find", json!({"TradeTypeName": "Buy"}));
        let result = executor.execute(&validated(&validator, &inv)).await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.error.is_none());
        assert_eq!(result.row_count, 1000);
        assert!(result.rows.iter().all(|r| r["TradeTypeName"] == "Buy"));
        // identifiers and dates are flattened to strings
        assert!(result.rows[0]["_id"].is_string());
        assert_eq!(result.rows[0]["TradeDate"], json!("2024-01-15T00:00:00.000Z"));
    }

    #[test]
    fn test_limit_clamped() {
        let (_, _, executor) = setup();
        assert_eq!(executor.effective_limit(Some(999_999)), 1000);
        assert_eq!(executor.effective_limit(Some(25)), 25);
        assert_eq!(executor.effective_limit(Some(0)), 1000);
        assert_eq!(executor.effective_limit(None), 1000);
    }

    #[test]
    fn test_pipeline_gets_exactly_one_cap() {
        let stages = vec![json!({"$match": {}}), json!("{\"$sort\": {\"Qty\": -1}}")];
        let prepared = prepare_pipeline(&stages, 1000).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(prepared.len(), 3);
        assert_eq!(Value::Object(prepared[2].clone()), json!({"$limit": 1000}));
        assert_eq!(prepared.iter().filter(|s| s.contains_key("$limit")).count(), 1);

        let already = vec![json!({"$match": {}}), json!({"$limit": 5})];
        let prepared = prepare_pipeline(&already, 1000).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(prepared.len(), 2);
    }

    #[test]
    fn test_malformed_stages() {
        let err = prepare_pipeline(&[json!({"$match": {}}), json!("{not json")], 10);
        assert!(matches!(err, Err(QueryError::MalformedStage { index: 1, .. })));
        let err = prepare_pipeline(&[json!(42)], 10);
        assert!(matches!(err, Err(QueryError::MalformedStage { index: 0, .. })));
        let err = prepare_pipeline(&[json!("[1, 2]")], 10);
        assert!(matches!(err, Err(QueryError::MalformedStage { index: 0, .. })));
    }

    #[tokio::test]
    async fn test_distinct_without_field_never_reads() {
        let (store, validator, executor) = setup();
        let inv = ToolInvocation::new("holdings", "distinct", Value::Null);
        let result = executor.execute(&validated(&validator, &inv)).await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(QueryError::MissingField { .. })));
        assert_eq!(store.scans.load(Ordering::SeqCst), 0);
        assert_eq!(result.to_payload()["code"], "MissingField");
    }

    #[tokio::test]
    async fn test_distinct_values() {
        let (_, validator, executor) = setup();
        let inv = ToolInvocation::new("holdings", "distinct", json!({})).with_field("PortfolioName");
        let result = executor.execute(&validated(&validator, &inv)).await;
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows, vec![json!({"values": ["Alpha", "Beta"], "count": 2})]);
    }

    #[tokio::test]
    async fn test_count_is_idempotent() {
        let (_, validator, executor) = setup();
        let inv = ToolInvocation::new("trades", "countDocuments", json!([{"TradeTypeName": "Sell"}]));
        let q = validated(&validator, &inv);
        let first = executor.execute(&q).await;
        let second = executor.execute(&q).await;
        assert_eq!(first.row_count, 500);
        assert_eq!(first.row_count, second.row_count);
        assert_eq!(first.rows, vec![json!({"count": 500})]);
    }

    #[tokio::test]
    async fn test_aggregate_with_implicit_cap() {
        let (_, validator, executor) = setup();
        let inv = ToolInvocation::new(
            "trades",
            "aggregate",
            json!([{"$group": {"_id": "$Ticker", "n": {"$sum": 1}}}, {"$sort": {"_id": 1}}]),
        )
        .with_options(crate::query::QueryOptions {
            limit: Some(2),
            ..Default::default()
        });
        let result = executor.execute(&validated(&validator, &inv)).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.rows,
            vec![json!({"_id": "AAPL", "n": 500}), json!({"_id": "MSFT", "n": 500})]
        );
    }

    #[tokio::test]
    async fn test_find_sort_skip_projection() {
        let (_, validator, executor) = setup();
        let inv = ToolInvocation::new("trades", "find", json!({}))
            .with_options(crate::query::QueryOptions::from_value(&json!({
                "sort": {"Qty": -1},
                "skip": 1,
                "limit": 2,
                "projection": {"_id": 0, "Qty": 1}
            })));
        let result = executor.execute(&validated(&validator, &inv)).await;
        assert_eq!(result.rows, vec![json!({"Qty": 1498}), json!({"Qty": 1497})]);
    }

    #[tokio::test]
    async fn test_unsupported_operator_is_execution_failure() {
        let (_, validator, executor) = setup();
        let inv = ToolInvocation::new("trades", "find", json!({"Qty": {"$near": 1}}));
        let result = executor.execute(&validated(&validator, &inv)).await;
        assert_eq!(result.to_payload()["code"], "ExecutionFailure");
        assert_eq!(result.to_payload()["count"], 0);
    }

    #[tokio::test]
    async fn test_success_payload_shape() {
        let (_, validator, executor) = setup();
        let inv = ToolInvocation::new("holdings", "countDocuments", json!({}));
        let payload = executor.execute(&validated(&validator, &inv)).await.to_payload();
        assert_eq!(payload["success"], true);
        assert_eq!(payload["count"], 3);
        assert_eq!(payload["query_info"]["collection"], "holdings");
        assert_eq!(payload["query_info"]["operation"], "countDocuments");
        assert!(payload["query_info"]["executed_at"].is_string());
    }
}
