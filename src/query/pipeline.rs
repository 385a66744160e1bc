//! Aggregation pipeline evaluation.
//!
//! Stages are compiled up front so a malformed pipeline fails before the
//! collection is read. Evaluation materializes each stage's output; the
//! read budget is checked between stages and periodically inside the
//! per-document loops.

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::expr::Expr;
use super::filter::Filter;
use super::invocation::{SortKey, parse_sort};
use super::value::{Document, as_f64, get_path, number, remove_path, set_path, sort_cmp, values_equal};
use crate::error::QueryError;
use crate::storage::ReadBudget;

/// Documents processed between budget checks.
const BUDGET_CHECK_INTERVAL: usize = 256;

fn tick(i: usize, budget: &ReadBudget) -> Result<(), QueryError> {
    if i % BUDGET_CHECK_INTERVAL == 0 {
        budget.check()?;
    }
    Ok(())
}

/// A field projection (find `projection` option or `$project` stage).
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Keep only the listed paths (computed when an expression is given).
    Include {
        /// Paths and optional computed values.
        fields: Vec<(String, Option<Expr>)>,
        /// Keep `_id`.
        keep_id: bool,
    },
    /// Drop the listed paths.
    Exclude(Vec<String>),
}

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

impl Projection {
    /// Compiles a projection object. Computed fields are only accepted when
    /// `allow_expressions` is set (the `$project` stage).
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ExecutionFailure`] when inclusion and exclusion
    /// are mixed, or for unsupported values.
    pub fn compile(def: &Map<String, Value>, allow_expressions: bool) -> Result<Self, QueryError> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        let mut keep_id = true;
        for (path, value) in def {
            match flag(value) {
                Some(false) if path == "_id" => keep_id = false,
                Some(false) => exclude.push(path.clone()),
                Some(true) => include.push((path.clone(), None)),
                None if allow_expressions => include.push((path.clone(), Some(Expr::compile(value)?))),
                None => {
                    return Err(QueryError::execution(format!(
                        "unsupported projection value for {path}: {value}"
                    )));
                }
            }
        }
        match (include.is_empty(), exclude.is_empty()) {
            (false, false) => Err(QueryError::execution(
                "cannot mix inclusion and exclusion in a projection",
            )),
            (true, _) => {
                if !keep_id {
                    exclude.push("_id".to_string());
                }
                Ok(Self::Exclude(exclude))
            }
            (false, true) => Ok(Self::Include {
                fields: include,
                keep_id,
            }),
        }
    }

    /// Applies the projection to one document.
    ///
    /// # Errors
    ///
    /// Propagates expression evaluation failures.
    pub fn apply(&self, doc: Value) -> Result<Value, QueryError> {
        match self {
            Self::Exclude(paths) => {
                let Value::Object(mut map) = doc else {
                    return Ok(doc);
                };
                for path in paths {
                    remove_path(&mut map, path);
                }
                Ok(Value::Object(map))
            }
            Self::Include { fields, keep_id } => {
                let mut out = Document::new();
                if *keep_id && let Some(id) = doc.get("_id") {
                    out.insert("_id".to_string(), id.clone());
                }
                for (path, expr) in fields {
                    match expr {
                        Some(e) => set_path(&mut out, path, e.eval(&doc)?),
                        None => {
                            if let Some(v) = get_path(&doc, path) {
                                set_path(&mut out, path, v.clone());
                            }
                        }
                    }
                }
                Ok(Value::Object(out))
            }
        }
    }
}

/// Sorts documents in place (stable).
pub fn sort_documents(docs: &mut [Value], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        keys.iter()
            .map(|k| {
                let ord = sort_cmp(get_path(a, &k.field), get_path(b, &k.field));
                if k.descending { ord.reverse() } else { ord }
            })
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Group accumulators.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// `$sum`
    Sum(Expr),
    /// `$avg`
    Avg(Expr),
    /// `$min`
    Min(Expr),
    /// `$max`
    Max(Expr),
    /// `$first`
    First(Expr),
    /// `$last`
    Last(Expr),
    /// `$push`
    Push(Expr),
    /// `$addToSet`
    AddToSet(Expr),
    /// `$count`
    Count,
}

impl Accumulator {
    fn compile(name: &str, def: &Value) -> Result<Self, QueryError> {
        let map = def
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| QueryError::execution(format!("accumulator {name} must be a single-key object")))?;
        let Some((op, arg)) = map.iter().next() else {
            return Err(QueryError::execution(format!("accumulator {name} is empty")));
        };
        let acc = match op.as_str() {
            "$sum" => Self::Sum(Expr::compile(arg)?),
            "$avg" => Self::Avg(Expr::compile(arg)?),
            "$min" => Self::Min(Expr::compile(arg)?),
            "$max" => Self::Max(Expr::compile(arg)?),
            "$first" => Self::First(Expr::compile(arg)?),
            "$last" => Self::Last(Expr::compile(arg)?),
            "$push" => Self::Push(Expr::compile(arg)?),
            "$addToSet" => Self::AddToSet(Expr::compile(arg)?),
            "$count" => Self::Count,
            other => {
                return Err(QueryError::execution(format!(
                    "unsupported accumulator {other}"
                )));
            }
        };
        Ok(acc)
    }

    const fn initial(&self) -> AccState {
        match self {
            Self::Sum(_) => AccState::Sum(0.0),
            Self::Avg(_) => AccState::Avg { sum: 0.0, n: 0 },
            Self::Min(_) | Self::Max(_) => AccState::Extreme(None),
            Self::First(_) => AccState::First(None),
            Self::Last(_) => AccState::Last(Value::Null),
            Self::Push(_) | Self::AddToSet(_) => AccState::Values(Vec::new()),
            Self::Count => AccState::Count(0),
        }
    }

    fn update(&self, state: &mut AccState, doc: &Value) -> Result<(), QueryError> {
        match (self, state) {
            (Self::Sum(e), AccState::Sum(total)) => {
                if let Some(x) = as_f64(&e.eval(doc)?) {
                    *total += x;
                }
            }
            (Self::Avg(e), AccState::Avg { sum, n }) => {
                if let Some(x) = as_f64(&e.eval(doc)?) {
                    *sum += x;
                    *n += 1;
                }
            }
            (Self::Min(e), AccState::Extreme(best)) | (Self::Max(e), AccState::Extreme(best)) => {
                let v = e.eval(doc)?;
                if v.is_null() {
                    return Ok(());
                }
                let want = if matches!(self, Self::Min(_)) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                };
                let replace = best.as_ref().is_none_or(|b| sort_cmp(Some(&v), Some(b)) == want);
                if replace {
                    *best = Some(v);
                }
            }
            (Self::First(e), AccState::First(slot)) => {
                if slot.is_none() {
                    *slot = Some(e.eval(doc)?);
                }
            }
            (Self::Last(e), AccState::Last(slot)) => *slot = e.eval(doc)?,
            (Self::Push(e), AccState::Values(items)) => items.push(e.eval(doc)?),
            (Self::AddToSet(e), AccState::Values(items)) => {
                let v = e.eval(doc)?;
                if !items.iter().any(|x| values_equal(x, &v)) {
                    items.push(v);
                }
            }
            (Self::Count, AccState::Count(n)) => *n += 1,
            _ => return Err(QueryError::execution("accumulator state mismatch")),
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum AccState {
    Sum(f64),
    Avg { sum: f64, n: u64 },
    Extreme(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Values(Vec<Value>),
    Count(u64),
}

impl AccState {
    #[allow(clippy::cast_precision_loss)]
    fn finish(self) -> Value {
        match self {
            Self::Sum(total) => number(total),
            Self::Avg { n: 0, .. } => Value::Null,
            Self::Avg { sum, n } => number(sum / n as f64),
            Self::Extreme(v) | Self::First(v) => v.unwrap_or(Value::Null),
            Self::Last(v) => v,
            Self::Values(items) => Value::Array(items),
            Self::Count(n) => number(n as f64),
        }
    }
}

/// One compiled stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// `$match`
    Match(Box<FilterStage>),
    /// `$project`
    Project(Projection),
    /// `$addFields` / `$set`
    AddFields(Vec<(String, Expr)>),
    /// `$group`
    Group {
        /// Group key.
        id: Expr,
        /// Output fields.
        accumulators: Vec<(String, Accumulator)>,
    },
    /// `$sort`
    Sort(Vec<SortKey>),
    /// `$skip`
    Skip(usize),
    /// `$limit`
    Limit(usize),
    /// `$count`
    Count(String),
    /// `$unwind`
    Unwind {
        /// Array field path.
        path: String,
        /// Keep documents whose array is missing or empty.
        preserve_empty: bool,
    },
}

/// A `$match` filter with its source kept for equality checks.
#[derive(Debug, Clone)]
pub struct FilterStage {
    source: Map<String, Value>,
    filter: Filter,
}

impl PartialEq for FilterStage {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn positive_count(stage: &str, value: &Value, allow_zero: bool) -> Result<usize, QueryError> {
    let n = as_f64(value)
        .filter(|f| f.fract() == 0.0 && (*f > 0.0 || (allow_zero && *f == 0.0)))
        .ok_or_else(|| {
            QueryError::execution(format!(
                "{stage} requires a {} integer, got {value}",
                if allow_zero { "non-negative" } else { "positive" }
            ))
        })?;
    Ok(n as usize)
}

fn field_path(stage: &str, value: &Value) -> Result<String, QueryError> {
    value
        .as_str()
        .and_then(|s| s.strip_prefix('$'))
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| QueryError::execution(format!("{stage} requires a \"$field\" path, got {value}")))
}

impl Stage {
    /// Compiles one stage object.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::MalformedStage`] when the stage is not a
    /// single-key object, or [`QueryError::ExecutionFailure`] for unsupported
    /// stages and operands.
    pub fn compile(index: usize, def: &Map<String, Value>) -> Result<Self, QueryError> {
        let mut entries = def.iter();
        let (Some((name, arg)), None) = (entries.next(), entries.next()) else {
            return Err(QueryError::MalformedStage {
                index,
                message: "a pipeline stage must contain exactly one field".to_string(),
            });
        };
        let stage = match name.as_str() {
            "$match" => {
                let source = arg
                    .as_object()
                    .cloned()
                    .ok_or_else(|| QueryError::execution("$match requires an object"))?;
                let filter = Filter::compile(&source)?;
                Self::Match(Box::new(FilterStage { source, filter }))
            }
            "$project" => {
                let def = arg
                    .as_object()
                    .ok_or_else(|| QueryError::execution("$project requires an object"))?;
                Self::Project(Projection::compile(def, true)?)
            }
            "$addFields" | "$set" => {
                let def = arg
                    .as_object()
                    .ok_or_else(|| QueryError::execution(format!("{name} requires an object")))?;
                Self::AddFields(
                    def.iter()
                        .map(|(k, v)| Ok((k.clone(), Expr::compile(v)?)))
                        .collect::<Result<_, QueryError>>()?,
                )
            }
            "$group" => {
                let def = arg
                    .as_object()
                    .ok_or_else(|| QueryError::execution("$group requires an object"))?;
                let id = def
                    .get("_id")
                    .ok_or_else(|| QueryError::execution("$group requires an _id"))?;
                let accumulators = def
                    .iter()
                    .filter(|(k, _)| k.as_str() != "_id")
                    .map(|(k, v)| Ok((k.clone(), Accumulator::compile(k, v)?)))
                    .collect::<Result<_, QueryError>>()?;
                Self::Group {
                    id: Expr::compile(id)?,
                    accumulators,
                }
            }
            "$sort" => {
                let keys = parse_sort(arg);
                if keys.is_empty() {
                    return Err(QueryError::execution("$sort requires at least one key"));
                }
                Self::Sort(keys)
            }
            "$skip" => Self::Skip(positive_count("$skip", arg, true)?),
            "$limit" => Self::Limit(positive_count("$limit", arg, false)?),
            "$count" => {
                let field = arg
                    .as_str()
                    .filter(|s| !s.is_empty() && !s.starts_with('$') && !s.contains('.'))
                    .ok_or_else(|| QueryError::execution("$count requires a plain field name"))?;
                Self::Count(field.to_string())
            }
            "$unwind" => match arg {
                Value::Object(opts) => Self::Unwind {
                    path: field_path("$unwind", opts.get("path").unwrap_or(&Value::Null))?,
                    preserve_empty: opts
                        .get("preserveNullAndEmptyArrays")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                },
                other => Self::Unwind {
                    path: field_path("$unwind", other)?,
                    preserve_empty: false,
                },
            },
            other => {
                return Err(QueryError::execution(format!(
                    "unsupported pipeline stage {other}"
                )));
            }
        };
        Ok(stage)
    }

    fn run(&self, docs: Vec<Value>, budget: &ReadBudget) -> Result<Vec<Value>, QueryError> {
        match self {
            Self::Match(stage) => {
                let mut out = Vec::new();
                for (i, doc) in docs.into_iter().enumerate() {
                    tick(i, budget)?;
                    if stage.filter.matches(&doc) {
                        out.push(doc);
                    }
                }
                Ok(out)
            }
            Self::Project(projection) => docs
                .into_iter()
                .enumerate()
                .map(|(i, doc)| {
                    tick(i, budget)?;
                    projection.apply(doc)
                })
                .collect(),
            Self::AddFields(fields) => docs
                .into_iter()
                .enumerate()
                .map(|(i, doc)| {
                    tick(i, budget)?;
                    let Value::Object(mut map) = doc else {
                        return Ok(doc);
                    };
                    let source = Value::Object(map.clone());
                    for (path, expr) in fields {
                        set_path(&mut map, path, expr.eval(&source)?);
                    }
                    Ok(Value::Object(map))
                })
                .collect(),
            Self::Group { id, accumulators } => group(docs, id, accumulators, budget),
            Self::Sort(keys) => {
                let mut docs = docs;
                sort_documents(&mut docs, keys);
                Ok(docs)
            }
            Self::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
            Self::Limit(n) => {
                let mut docs = docs;
                docs.truncate(*n);
                Ok(docs)
            }
            Self::Count(field) => {
                if docs.is_empty() {
                    return Ok(Vec::new());
                }
                let mut out = Map::new();
                out.insert(field.clone(), Value::from(docs.len()));
                Ok(vec![Value::Object(out)])
            }
            Self::Unwind {
                path,
                preserve_empty,
            } => {
                let mut out = Vec::with_capacity(docs.len());
                for (i, doc) in docs.into_iter().enumerate() {
                    tick(i, budget)?;
                    unwind_one(doc, path, *preserve_empty, &mut out);
                }
                Ok(out)
            }
        }
    }
}

fn unwind_one(doc: Value, path: &str, preserve_empty: bool, out: &mut Vec<Value>) {
    match get_path(&doc, path) {
        Some(Value::Array(items)) if !items.is_empty() => {
            let items = items.clone();
            let Value::Object(base) = doc else {
                return;
            };
            for item in items {
                let mut copy = base.clone();
                set_path(&mut copy, path, item);
                out.push(Value::Object(copy));
            }
        }
        Some(Value::Array(_) | Value::Null) | None => {
            if preserve_empty {
                out.push(doc);
            }
        }
        Some(_) => out.push(doc),
    }
}

/// Canonical form of a group key: numerically equal keys (`1`, `1.0`,
/// `{"$numberLong": "1"}`) land in the same bucket.
fn group_key(key: Value) -> Value {
    if let Some(f) = as_f64(&key) {
        return number(f);
    }
    match key {
        Value::Array(items) => Value::Array(items.into_iter().map(group_key).collect()),
        Value::Object(obj) => Value::Object(obj.into_iter().map(|(k, v)| (k, group_key(v))).collect()),
        other => other,
    }
}

fn group(
    docs: Vec<Value>,
    id: &Expr,
    accumulators: &[(String, Accumulator)],
    budget: &ReadBudget,
) -> Result<Vec<Value>, QueryError> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<AccState>)> = Vec::new();

    for (i, doc) in docs.iter().enumerate() {
        tick(i, budget)?;
        let key = group_key(id.eval(doc)?);
        let slot = match index.get(&key.to_string()) {
            Some(&slot) => slot,
            None => {
                index.insert(key.to_string(), groups.len());
                groups.push((key, accumulators.iter().map(|(_, a)| a.initial()).collect()));
                groups.len() - 1
            }
        };
        let states = &mut groups[slot].1;
        for ((_, acc), state) in accumulators.iter().zip(states.iter_mut()) {
            acc.update(state, doc)?;
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, states)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            for ((name, _), state) in accumulators.iter().zip(states) {
                out.insert(name.clone(), state.finish());
            }
            Value::Object(out)
        })
        .collect())
}

/// A compiled pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Compiles structured stages.
    ///
    /// # Errors
    ///
    /// Returns the first stage compilation error.
    pub fn compile(stages: &[Map<String, Value>]) -> Result<Self, QueryError> {
        stages
            .iter()
            .enumerate()
            .map(|(i, s)| Stage::compile(i, s))
            .collect::<Result<_, _>>()
            .map(|stages| Self { stages })
    }

    /// Runs the pipeline over a collection's documents.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ExecutionFailure`] on evaluation errors or when
    /// the read budget runs out.
    pub fn run(&self, docs: Vec<Value>, budget: &ReadBudget) -> Result<Vec<Value>, QueryError> {
        let mut docs = docs;
        for stage in &self.stages {
            budget.check()?;
            docs = stage.run(docs, budget)?;
        }
        Ok(docs)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn stages(value: &Value) -> Vec<Map<String, Value>> {
        value
            .as_array()
            .map(|items| items.iter().filter_map(|s| s.as_object().cloned()).collect())
            .unwrap_or_default()
    }

    fn run(pipeline: &Value, docs: &Value) -> Vec<Value> {
        let compiled = Pipeline::compile(&stages(pipeline)).unwrap_or_else(|e| panic!("compile failed: {e}"));
        let docs = docs.as_array().cloned().unwrap_or_default();
        compiled
            .run(docs, &ReadBudget::new(Duration::from_secs(5)))
            .unwrap_or_else(|e| panic!("run failed: {e}"))
    }

    fn trades() -> Value {
        json!([
            {"PortfolioName": "Alpha", "Ticker": "AAPL", "Qty": 10, "Price": 100.0, "TradeDate": {"$date": "2024-01-05T00:00:00Z"}},
            {"PortfolioName": "Beta", "Ticker": "MSFT", "Qty": 5, "Price": 300.0, "TradeDate": {"$date": "2024-02-10T00:00:00Z"}},
            {"PortfolioName": "Alpha", "Ticker": "MSFT", "Qty": 2, "Price": 310.0, "TradeDate": {"$date": "2024-02-11T00:00:00Z"}},
            {"PortfolioName": "Gamma", "Ticker": "AAPL", "Qty": 1, "Price": 105.0, "TradeDate": {"$date": "2024-03-01T00:00:00Z"}}
        ])
    }

    #[test]
    fn test_group_sum_sort() {
        let out = run(
            &json!([
                {"$group": {"_id": "$PortfolioName", "total": {"$sum": "$Qty"}, "trades": {"$sum": 1}}},
                {"$sort": {"total": -1}}
            ]),
            &trades(),
        );
        assert_eq!(
            out,
            vec![
                json!({"_id": "Alpha", "total": 12, "trades": 2}),
                json!({"_id": "Beta", "total": 5, "trades": 1}),
                json!({"_id": "Gamma", "total": 1, "trades": 1}),
            ]
        );
    }

    #[test]
    fn test_group_merges_numerically_equal_keys() {
        let out = run(
            &json!([
                {"$group": {"_id": "$Lot", "n": {"$sum": 1}}},
                {"$sort": {"_id": 1}}
            ]),
            &json!([
                {"Lot": 1},
                {"Lot": 1.0},
                {"Lot": {"$numberLong": "1"}},
                {"Lot": 2.5}
            ]),
        );
        assert_eq!(out, vec![json!({"_id": 1, "n": 3}), json!({"_id": 2.5, "n": 1})]);
    }

    #[test]
    fn test_group_accumulators() {
        let out = run(
            &json!([
                {"$group": {
                    "_id": null,
                    "avg": {"$avg": "$Price"},
                    "min": {"$min": "$Price"},
                    "max": {"$max": "$Price"},
                    "tickers": {"$addToSet": "$Ticker"},
                    "first": {"$first": "$Ticker"},
                    "n": {"$count": {}}
                }}
            ]),
            &trades(),
        );
        assert_eq!(
            out,
            vec![json!({
                "_id": null,
                "avg": 203.75,
                "min": 100.0,
                "max": 310.0,
                "tickers": ["AAPL", "MSFT"],
                "first": "AAPL",
                "n": 4
            })]
        );
    }

    #[test]
    fn test_match_date_range_and_count() {
        let out = run(
            &json!([
                {"$match": {"TradeDate": {"$gte": "2024-02-01", "$lt": "2024-03-01"}}},
                {"$count": "n"}
            ]),
            &trades(),
        );
        assert_eq!(out, vec![json!({"n": 2})]);
    }

    #[test]
    fn test_count_of_nothing_is_empty() {
        let out = run(&json!([{"$match": {"Qty": {"$gt": 1000}}}, {"$count": "n"}]), &trades());
        assert!(out.is_empty());
    }

    #[test]
    fn test_project_computed_and_limit() {
        let out = run(
            &json!([
                {"$sort": {"Qty": -1}},
                {"$limit": 1},
                {"$project": {"_id": 0, "Ticker": 1, "value": {"$multiply": ["$Qty", "$Price"]}}}
            ]),
            &trades(),
        );
        assert_eq!(out, vec![json!({"Ticker": "AAPL", "value": 1000})]);
    }

    #[test]
    fn test_group_by_month() {
        let out = run(
            &json!([
                {"$group": {"_id": {"m": {"$month": "$TradeDate"}}, "n": {"$sum": 1}}},
                {"$sort": {"_id.m": 1}}
            ]),
            &trades(),
        );
        assert_eq!(out.len(), 3);
        assert_eq!(out[1], json!({"_id": {"m": 2}, "n": 2}));
    }

    #[test]
    fn test_unwind_and_add_fields() {
        let docs = json!([
            {"p": "A", "tags": ["x", "y"]},
            {"p": "B", "tags": []},
            {"p": "C"}
        ]);
        let out = run(&json!([{"$unwind": "$tags"}, {"$set": {"label": {"$concat": ["$p", ":", "$tags"]}}}]), &docs);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["label"], json!("A:y"));

        let kept = run(
            &json!([{"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}}]),
            &docs,
        );
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn test_skip() {
        let out = run(&json!([{"$skip": 3}]), &trades());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_unsupported_stage_and_multi_key() {
        let err = Pipeline::compile(&stages(&json!([{"$lookup": {"from": "holdings"}}])));
        assert!(matches!(err, Err(QueryError::ExecutionFailure { .. })));

        let err = Pipeline::compile(&stages(&json!([{}, {"$match": {}}])));
        assert!(matches!(err, Err(QueryError::MalformedStage { index: 0, .. })));

        let err = Pipeline::compile(&stages(&json!([{"$limit": 0}])));
        assert!(err.is_err());
    }

    #[test]
    fn test_projection_modes() {
        let doc = json!({"_id": "1", "a": 1, "b": {"c": 2, "d": 3}});
        let def = json!({"b.c": 1});
        let p = Projection::compile(def.as_object().unwrap_or(&Map::new()), false)
            .unwrap_or_else(|e| panic!("compile failed: {e}"));
        assert_eq!(p.apply(doc.clone()).ok(), Some(json!({"_id": "1", "b": {"c": 2}})));

        let def = json!({"a": 0, "_id": 0});
        let p = Projection::compile(def.as_object().unwrap_or(&Map::new()), false)
            .unwrap_or_else(|e| panic!("compile failed: {e}"));
        assert_eq!(p.apply(doc).ok(), Some(json!({"b": {"c": 2, "d": 3}})));

        let mixed = json!({"a": 1, "b": 0});
        assert!(Projection::compile(mixed.as_object().unwrap_or(&Map::new()), false).is_err());
    }

    #[test]
    fn test_expired_budget_aborts() {
        let compiled = Pipeline::compile(&stages(&json!([{"$match": {}}])))
            .unwrap_or_else(|e| panic!("compile failed: {e}"));
        let err = compiled.run(vec![json!({})], &ReadBudget::new(Duration::ZERO));
        assert_eq!(
            err.err().map(|e| e.to_string()),
            Some("Query execution failed: operation exceeded time limit of 0 ms".to_string())
        );
    }
}
