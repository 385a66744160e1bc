//! Aggregation expressions.
//!
//! Covers the expression subset used by `$project`, `$addFields`, `$group`
//! keys and accumulators: field references (`"$a.b"`), literals, nested
//! objects and arrays, and a small arithmetic/string/date operator set.

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use serde_json::{Map, Value};

use super::value::{as_date, as_f64, date_value, get_path, number, parse_datetime};
use crate::error::QueryError;

/// Expression operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    /// `$add`
    Add,
    /// `$subtract`
    Subtract,
    /// `$multiply`
    Multiply,
    /// `$divide`
    Divide,
    /// `$abs`
    Abs,
    /// `$round`
    Round,
    /// `$ifNull`
    IfNull,
    /// `$concat`
    Concat,
    /// `$toUpper`
    ToUpper,
    /// `$toLower`
    ToLower,
    /// `$year`
    Year,
    /// `$month`
    Month,
    /// `$dayOfMonth`
    DayOfMonth,
}

impl ExprOp {
    fn parse(name: &str) -> Option<Self> {
        let op = match name {
            "$add" => Self::Add,
            "$subtract" => Self::Subtract,
            "$multiply" => Self::Multiply,
            "$divide" => Self::Divide,
            "$abs" => Self::Abs,
            "$round" => Self::Round,
            "$ifNull" => Self::IfNull,
            "$concat" => Self::Concat,
            "$toUpper" => Self::ToUpper,
            "$toLower" => Self::ToLower,
            "$year" => Self::Year,
            "$month" => Self::Month,
            "$dayOfMonth" => Self::DayOfMonth,
            _ => return None,
        };
        Some(op)
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Add => "$add",
            Self::Subtract => "$subtract",
            Self::Multiply => "$multiply",
            Self::Divide => "$divide",
            Self::Abs => "$abs",
            Self::Round => "$round",
            Self::IfNull => "$ifNull",
            Self::Concat => "$concat",
            Self::ToUpper => "$toUpper",
            Self::ToLower => "$toLower",
            Self::Year => "$year",
            Self::Month => "$month",
            Self::DayOfMonth => "$dayOfMonth",
        }
    }

    /// Allowed argument count range.
    const fn arity(self) -> (usize, usize) {
        match self {
            Self::Add | Self::Multiply | Self::Concat => (0, usize::MAX),
            Self::Subtract | Self::Divide => (2, 2),
            Self::Round => (1, 2),
            Self::IfNull => (2, usize::MAX),
            Self::Abs | Self::ToUpper | Self::ToLower | Self::Year | Self::Month | Self::DayOfMonth => {
                (1, 1)
            }
        }
    }
}

/// A compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// Dotted field reference.
    Field(String),
    /// Object whose values are expressions.
    Object(Vec<(String, Self)>),
    /// Array of expressions.
    Array(Vec<Self>),
    /// Operator application.
    Op(ExprOp, Vec<Self>),
}

impl Expr {
    /// Compiles an expression value.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ExecutionFailure`] for unknown operators or
    /// wrong argument counts.
    pub fn compile(value: &Value) -> Result<Self, QueryError> {
        match value {
            Value::String(s) if s.starts_with("$$") => Err(QueryError::execution(format!(
                "aggregation variables are not supported: {s}"
            ))),
            Value::String(s) if s.starts_with('$') && s.len() > 1 => Ok(Self::Field(s[1..].to_string())),
            Value::Array(items) => items.iter().map(Self::compile).collect::<Result<_, _>>().map(Self::Array),
            Value::Object(map) => Self::compile_object(map),
            other => Ok(Self::Literal(other.clone())),
        }
    }

    fn compile_object(map: &Map<String, Value>) -> Result<Self, QueryError> {
        if map.len() == 1
            && let Some((key, arg)) = map.iter().next()
            && key.starts_with('$')
        {
            if key == "$literal" {
                return Ok(Self::Literal(arg.clone()));
            }
            let op = ExprOp::parse(key).ok_or_else(|| {
                QueryError::execution(format!("unsupported expression operator {key}"))
            })?;
            let args = match arg {
                Value::Array(items) => items.iter().map(Self::compile).collect::<Result<Vec<_>, _>>()?,
                single => vec![Self::compile(single)?],
            };
            let (min, max) = op.arity();
            if args.len() < min || args.len() > max {
                return Err(QueryError::execution(format!(
                    "{} takes {} argument(s), got {}",
                    op.name(),
                    if min == max { min.to_string() } else { format!("at least {min}") },
                    args.len()
                )));
            }
            return Ok(Self::Op(op, args));
        }
        if let Some(key) = map.keys().find(|k| k.starts_with('$')) {
            return Err(QueryError::execution(format!(
                "unsupported expression operator {key}"
            )));
        }
        map.iter()
            .map(|(k, v)| Ok((k.clone(), Self::compile(v)?)))
            .collect::<Result<_, _>>()
            .map(Self::Object)
    }

    /// Evaluates against a document. Missing fields evaluate to `null`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ExecutionFailure`] on type errors (for example
    /// `$concat` over a number, or division by zero).
    pub fn eval(&self, doc: &Value) -> Result<Value, QueryError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Field(path) => Ok(get_path(doc, path).cloned().unwrap_or(Value::Null)),
            Self::Object(fields) => {
                let mut out = Map::new();
                for (k, e) in fields {
                    out.insert(k.clone(), e.eval(doc)?);
                }
                Ok(Value::Object(out))
            }
            Self::Array(items) => items.iter().map(|e| e.eval(doc)).collect::<Result<_, _>>().map(Value::Array),
            Self::Op(op, args) => {
                let values = args.iter().map(|e| e.eval(doc)).collect::<Result<Vec<_>, _>>()?;
                apply(*op, &values)
            }
        }
    }
}

fn date_of(value: &Value) -> Option<DateTime<Utc>> {
    as_date(value).or_else(|| value.as_str().and_then(parse_datetime))
}

fn numeric(op: ExprOp, value: &Value) -> Result<f64, QueryError> {
    as_f64(value).ok_or_else(|| {
        QueryError::execution(format!("{} only supports numeric types, got {value}", op.name()))
    })
}

/// Moves a date by a millisecond offset; out-of-range results are errors.
#[allow(clippy::cast_possible_truncation)]
fn shift_date(dt: DateTime<Utc>, millis: f64) -> Result<Value, QueryError> {
    TimeDelta::try_milliseconds(millis as i64)
        .and_then(|delta| dt.checked_add_signed(delta))
        .map(date_value)
        .ok_or_else(|| QueryError::execution("date arithmetic overflow"))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn apply(op: ExprOp, args: &[Value]) -> Result<Value, QueryError> {
    if !matches!(op, ExprOp::IfNull | ExprOp::ToUpper | ExprOp::ToLower) && args.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    match op {
        ExprOp::Add => {
            let mut total = 0.0;
            let mut base_date = None;
            for v in args {
                if let Some(dt) = as_date(v) {
                    base_date = Some(dt);
                } else {
                    total += numeric(op, v)?;
                }
            }
            base_date.map_or_else(|| Ok(number(total)), |dt| shift_date(dt, total))
        }
        ExprOp::Subtract => match (as_date(&args[0]), date_of(&args[1])) {
            (Some(a), Some(b)) => Ok(number((a - b).num_milliseconds() as f64)),
            (Some(a), None) => shift_date(a, -numeric(op, &args[1])?),
            _ => Ok(number(numeric(op, &args[0])? - numeric(op, &args[1])?)),
        },
        ExprOp::Multiply => args
            .iter()
            .try_fold(1.0, |acc, v| numeric(op, v).map(|x| acc * x))
            .map(number),
        ExprOp::Divide => {
            let divisor = numeric(op, &args[1])?;
            if divisor == 0.0 {
                return Err(QueryError::execution("can't $divide by zero"));
            }
            Ok(number(numeric(op, &args[0])? / divisor))
        }
        ExprOp::Abs => Ok(number(numeric(op, &args[0])?.abs())),
        ExprOp::Round => {
            let x = numeric(op, &args[0])?;
            let places = args.get(1).map(|p| numeric(op, p)).transpose()?.unwrap_or(0.0);
            let factor = 10f64.powi(places as i32);
            Ok(number((x * factor).round() / factor))
        }
        ExprOp::IfNull => Ok(args
            .iter()
            .find(|v| !v.is_null())
            .or_else(|| args.last())
            .cloned()
            .unwrap_or(Value::Null)),
        ExprOp::Concat => {
            let mut out = String::new();
            for v in args {
                let s = v.as_str().ok_or_else(|| {
                    QueryError::execution(format!("$concat only supports strings, got {v}"))
                })?;
                out.push_str(s);
            }
            Ok(Value::String(out))
        }
        ExprOp::ToUpper | ExprOp::ToLower => {
            let text = match &args[0] {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(Value::String(if op == ExprOp::ToUpper {
                text.to_uppercase()
            } else {
                text.to_lowercase()
            }))
        }
        ExprOp::Year | ExprOp::Month | ExprOp::DayOfMonth => {
            let dt = date_of(&args[0]).ok_or_else(|| {
                QueryError::execution(format!("{} requires a date, got {}", op.name(), args[0]))
            })?;
            let part = match op {
                ExprOp::Year => f64::from(dt.year()),
                ExprOp::Month => f64::from(dt.month()),
                _ => f64::from(dt.day()),
            };
            Ok(number(part))
        }
    }
}
