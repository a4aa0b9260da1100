use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input. The caller is never part of the command;
/// it is the authenticated connection user.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertFacility {
        data_uri: String,
        active: bool,
    },
    UpdateFacility {
        id: Ulid,
        data_uri: String,
        active: bool,
    },
    DeleteFacility {
        id: Ulid,
    },
    InsertSpace {
        facility_id: Ulid,
        capacity: u32,
        price_per_night: Wei,
        active: bool,
        data_uri: String,
    },
    UpdateSpace {
        id: Ulid,
        capacity: u32,
        price_per_night: Wei,
        active: bool,
        data_uri: String,
    },
    DeleteSpace {
        id: Ulid,
    },
    InsertStay {
        space_id: Ulid,
        day_start: Day,
        days: u32,
        units: u32,
        payment: Wei,
        data_uri: String,
    },
    ModifyStay {
        id: Ulid,
        day_start: Day,
        days: u32,
        units: u32,
        additional_payment: Wei,
    },
    CheckIn {
        id: Ulid,
    },
    CheckOut {
        id: Ulid,
    },
    CancelStay {
        id: Ulid,
    },
    SelectFacilities {
        filter: FacilityFilter,
    },
    SelectSpaces {
        filter: SpaceFilter,
    },
    SelectStays {
        filter: StayFilter,
    },
    SelectAvailability {
        space_id: Ulid,
        day_start: Day,
        days: u32,
    },
}

#[derive(Debug, PartialEq)]
pub enum FacilityFilter {
    All,
    Owner(Account),
    Id(Ulid),
}

#[derive(Debug, PartialEq)]
pub enum SpaceFilter {
    Facility(Ulid),
    Id(Ulid),
}

#[derive(Debug, PartialEq)]
pub enum StayFilter {
    Id(Ulid),
    Guest(Account),
    Space(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let v = values.as_slice();

    match table.as_str() {
        "facilities" => {
            arity("facilities", v, 2, 2)?;
            Ok(Command::InsertFacility {
                data_uri: parse_string(&v[0])?,
                active: parse_bool(&v[1])?,
            })
        }
        "facility_updates" => {
            arity("facility_updates", v, 3, 3)?;
            Ok(Command::UpdateFacility {
                id: parse_ulid(&v[0])?,
                data_uri: parse_string(&v[1])?,
                active: parse_bool(&v[2])?,
            })
        }
        "spaces" => {
            arity("spaces", v, 5, 5)?;
            Ok(Command::InsertSpace {
                facility_id: parse_ulid(&v[0])?,
                capacity: parse_u32(&v[1])?,
                price_per_night: parse_wei(&v[2])?,
                active: parse_bool(&v[3])?,
                data_uri: parse_string(&v[4])?,
            })
        }
        "space_updates" => {
            arity("space_updates", v, 5, 5)?;
            Ok(Command::UpdateSpace {
                id: parse_ulid(&v[0])?,
                capacity: parse_u32(&v[1])?,
                price_per_night: parse_wei(&v[2])?,
                active: parse_bool(&v[3])?,
                data_uri: parse_string(&v[4])?,
            })
        }
        "stays" => {
            arity("stays", v, 5, 6)?;
            let data_uri = match v.get(5) {
                Some(expr) => parse_string_or_null(expr)?.unwrap_or_default(),
                None => String::new(),
            };
            Ok(Command::InsertStay {
                space_id: parse_ulid(&v[0])?,
                day_start: parse_i64(&v[1])?,
                days: parse_u32(&v[2])?,
                units: parse_u32(&v[3])?,
                payment: parse_wei(&v[4])?,
                data_uri,
            })
        }
        "stay_changes" => {
            arity("stay_changes", v, 5, 5)?;
            Ok(Command::ModifyStay {
                id: parse_ulid(&v[0])?,
                day_start: parse_i64(&v[1])?,
                days: parse_u32(&v[2])?,
                units: parse_u32(&v[3])?,
                additional_payment: parse_wei(&v[4])?,
            })
        }
        "check_ins" => {
            arity("check_ins", v, 1, 1)?;
            Ok(Command::CheckIn { id: parse_ulid(&v[0])? })
        }
        "check_outs" => {
            arity("check_outs", v, 1, 1)?;
            Ok(Command::CheckOut { id: parse_ulid(&v[0])? })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn arity(table: &'static str, values: &[Expr], min: usize, max: usize) -> Result<(), SqlError> {
    if values.len() < min || values.len() > max {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "facilities" => Ok(Command::DeleteFacility { id }),
        "spaces" => Ok(Command::DeleteSpace { id }),
        "stays" => Ok(Command::CancelStay { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_equalities(selection, &mut filters)?;
    }
    let find = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "facilities" => {
            let filter = if let Some(e) = find("id") {
                FacilityFilter::Id(parse_ulid(e)?)
            } else if let Some(e) = find("owner") {
                FacilityFilter::Owner(Account::new(parse_string(e)?))
            } else {
                FacilityFilter::All
            };
            Ok(Command::SelectFacilities { filter })
        }
        "spaces" => {
            let filter = if let Some(e) = find("id") {
                SpaceFilter::Id(parse_ulid(e)?)
            } else if let Some(e) = find("facility_id") {
                SpaceFilter::Facility(parse_ulid(e)?)
            } else {
                return Err(SqlError::MissingFilter("facility_id"));
            };
            Ok(Command::SelectSpaces { filter })
        }
        "stays" => {
            let filter = if let Some(e) = find("id") {
                StayFilter::Id(parse_ulid(e)?)
            } else if let Some(e) = find("guest") {
                StayFilter::Guest(Account::new(parse_string(e)?))
            } else if let Some(e) = find("space_id") {
                StayFilter::Space(parse_ulid(e)?)
            } else {
                return Err(SqlError::MissingFilter("guest"));
            };
            Ok(Command::SelectStays { filter })
        }
        "availability" => Ok(Command::SelectAvailability {
            space_id: parse_ulid(find("space_id").ok_or(SqlError::MissingFilter("space_id"))?)?,
            day_start: parse_i64(find("day_start").ok_or(SqlError::MissingFilter("day_start"))?)?,
            days: parse_u32(find("days").ok_or(SqlError::MissingFilter("days"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 1 AND b = 2 ...` into `(column, value)` pairs.
fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right));
            Ok(())
        }
        Expr::Nested(inner) => collect_equalities(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row of an INSERT.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

/// Integer literal, quoted or bare, with an optional leading minus.
fn integer_text(expr: &Expr) -> Result<String, SqlError> {
    match expr {
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(format!("-{}", integer_text(expr)?)),
        _ => match extract_value(expr) {
            Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
            Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
            None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    let s = integer_text(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Money does not fit in i64; parse the literal text directly.
fn parse_wei(expr: &Expr) -> Result<Wei, SqlError> {
    let s = integer_text(expr)?;
    s.parse().map_err(|_| SqlError::Parse(format!("bad amount: {s}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
