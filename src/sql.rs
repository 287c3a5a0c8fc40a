use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_QUERY_LEN;
use crate::model::*;

const TABLE: &str = "reservations";

/// Column order assumed by an INSERT without a column list.
const INSERT_COLUMNS: [&str; 4] = ["resource_id", "date", "time_slot", "owner_id"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation { request: ReservationRequest },
    SelectReservations { filter: ReservationFilter },
    DeleteReservation { id: Ulid },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_QUERY_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }

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
    expect_table(insert_table_name(insert)?)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        INSERT_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if let Some((_, dup)) = columns.iter().enumerate().find(|(i, c)| columns[..*i].contains(c)) {
        return Err(SqlError::DuplicateColumn(dup.clone()));
    }
    let values = single_insert_row(insert)?;
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }

    let mut request = ReservationRequest::default();
    for (column, expr) in columns.iter().zip(values) {
        let value = text_or_null(column, expr)?;
        let slot = match column.as_str() {
            "resource_id" => &mut request.resource_id,
            "date" => &mut request.date,
            "time_slot" => &mut request.time_slot,
            "owner_id" => &mut request.owner_id,
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        };
        *slot = value;
    }
    Ok(Command::InsertReservation { request })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    expect_table(delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::DeleteReservation { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    expect_table(table_factor_name(&from.relation)?)?;

    let mut filter = ReservationFilter::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filter)?;
    }
    Ok(Command::SelectReservations { filter })
}

/// Walk an AND-chain of `column = value` terms.
fn extract_filters(expr: &Expr, filter: &mut ReservationFilter) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filter),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_filters(left, filter)?;
            extract_filters(right, filter)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            // Stored fields are trimmed on create, so filters are too.
            let raw = text(&column, right)?.trim().to_string();
            match column.as_str() {
                "resource_id" => filter.resource_id = Some(raw),
                "owner_id" => filter.owner_id = Some(raw),
                "date" => {
                    let date = NaiveDate::parse_from_str(&raw, DATE_FORMAT)
                        .map_err(|_| SqlError::InvalidValue("date", raw.clone()))?;
                    filter.date = Some(date);
                }
                "status" => {
                    let status = ReservationStatus::parse(&raw).ok_or(SqlError::InvalidValue("status", raw.clone()))?;
                    filter.status = Some(status);
                }
                other => return Err(SqlError::UnknownColumn(other.to_string())),
            }
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn expect_table(name: String) -> Result<(), SqlError> {
    if name == TABLE { Ok(()) } else { Err(SqlError::UnknownTable(name)) }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn single_insert_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
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
        }) if expr_column_name(left).as_deref() == Some("id") => {
            let raw = text("id", right)?;
            Ulid::from_string(raw.trim()).map_err(|e| SqlError::InvalidValue("id", format!("{raw} ({e})")))
        }
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

/// A string or numeric literal as text; NULL as `None`.
fn text_or_null(column: &str, expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("{column}: expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("{column}: expected literal, got {expr}"))),
    }
}

fn text(column: &str, expr: &Expr) -> Result<String, SqlError> {
    text_or_null(column, expr)?.ok_or_else(|| SqlError::Unsupported(format!("{column} = NULL")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query too long ({0} bytes, limit {MAX_QUERY_LEN})")]
    TooLong(usize),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("column {0} given more than once")]
    DuplicateColumn(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid {0}: {1}")]
    InvalidValue(&'static str, String),
}
