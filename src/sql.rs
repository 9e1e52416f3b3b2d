use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Column order assumed by `INSERT INTO reservations VALUES (...)` without a column list.
const RESERVATION_COLUMNS: [&str; 6] = [
    "resource_id",
    "start",
    "end",
    "max_participants",
    "author_id",
    "participant_ids",
];

/// Column order assumed by `INSERT INTO participants VALUES (...)` without a column list.
const PARTICIPANT_COLUMNS: [&str; 2] = ["reservation_id", "user_id"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInsert {
    pub resource_id: ResourceId,
    pub start: Ms,
    pub end: Ms,
    pub max_participants: u32,
    pub author_id: UserId,
    pub participant_ids: Vec<UserId>,
}

/// Row selection for `SELECT ... FROM reservations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationQuery {
    All,
    ById(Ulid),
    ForUser(UserId),
    ByResourceAndDate { resource_id: ResourceId, date: NaiveDate },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation(ReservationInsert),
    UpdateReservation {
        id: Ulid,
        requester_id: UserId,
        resource_id: ResourceId,
        start: Ms,
        end: Ms,
        max_participants: u32,
    },
    DeleteReservation {
        id: Ulid,
        requester_id: UserId,
    },
    SelectReservations(ReservationQuery),
    SelectOccupiedHours {
        resource_id: ResourceId,
        date: NaiveDate,
    },
    SelectFreeIntervals {
        resource_id: ResourceId,
        date: NaiveDate,
    },
    SelectResources,
    InsertParticipant {
        reservation_id: Ulid,
        user_id: UserId,
    },
    DeleteParticipant {
        reservation_id: Ulid,
        user_id: UserId,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "reservations" => {
            let row = named_row(insert, &values, &RESERVATION_COLUMNS)?;
            let participant_ids = match row.get("participant_ids") {
                Some(expr) => parse_id_list(expr)?,
                None => Vec::new(),
            };
            Ok(Command::InsertReservation(ReservationInsert {
                resource_id: parse_u32(row.require("resource_id")?)?,
                start: parse_instant(row.require("start")?)?,
                end: parse_instant(row.require("end")?)?,
                max_participants: parse_u32(row.require("max_participants")?)?,
                author_id: parse_u64(row.require("author_id")?)?,
                participant_ids,
            }))
        }
        "participants" => {
            let row = named_row(insert, &values, &PARTICIPANT_COLUMNS)?;
            Ok(Command::InsertParticipant {
                reservation_id: parse_ulid(row.require("reservation_id")?)?,
                user_id: parse_u64(row.require("user_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "reservations" {
        return Err(SqlError::UnknownTable(name));
    }

    let mut set = Row::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push(column, &assignment.value);
    }
    let filters = where_filters(selection)?;

    Ok(Command::UpdateReservation {
        id: parse_ulid(filters.require("id")?)?,
        requester_id: parse_u64(filters.require("requester_id")?)?,
        resource_id: parse_u32(set.require("resource_id")?)?,
        start: parse_instant(set.require("start")?)?,
        end: parse_instant(set.require("end")?)?,
        max_participants: parse_u32(set.require("max_participants")?)?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation {
            id: parse_ulid(filters.require("id")?)?,
            requester_id: parse_u64(filters.require("requester_id")?)?,
        }),
        "participants" => Ok(Command::DeleteParticipant {
            reservation_id: parse_ulid(filters.require("reservation_id")?)?,
            user_id: parse_u64(filters.require("user_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = where_filters(&select.selection)?;

    match table.as_str() {
        "reservations" => {
            if let Some(id) = filters.get("id") {
                return Ok(Command::SelectReservations(ReservationQuery::ById(parse_ulid(id)?)));
            }
            if let Some(user) = filters.get("user_id") {
                return Ok(Command::SelectReservations(ReservationQuery::ForUser(parse_u64(user)?)));
            }
            match (filters.get("resource_id"), filters.date()) {
                (None, None) => Ok(Command::SelectReservations(ReservationQuery::All)),
                (Some(rid), Some(date)) => Ok(Command::SelectReservations(
                    ReservationQuery::ByResourceAndDate {
                        resource_id: parse_u32(rid)?,
                        date: parse_date(date)?,
                    },
                )),
                (None, Some(_)) => Err(SqlError::MissingFilter("resource_id")),
                (Some(_), None) => Err(SqlError::MissingFilter("date")),
            }
        }
        "occupied_hours" | "free_intervals" => {
            let resource_id = parse_u32(filters.require("resource_id")?)?;
            let date = parse_date(filters.date().ok_or(SqlError::MissingFilter("date"))?)?;
            if table == "occupied_hours" {
                Ok(Command::SelectOccupiedHours { resource_id, date })
            } else {
                Ok(Command::SelectFreeIntervals { resource_id, date })
            }
        }
        "resources" => Ok(Command::SelectResources),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Column/value pairing ──────────────────────────────────────

/// Column name → expression, in statement order.
#[derive(Default)]
struct Row<'a> {
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn push(&mut self, column: String, expr: &'a Expr) {
        self.cells.push((column, expr));
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    /// `date` and `day` are accepted for the calendar-date filter.
    fn date(&self) -> Option<&'a Expr> {
        self.get("date").or_else(|| self.get("day"))
    }
}

/// Pair VALUES with the column list, or with `default_order` when the
/// statement names no columns.
fn named_row<'a>(
    insert: &ast::Insert,
    values: &'a [Expr],
    default_order: &[&str],
) -> Result<Row<'a>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_order.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() || (insert.columns.is_empty() && values.len() < default_order.len() - 1) {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    if !insert.columns.is_empty() && values.len() != columns.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    let mut row = Row::default();
    for (column, expr) in columns.into_iter().zip(values) {
        row.push(column, expr);
    }
    Ok(row)
}

/// Conjunction of `column = value` terms. Anything else is rejected.
fn where_filters(selection: &Option<Expr>) -> Result<Row<'_>, SqlError> {
    let mut row = Row::default();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut row)?;
    }
    Ok(row)
}

fn collect_eq_filters<'a>(expr: &'a Expr, row: &mut Row<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, row)?;
            collect_eq_filters(right, row)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            row.push(column, right);
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, row),
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// The literal's text: numbers and quoted strings alike, since bound
/// parameters always arrive quoted.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.trim()),
        Some(Value::Null) => Err(SqlError::Parse("unexpected NULL".into())),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        let v = parse_i64(expr)?;
        return v
            .checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("-({v}) out of integer range")));
    }
    let s = literal_text(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u64 range")))
}

/// Unix milliseconds, or an RFC 3339 timestamp carrying an offset.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Ok(ms) = parse_i64(expr) {
        return Ok(ms);
    }
    let s = literal_text(expr)?;
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// `ARRAY[1, 2]`, `'{1,2}'`, `'1,2'` or NULL.
fn parse_id_list(expr: &Expr) -> Result<Vec<UserId>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_u64).collect();
    }
    if matches!(extract_value(expr), Some(Value::Null)) {
        return Ok(Vec::new());
    }
    let text = literal_text(expr)?;
    text.trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|e| SqlError::Parse(format!("bad user id {s:?}: {e}")))
        })
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
