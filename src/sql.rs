use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Inclusive range of local dates, `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub from: String,
    pub to: String,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPerson {
        id: Ulid,
        email: String,
    },
    DeletePerson {
        id: Ulid,
    },
    SelectPerson {
        id: Ulid,
    },
    SetAvailability {
        person_id: Ulid,
        zone: String,
        slots: Vec<SlotInput>,
    },
    ClearAvailability {
        person_id: Ulid,
        date: String,
        zone: String,
    },
    SelectAvailability {
        person_id: Ulid,
        range: DateRange,
        zone: String,
    },
    BookAppointment {
        id: Ulid,
        host_id: Ulid,
        attendee_id: Ulid,
        start: String,
        end: String,
        zone: String,
    },
    CancelAppointment {
        id: Ulid,
        requester_id: Ulid,
        /// Zone for the returned row; UTC when absent.
        zone: Option<String>,
    },
    RescheduleAppointment {
        id: Ulid,
        requester_id: Ulid,
        start: String,
        end: String,
        zone: String,
    },
    SelectAppointments {
        person_id: Ulid,
        range: DateRange,
        zone: String,
        status: Option<AppointmentStatus>,
    },
    SelectAppointment {
        id: Ulid,
        zone: String,
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
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "people" => {
            let row = single_row(&table, &rows)?;
            let row = named_row(&columns, &["id", "email"], row)?;
            Ok(Command::InsertPerson {
                id: parse_ulid_expr(row.get("id")?)?,
                email: parse_string_expr(row.get("email")?)?,
            })
        }
        "availability" => {
            let mut person_id = None;
            let mut zone: Option<String> = None;
            let mut slots = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let row = named_row(&columns, &["person_id", "date", "start", "end", "tz"], row)
                    .map_err(|e| e.in_row(i))?;
                let pid = parse_ulid_expr(row.get("person_id")?).map_err(|e| e.in_row(i))?;
                let tz = parse_string_expr(row.get("tz")?).map_err(|e| e.in_row(i))?;
                if person_id.is_some_and(|p| p != pid) || zone.as_ref().is_some_and(|z| *z != tz) {
                    return Err(SqlError::Parse(
                        "all availability rows must share person_id and tz".into(),
                    ));
                }
                person_id = Some(pid);
                zone = Some(tz);
                slots.push(SlotInput {
                    date: parse_string_expr(row.get("date")?).map_err(|e| e.in_row(i))?,
                    start: parse_string_expr(row.get("start")?).map_err(|e| e.in_row(i))?,
                    end: parse_string_expr(row.get("end")?).map_err(|e| e.in_row(i))?,
                });
            }
            Ok(Command::SetAvailability {
                person_id: person_id.ok_or(SqlError::Parse("empty VALUES".into()))?,
                zone: zone.ok_or(SqlError::Parse("empty VALUES".into()))?,
                slots,
            })
        }
        "appointments" => {
            let row = single_row(&table, &rows)?;
            let row = named_row(
                &columns,
                &["id", "host_id", "attendee_id", "start", "end", "tz"],
                row,
            )?;
            Ok(Command::BookAppointment {
                id: parse_ulid_expr(row.get("id")?)?,
                host_id: parse_ulid_expr(row.get("host_id")?)?,
                attendee_id: parse_ulid_expr(row.get("attendee_id")?)?,
                start: parse_string_expr(row.get("start")?)?,
                end: parse_string_expr(row.get("end")?)?,
                zone: parse_string_expr(row.get("tz")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_row<'a>(table: &str, rows: &'a [Vec<Expr>]) -> Result<&'a [Expr], SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

/// Values of one INSERT row keyed by column name. Without an explicit column
/// list the values are taken in `default_order`.
struct NamedRow<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> NamedRow<'a> {
    fn get(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.values.get(column).copied().ok_or(SqlError::MissingColumn(column))
    }
}

fn named_row<'a>(
    columns: &[String],
    default_order: &[&'static str],
    row: &'a [Expr],
) -> Result<NamedRow<'a>, SqlError> {
    let names: Vec<String> = if columns.is_empty() {
        default_order.iter().map(|c| c.to_string()).collect()
    } else {
        columns.to_vec()
    };
    if row.len() != names.len() {
        return Err(SqlError::WrongArity(names.len(), row.len()));
    }
    Ok(NamedRow {
        values: names.into_iter().zip(row.iter()).collect(),
    })
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;

    match table.as_str() {
        "people" => Ok(Command::DeletePerson { id: filters.ulid("id")? }),
        "availability" => Ok(Command::ClearAvailability {
            person_id: filters.ulid("person_id")?,
            date: filters.string("date")?,
            zone: filters.string("tz")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut set = HashMap::new();
    for assignment in assignments {
        let AssignmentTarget::ColumnName(name) = &assignment.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let column = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column".into()))?;
        set.insert(column, &assignment.value);
    }

    let filters = Filters::collect(selection)?;
    let id = filters.ulid("id")?;
    let requester_id = filters.ulid("requester_id")?;

    if let Some(status) = set.get("status") {
        let status = parse_string_expr(status)?;
        if AppointmentStatus::parse(&status) != Some(AppointmentStatus::Cancelled) || set.len() > 1 {
            return Err(SqlError::Unsupported(
                "appointments can only be updated to status 'cancelled'".into(),
            ));
        }
        return Ok(Command::CancelAppointment {
            id,
            requester_id,
            zone: filters.optional_string("tz")?,
        });
    }

    let field = |column: &'static str| -> Result<String, SqlError> {
        set.get(column)
            .ok_or(SqlError::MissingColumn(column))
            .and_then(|e| parse_string_expr(e))
    };
    Ok(Command::RescheduleAppointment {
        id,
        requester_id,
        start: field("start")?,
        end: field("end")?,
        zone: field("tz")?,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "people" => Ok(Command::SelectPerson { id: filters.ulid("id")? }),
        "availability" => Ok(Command::SelectAvailability {
            person_id: filters.ulid("person_id")?,
            range: filters.date_range()?,
            zone: filters.string("tz")?,
        }),
        "appointments" => {
            let zone = filters.string("tz")?;
            if filters.has("id") {
                return Ok(Command::SelectAppointment { id: filters.ulid("id")?, zone });
            }
            let status = match filters.optional_string("status")? {
                Some(s) => Some(
                    AppointmentStatus::parse(&s)
                        .ok_or_else(|| SqlError::Parse(format!("unknown status '{s}'")))?,
                ),
                None => None,
            };
            Ok(Command::SelectAppointments {
                person_id: filters.ulid("person_id")?,
                range: filters.date_range()?,
                zone,
                status,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Column comparisons pulled out of an `AND`-joined WHERE clause.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    gte: HashMap<String, Expr>,
    lte: HashMap<String, Expr>,
}

impl Filters {
    fn collect(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.extract(expr)?;
        }
        Ok(filters)
    }

    fn extract(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.extract(inner)?,
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    self.extract(left)?;
                    self.extract(right)?;
                }
                ast::BinaryOperator::Eq => self.insert(Bound::Eq, left, right),
                ast::BinaryOperator::GtEq => self.insert(Bound::Gte, left, right),
                ast::BinaryOperator::LtEq => self.insert(Bound::Lte, left, right),
                other => {
                    return Err(SqlError::Unsupported(format!("operator {other} in WHERE")));
                }
            },
            Expr::Between { expr, negated: false, low, high } => {
                self.insert(Bound::Gte, expr, low);
                self.insert(Bound::Lte, expr, high);
            }
            other => return Err(SqlError::Unsupported(format!("WHERE condition {other}"))),
        }
        Ok(())
    }

    fn insert(&mut self, bound: Bound, column: &Expr, value: &Expr) {
        let Some(column) = expr_column_name(column) else { return };
        let map = match bound {
            Bound::Eq => &mut self.eq,
            Bound::Gte => &mut self.gte,
            Bound::Lte => &mut self.lte,
        };
        map.insert(column, value.clone());
    }

    fn has(&self, column: &str) -> bool {
        self.eq.contains_key(column)
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        let expr = self.eq.get(column).ok_or(SqlError::MissingFilter(column))?;
        parse_ulid_expr(expr)
    }

    fn string(&self, column: &'static str) -> Result<String, SqlError> {
        self.optional_string(column)?.ok_or(SqlError::MissingFilter(column))
    }

    fn optional_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.eq.get(column).map(parse_string_expr).transpose()
    }

    /// `date = d`, or `date >= a AND date <= b`.
    fn date_range(&self) -> Result<DateRange, SqlError> {
        if let Some(date) = self.optional_string("date")? {
            return Ok(DateRange { from: date.clone(), to: date });
        }
        match (self.gte.get("date"), self.lte.get("date")) {
            (Some(from), Some(to)) => Ok(DateRange {
                from: parse_string_expr(from)?,
                to: parse_string_expr(to)?,
            }),
            _ => Err(SqlError::MissingFilter("date")),
        }
    }
}

enum Bound {
    Eq,
    Gte,
    Lte,
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(values.rows.clone()),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

impl SqlError {
    fn in_row(self, row: usize) -> Self {
        SqlError::Parse(format!("row {row}: {self}"))
    }
}
