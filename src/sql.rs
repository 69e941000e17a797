use std::cell::Cell;

use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::dates::{self, DateParseError};
use crate::engine::ItemFields;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Option<String>,
        name: Option<String>,
        contact: Option<String>,
    },
    DeleteUser {
        id: String,
    },
    SelectUser {
        id: String,
    },
    InsertItem {
        /// Generated when absent.
        id: Option<Ulid>,
        /// The caller when absent.
        owner_id: Option<String>,
        fields: ItemFields,
    },
    UpdateItem {
        id: Ulid,
        fields: ItemFields,
    },
    DeleteItem {
        id: Ulid,
    },
    SelectItem {
        id: Ulid,
    },
    SelectItems {
        owner_id: Option<String>,
    },
    /// Raw values, validated by the engine so every rejection carries its reason code.
    InsertBooking {
        item_id: Option<String>,
        start_date: Option<String>,
        end_date: Option<String>,
        total_price: Option<String>,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectItemBookings {
        item_id: Ulid,
        exclude: Vec<BookingStatus>,
    },
    SelectDisabledDates {
        item_id: Ulid,
        from: Day,
        to: Day,
    },
    SelectQuote {
        item_id: Ulid,
        start: Day,
        end: Day,
    },
    SelectPayouts {
        owner_id: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "users" => &["id", "name", "contact"],
        "items" => &[
            "id",
            "owner_id",
            "name",
            "price_per_day",
            "type",
            "description",
            "location",
            "available",
            "min_rental_days",
            "max_rental_days",
        ],
        "bookings" => &["item_id", "start_date", "end_date", "total_price"],
        _ => &[],
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = extract_single_row(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(&table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() != columns.len() {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    let pairs: Vec<(&str, &Expr)> = columns.iter().map(String::as_str).zip(row).collect();

    match table.as_str() {
        "users" => {
            let (mut id, mut name, mut contact) = (None, None, None);
            for (col, expr) in pairs {
                let value = literal_text(col, expr)?;
                match col {
                    "id" => id = value,
                    "name" => name = value,
                    "contact" => contact = value,
                    _ => return Err(unknown_column("users", col)),
                }
            }
            Ok(Command::InsertUser { id, name, contact })
        }
        "items" => {
            let (mut id, mut owner_id) = (None, None);
            let mut fields = ItemFields::default();
            for (col, expr) in pairs {
                match col {
                    "id" => id = literal_text(col, expr)?.map(|s| parse_ulid_text(col, &s)).transpose()?,
                    "owner_id" => owner_id = literal_text(col, expr)?,
                    _ => set_item_field(&mut fields, col, expr)?,
                }
            }
            Ok(Command::InsertItem { id, owner_id, fields })
        }
        "bookings" => {
            let (mut item_id, mut start_date, mut end_date, mut total_price) = (None, None, None, None);
            for (col, expr) in pairs {
                let value = literal_text(col, expr)?;
                match col {
                    "item_id" => item_id = value,
                    "start_date" => start_date = value,
                    "end_date" => end_date = value,
                    "total_price" => total_price = value,
                    _ => return Err(unknown_column("bookings", col)),
                }
            }
            Ok(Command::InsertBooking {
                item_id,
                start_date,
                end_date,
                total_price,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn set_item_field(fields: &mut ItemFields, col: &str, expr: &Expr) -> Result<(), SqlError> {
    match col {
        "name" => fields.name = literal_text(col, expr)?,
        "type" | "item_type" => fields.item_type = literal_text(col, expr)?,
        "description" => fields.description = literal_text(col, expr)?,
        "location" => fields.location = literal_text(col, expr)?,
        "price_per_day" => {
            fields.price_per_day = literal_text(col, expr)?
                .map(|s| s.parse::<Money>().map_err(|e| bad_value(col, e)))
                .transpose()?
        }
        "available" => fields.available = parse_bool_opt(col, expr)?,
        "min_rental_days" => fields.min_rental_days = parse_u32_opt(col, expr)?,
        "max_rental_days" => fields.max_rental_days = parse_u32_opt(col, expr)?,
        _ => return Err(unknown_column("items", col)),
    }
    Ok(())
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let filters = Filters::collect(selection)?;
    let id = filters.ulid("id")?;
    filters.all_consumed()?;

    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((col, &a.value));
    }

    match table.as_str() {
        "items" => {
            let mut fields = ItemFields::default();
            for (col, expr) in sets {
                set_item_field(&mut fields, &col, expr)?;
            }
            Ok(Command::UpdateItem { id, fields })
        }
        "bookings" => {
            let mut status = None;
            for (col, expr) in sets {
                if col != "status" {
                    return Err(SqlError::Unsupported(format!(
                        "only status can change on bookings, not {col}"
                    )));
                }
                let text = literal_text(&col, expr)?.ok_or_else(|| bad_value(&col, "NULL"))?;
                status = Some(text.parse::<BookingStatus>().map_err(|e| bad_value(&col, e))?);
            }
            let status = status.ok_or(SqlError::Unsupported("UPDATE without SET status".into()))?;
            Ok(Command::UpdateBookingStatus { id, status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;

    let cmd = match table.as_str() {
        "users" => Command::DeleteUser {
            id: filters.text("id")?,
        },
        "items" => Command::DeleteItem {
            id: filters.ulid("id")?,
        },
        "bookings" => {
            return Err(SqlError::Unsupported(
                "bookings are cancelled with UPDATE bookings SET status = 'cancelled'".into(),
            ));
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.all_consumed()?;
    Ok(cmd)
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

    let cmd = match table.as_str() {
        "users" => Command::SelectUser {
            id: filters.text("id")?,
        },
        "items" if filters.has("id") => Command::SelectItem {
            id: filters.ulid("id")?,
        },
        "items" => Command::SelectItems {
            owner_id: filters.text_opt("owner_id")?,
        },
        "bookings" if filters.has("id") => Command::SelectBooking {
            id: filters.ulid("id")?,
        },
        "bookings" => Command::SelectItemBookings {
            item_id: filters.ulid("item_id")?,
            exclude: filters.excluded_statuses()?,
        },
        "disabled_dates" => Command::SelectDisabledDates {
            item_id: filters.ulid("item_id")?,
            from: filters.day_with("calendar_day", &[BinaryOperator::GtEq])?,
            to: filters.day_with("calendar_day", &[BinaryOperator::Lt])?,
        },
        "quote" => Command::SelectQuote {
            item_id: filters.ulid("item_id")?,
            start: filters.day_with("start_date", &[BinaryOperator::Eq])?,
            end: filters.day_with("end_date", &[BinaryOperator::Eq])?,
        },
        "payouts" => Command::SelectPayouts {
            owner_id: filters.text("owner_id")?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.all_consumed()?;
    Ok(cmd)
}

/// `column <op> literal`, marked once a command has read it.
struct Comparison<'a> {
    col: String,
    op: BinaryOperator,
    value: &'a Expr,
    used: Cell<bool>,
}

/// `column [NOT] IN (...)`.
struct InList<'a> {
    col: String,
    negated: bool,
    list: &'a [Expr],
    used: Cell<bool>,
}

/// Conjunctive `WHERE` predicates. Every predicate must be read by the command
/// it belongs to; see `all_consumed`.
struct Filters<'a> {
    comparisons: Vec<Comparison<'a>>,
    in_lists: Vec<InList<'a>>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters {
            comparisons: Vec::new(),
            in_lists: Vec::new(),
        };
        if let Some(expr) = selection {
            filters.walk(expr)?;
        }
        Ok(filters)
    }

    fn walk(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.walk(left)?;
                self.walk(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                self.comparisons.push(Comparison {
                    col,
                    op: op.clone(),
                    value: &**right,
                    used: Cell::new(false),
                });
                Ok(())
            }
            Expr::InList {
                expr: inner,
                list,
                negated,
            } => {
                let col = expr_column_name(inner)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                self.in_lists.push(InList {
                    col,
                    negated: *negated,
                    list: list.as_slice(),
                    used: Cell::new(false),
                });
                Ok(())
            }
            Expr::Nested(inner) => self.walk(inner),
            other => Err(SqlError::Unsupported(format!("predicate {other}"))),
        }
    }

    /// Fails on the first predicate the command did not read.
    fn all_consumed(&self) -> Result<(), SqlError> {
        if let Some(c) = self.comparisons.iter().find(|c| !c.used.get()) {
            return Err(SqlError::Unsupported(format!(
                "filter {} {} {}",
                c.col, c.op, c.value
            )));
        }
        if let Some(l) = self.in_lists.iter().find(|l| !l.used.get()) {
            let not = if l.negated { "NOT " } else { "" };
            return Err(SqlError::Unsupported(format!("filter {} {not}IN (...)", l.col)));
        }
        Ok(())
    }

    fn has(&self, col: &str) -> bool {
        self.comparisons
            .iter()
            .any(|c| c.col == col && c.op == BinaryOperator::Eq)
    }

    fn find(&self, col: &str, ops: &[BinaryOperator]) -> Option<&'a Expr> {
        let c = self
            .comparisons
            .iter()
            .find(|c| c.col == col && ops.contains(&c.op))?;
        c.used.set(true);
        Some(c.value)
    }

    fn text_opt(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        match self.find(col, &[BinaryOperator::Eq]) {
            Some(expr) => literal_text(col, expr),
            None => Ok(None),
        }
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        self.text_opt(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_text(col, &self.text(col)?)
    }

    fn day_with(&self, col: &'static str, ops: &[BinaryOperator]) -> Result<Day, SqlError> {
        let expr = self.find(col, ops).ok_or(SqlError::MissingFilter(col))?;
        let text = literal_text(col, expr)?.ok_or(SqlError::MissingFilter(col))?;
        dates::parse_day(&text).map_err(|source| SqlError::Date { column: col, source })
    }

    /// Statuses ruled out by `status = / <> / IN / NOT IN` predicates, ANDed.
    fn excluded_statuses(&self) -> Result<Vec<BookingStatus>, SqlError> {
        let mut kept = BookingStatus::ALL.to_vec();
        for c in self.comparisons.iter().filter(|c| c.col == "status") {
            let status = match c.op {
                BinaryOperator::Eq | BinaryOperator::NotEq => parse_status(c.value)?,
                _ => continue,
            };
            let equal = c.op == BinaryOperator::Eq;
            kept.retain(|s| (*s == status) == equal);
            c.used.set(true);
        }
        for l in self.in_lists.iter().filter(|l| l.col == "status") {
            let listed = l.list.iter().map(parse_status).collect::<Result<Vec<_>, _>>()?;
            kept.retain(|s| listed.contains(s) != l.negated);
            l.used.set(true);
        }
        Ok(BookingStatus::ALL
            .into_iter()
            .filter(|s| !kept.contains(s))
            .collect())
    }
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let text = literal_text("status", expr)?.ok_or_else(|| bad_value("status", "NULL"))?;
    text.parse().map_err(|e| bad_value("status", e))
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

fn extract_single_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
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

/// A literal as text. `NULL` is `None`; numbers keep their spelling.
fn literal_text(col: &str, expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        return Ok(literal_text(col, inner)?.map(|s| format!("-{s}")));
    }
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(bad_value(col, format!("unsupported literal {other}"))),
        None => Err(bad_value(col, format!("expected a literal, got {expr}"))),
    }
}

fn parse_ulid_text(col: &str, s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s).map_err(|e| bad_value(col, format!("bad ULID: {e}")))
}

fn parse_u32_opt(col: &str, expr: &Expr) -> Result<Option<u32>, SqlError> {
    literal_text(col, expr)?
        .map(|s| s.parse::<u32>().map_err(|e| bad_value(col, e)))
        .transpose()
}

fn parse_bool_opt(col: &str, expr: &Expr) -> Result<Option<bool>, SqlError> {
    literal_text(col, expr)?
        .map(|s| match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(bad_value(col, format!("bad bool: {s}"))),
        })
        .transpose()
}

fn bad_value(col: &str, reason: impl ToString) -> SqlError {
    SqlError::BadValue {
        column: col.to_string(),
        reason: reason.to_string(),
    }
}

fn unknown_column(table: &'static str, col: &str) -> SqlError {
    SqlError::UnknownColumn {
        table,
        column: col.to_string(),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {column} in {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad value for {column}: {reason}")]
    BadValue { column: String, reason: String },
    #[error("invalid {column}: {source}")]
    Date {
        column: &'static str,
        source: DateParseError,
    },
}
