use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// The four tables the dialect knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Halls,
    Movies,
    Sessions,
    Tickets,
}

impl Table {
    fn from_name(name: &str) -> Result<Self, SqlError> {
        match name {
            "halls" => Ok(Table::Halls),
            "movies" => Ok(Table::Movies),
            "sessions" => Ok(Table::Sessions),
            "tickets" => Ok(Table::Tickets),
            other => Err(SqlError::UnknownTable(other.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Table::Halls => "halls",
            Table::Movies => "movies",
            Table::Sessions => "sessions",
            Table::Tickets => "tickets",
        }
    }

    /// Insertable columns, in positional order.
    fn insert_columns(self) -> &'static [&'static str] {
        match self {
            Table::Halls => &["id", "vip", "seats"],
            Table::Movies => &["id", "name", "duration"],
            Table::Sessions => &["id", "hall_id", "movie_id", "starts_at"],
            Table::Tickets => &["id", "session_id", "user_id", "price"],
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertHall {
        id: Ulid,
        is_vip: bool,
        seat_count: u32,
        returning: bool,
    },
    InsertMovie {
        id: Ulid,
        name: String,
        duration_minutes: u32,
        returning: bool,
    },
    InsertSession {
        id: Ulid,
        hall_id: Ulid,
        movie_id: Ulid,
        starts_at: Ms,
        returning: bool,
    },
    InsertTicket {
        id: Ulid,
        session_id: Ulid,
        user_id: Ulid,
        price: u64,
        returning: bool,
    },
    DeleteHall {
        id: Ulid,
    },
    DeleteMovie {
        id: Ulid,
    },
    DeleteSession {
        id: Ulid,
    },
    DeleteTicket {
        id: Ulid,
    },
    SelectHalls {
        id: Option<Ulid>,
    },
    SelectMovies {
        id: Option<Ulid>,
    },
    SelectSessions {
        id: Option<Ulid>,
        hall_id: Option<Ulid>,
    },
    SelectTickets {
        id: Option<Ulid>,
        session_id: Option<Ulid>,
    },
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }
    Ok(stmts.remove(0))
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match &parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The table whose rows a statement returns, if it returns any. Works on
/// statements that still contain `$n` placeholders.
pub fn result_table(sql: &str) -> Option<Table> {
    match parse_statement(sql).ok()? {
        Statement::Insert(insert) if insert.returning.is_some() => {
            insert_table_name(&insert).and_then(|t| Table::from_name(&t)).ok()
        }
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => {
                let from = select.from.first()?;
                table_factor_name(&from.relation).and_then(|t| Table::from_name(&t)).ok()
            }
            _ => None,
        },
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = Table::from_name(&insert_table_name(insert)?)?;
    let values = ordered_values(insert, table)?;
    let returning = insert.returning.is_some();

    match table {
        Table::Halls => Ok(Command::InsertHall {
            id: parse_ulid(&values[0])?,
            is_vip: parse_bool(&values[1])?,
            seat_count: parse_u32(&values[2])?,
            returning,
        }),
        Table::Movies => Ok(Command::InsertMovie {
            id: parse_ulid(&values[0])?,
            name: parse_string(&values[1])?,
            duration_minutes: parse_u32(&values[2])?,
            returning,
        }),
        Table::Sessions => Ok(Command::InsertSession {
            id: parse_ulid(&values[0])?,
            hall_id: parse_ulid(&values[1])?,
            movie_id: parse_ulid(&values[2])?,
            starts_at: parse_i64(&values[3])?,
            returning,
        }),
        Table::Tickets => Ok(Command::InsertTicket {
            id: parse_ulid(&values[0])?,
            session_id: parse_ulid(&values[1])?,
            user_id: parse_ulid(&values[2])?,
            price: parse_u64(&values[3])?,
            returning,
        }),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = Table::from_name(&delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;

    Ok(match table {
        Table::Halls => Command::DeleteHall { id },
        Table::Movies => Command::DeleteMovie { id },
        Table::Sessions => Command::DeleteSession { id },
        Table::Tickets => Command::DeleteTicket { id },
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = Table::from_name(&table_factor_name(&select.from[0].relation)?)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let allowed: &[&str] = match table {
        Table::Halls | Table::Movies => &["id"],
        Table::Sessions => &["id", "hall_id"],
        Table::Tickets => &["id", "session_id"],
    };
    let mut found: [Option<Ulid>; 2] = [None, None];
    for (col, value) in &filters {
        let slot = allowed
            .iter()
            .position(|a| *a == col.as_str())
            .ok_or_else(|| SqlError::UnknownColumn(table.name(), col.clone()))?;
        found[slot] = Some(parse_ulid_expr(value)?);
    }
    let [id, parent] = found;

    match table {
        Table::Halls => Ok(Command::SelectHalls { id }),
        Table::Movies => Ok(Command::SelectMovies { id }),
        Table::Sessions => Ok(Command::SelectSessions { id, hall_id: parent }),
        Table::Tickets => Ok(Command::SelectTickets {
            id,
            session_id: parent,
        }),
    }
}

/// Collect `column = value` pairs joined by AND.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
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

/// Values of the single VALUES row rearranged into the table's positional
/// column order. Without a column list the row is taken as positional.
fn ordered_values(insert: &ast::Insert, table: Table) -> Result<Vec<Expr>, SqlError> {
    let expected = table.insert_columns();
    let values = extract_insert_values(insert)?;

    if insert.columns.is_empty() {
        if values.len() != expected.len() {
            return Err(SqlError::WrongArity(table.name(), expected.len(), values.len()));
        }
        return Ok(values);
    }
    if insert.columns.len() != values.len() {
        return Err(SqlError::WrongArity(table.name(), insert.columns.len(), values.len()));
    }
    if let Some(unknown) = insert
        .columns
        .iter()
        .find(|c| !expected.iter().any(|e| c.value.eq_ignore_ascii_case(e)))
    {
        return Err(SqlError::UnknownColumn(table.name(), unknown.value.clone()));
    }

    expected
        .iter()
        .map(|col| {
            insert
                .columns
                .iter()
                .position(|c| c.value.eq_ignore_ascii_case(col))
                .map(|pos| values[pos].clone())
                .ok_or(SqlError::MissingColumn(table.name(), *col))
        })
        .collect()
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
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
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_insert_hall() {
        let sql = format!("INSERT INTO halls (id, vip, seats) VALUES ('{ID}', true, 120)");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertHall {
                id,
                is_vip,
                seat_count,
                returning,
            } => {
                assert_eq!(id.to_string(), ID);
                assert!(is_vip);
                assert_eq!(seat_count, 120);
                assert!(!returning);
            }
            _ => panic!("expected InsertHall, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_columns_in_any_order() {
        let sql = format!("INSERT INTO movies (duration, name, id) VALUES (95, 'Alphaville', '{ID}')");
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::InsertMovie {
                id: Ulid::from_string(ID).unwrap(),
                name: "Alphaville".into(),
                duration_minutes: 95,
                returning: false,
            }
        );
    }

    #[test]
    fn parse_insert_positional() {
        let sql = format!("INSERT INTO sessions VALUES ('{ID}', '{OTHER}', '{OTHER}', 1767225600000)");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertSession {
                hall_id, starts_at, ..
            } => {
                assert_eq!(hall_id.to_string(), OTHER);
                assert_eq!(starts_at, 1_767_225_600_000);
            }
            _ => panic!("expected InsertSession, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_ticket_returning() {
        let sql = format!(
            "INSERT INTO tickets (id, session_id, user_id, price) VALUES ('{ID}', '{OTHER}', '{ID}', 1250) RETURNING *"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertTicket { price, returning, .. } => {
                assert_eq!(price, 1250);
                assert!(returning);
            }
            _ => panic!("expected InsertTicket, got {cmd:?}"),
        }
    }

    #[test]
    fn ticket_insert_has_no_seat_column() {
        let sql = format!(
            "INSERT INTO tickets (id, session_id, user_id, price, seat) VALUES ('{ID}', '{OTHER}', '{ID}', 1250, 3)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("tickets", _))));
    }

    #[test]
    fn negative_price_rejected() {
        let sql = format!("INSERT INTO tickets VALUES ('{ID}', '{OTHER}', '{ID}', -5)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn missing_column_reported() {
        let sql = format!("INSERT INTO halls (id, vip) VALUES ('{ID}', false)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("halls", "seats"))));
    }

    #[test]
    fn wrong_positional_arity() {
        let sql = format!("INSERT INTO halls VALUES ('{ID}', false)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("halls", 3, 2))));
    }

    #[test]
    fn parse_deletes() {
        for (table, check) in [
            ("halls", Command::DeleteHall { id: Ulid::from_string(ID).unwrap() }),
            ("movies", Command::DeleteMovie { id: Ulid::from_string(ID).unwrap() }),
            ("sessions", Command::DeleteSession { id: Ulid::from_string(ID).unwrap() }),
            ("tickets", Command::DeleteTicket { id: Ulid::from_string(ID).unwrap() }),
        ] {
            let sql = format!("DELETE FROM {table} WHERE id = '{ID}'");
            assert_eq!(parse_sql(&sql).unwrap(), check);
        }
    }

    #[test]
    fn delete_requires_id() {
        assert!(matches!(parse_sql("DELETE FROM halls"), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_select_sessions_by_hall() {
        let sql = format!("SELECT * FROM sessions WHERE hall_id = '{OTHER}'");
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::SelectSessions {
                id: None,
                hall_id: Some(Ulid::from_string(OTHER).unwrap()),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM sessions").unwrap(),
            Command::SelectSessions { id: None, hall_id: None }
        );
    }

    #[test]
    fn select_tickets_with_and_without_filter() {
        assert_eq!(
            parse_sql("SELECT * FROM tickets").unwrap(),
            Command::SelectTickets { id: None, session_id: None }
        );
        let sql = format!("SELECT * FROM tickets WHERE session_id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectTickets { session_id: Some(_), .. }));
    }

    #[test]
    fn select_unknown_filter_column() {
        let sql = "SELECT * FROM halls WHERE seats = 10";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn("halls", _))));
    }

    #[test]
    fn result_table_detection() {
        assert_eq!(result_table("SELECT * FROM movies"), Some(Table::Movies));
        assert_eq!(
            result_table("INSERT INTO tickets (id, session_id, user_id, price) VALUES ($1, $2, $3, $4) RETURNING *"),
            Some(Table::Tickets)
        );
        assert_eq!(result_table("INSERT INTO halls VALUES ($1, $2, $3)"), None);
        assert_eq!(result_table("DELETE FROM halls WHERE id = $1"), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn multi_row_insert_unsupported() {
        let sql = format!("INSERT INTO halls VALUES ('{ID}', true, 1), ('{OTHER}', false, 2)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
