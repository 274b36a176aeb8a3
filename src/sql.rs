use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MAX_BATCH_ROWS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: RoomId,
        name: String,
        description: Option<String>,
    },
    InsertBeds {
        beds: Vec<(BedId, RoomId)>, // (id, room_id)
    },
    InsertFacility {
        room_id: RoomId,
        name: String,
    },
    InsertPhoto {
        room_id: RoomId,
        url: String,
        description: Option<String>,
    },
    InsertGuest {
        id: Ulid,
        national_id: String,
        email: String,
    },
    InsertTransaction {
        id: Ulid,
        reservation_id: Ulid,
        paid: bool,
        amount_cents: i64,
        method: Option<String>,
    },
    InsertReservation {
        check_in: NaiveDate,
        check_out: NaiveDate,
        guest_id: Ulid,
        bed_ids: Vec<BedId>,
        special_requests: String,
    },
    SelectRooms,
    SelectAvailableRooms {
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    SelectAvailableBeds {
        room_id: RoomId,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectReservationTransaction {
        id: Ulid,
    },
}

/// Parse a single statement. Used where only one command fits, as in the extended
/// protocol.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements in one query".into()));
    }
    commands.pop().ok_or(SqlError::Empty)
}

/// Parse every `;`-separated statement of a simple query, in order.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;

    if table == "beds" {
        if rows.len() > MAX_BATCH_ROWS {
            return Err(SqlError::TooManyRows(rows.len()));
        }
        let mut beds = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if row.len() < 2 {
                return Err(SqlError::WrongArity("beds", 2, row.len()));
            }
            let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
            beds.push((parse_i64(&row[0]).map_err(at_row)?, parse_i64(&row[1]).map_err(at_row)?));
        }
        return Ok(Command::InsertBeds { beds });
    }

    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let values = &rows[0];

    match table.as_str() {
        "rooms" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("rooms", 2, values.len()));
            }
            Ok(Command::InsertRoom {
                id: parse_i64(&values[0])?,
                name: parse_string(&values[1])?,
                description: optional(values, 2, parse_string_or_null)?,
            })
        }
        "facilities" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("facilities", 2, values.len()));
            }
            Ok(Command::InsertFacility {
                room_id: parse_i64(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "photos" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("photos", 2, values.len()));
            }
            Ok(Command::InsertPhoto {
                room_id: parse_i64(&values[0])?,
                url: parse_string(&values[1])?,
                description: optional(values, 2, parse_string_or_null)?,
            })
        }
        "guests" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("guests", 3, values.len()));
            }
            Ok(Command::InsertGuest {
                id: parse_ulid(&values[0])?,
                national_id: parse_string(&values[1])?,
                email: parse_string(&values[2])?,
            })
        }
        "transactions" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("transactions", 4, values.len()));
            }
            Ok(Command::InsertTransaction {
                id: parse_ulid(&values[0])?,
                reservation_id: parse_ulid(&values[1])?,
                paid: parse_bool(&values[2])?,
                amount_cents: parse_i64(&values[3])?,
                method: optional(values, 4, parse_string_or_null)?,
            })
        }
        "reservations" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("reservations", 4, values.len()));
            }
            Ok(Command::InsertReservation {
                check_in: parse_date(&values[0])?,
                check_out: parse_date(&values[1])?,
                guest_id: parse_ulid(&values[2])?,
                bed_ids: parse_bed_ids(&values[3])?,
                special_requests: optional(values, 4, parse_string_or_null)?.unwrap_or_default(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Trailing columns may be left out entirely.
fn optional<T>(
    values: &[Expr],
    index: usize,
    parse: fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    match values.get(index) {
        Some(expr) => parse(expr),
        None => Ok(None),
    }
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    room_id: Option<RoomId>,
    check_in: Option<NaiveDate>,
    check_out: Option<NaiveDate>,
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "available_rooms" => Ok(Command::SelectAvailableRooms {
            check_in: filters.check_in.ok_or(SqlError::MissingFilter("check_in"))?,
            check_out: filters.check_out.ok_or(SqlError::MissingFilter("check_out"))?,
        }),
        "available_beds" => Ok(Command::SelectAvailableBeds {
            room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
            check_in: filters.check_in.ok_or(SqlError::MissingFilter("check_in"))?,
            check_out: filters.check_out.ok_or(SqlError::MissingFilter("check_out"))?,
        }),
        "reservations" => Ok(Command::SelectReservation {
            id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
        }),
        "reservation_transactions" => Ok(Command::SelectReservationTransaction {
            id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            extract_filters(left, filters)?;
            extract_filters(right, filters)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            match expr_column_name(left).as_deref() {
                Some("id") => filters.id = Some(parse_ulid(right)?),
                Some("room_id") => filters.room_id = Some(parse_i64(right)?),
                Some("check_in") => filters.check_in = Some(parse_date(right)?),
                Some("check_out") => filters.check_out = Some(parse_date(right)?),
                _ => {}
            }
            Ok(())
        }
        _ => Ok(()),
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
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
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

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|_| SqlError::InvalidDate(s.clone())),
        Some(value) => Err(SqlError::InvalidDate(format!("{value}"))),
        None => Err(SqlError::InvalidDate(format!("{expr}"))),
    }
}

/// `'3,1,2'` or a single number.
fn parse_bed_ids(expr: &Expr) -> Result<Vec<BedId>, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse()
                    .map_err(|e| SqlError::Parse(format!("bad bed id {part:?}: {e}")))
            })
            .collect(),
        Some(Value::Number(_, _)) => Ok(vec![parse_i64(expr)?]),
        Some(value) => Err(SqlError::Parse(format!("expected bed id list, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
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
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("too many rows in one INSERT: {0}")]
    TooManyRows(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUEST: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parse_insert_room() {
        let cmd = parse_sql("INSERT INTO rooms (id, name, description) VALUES (7, 'Dorm A', 'Six beds')").unwrap();
        assert_eq!(
            cmd,
            Command::InsertRoom {
                id: 7,
                name: "Dorm A".into(),
                description: Some("Six beds".into()),
            }
        );
    }

    #[test]
    fn parse_insert_room_without_description() {
        let cmd = parse_sql("INSERT INTO rooms (id, name) VALUES (7, 'Dorm A')").unwrap();
        assert!(matches!(cmd, Command::InsertRoom { description: None, .. }));

        let cmd = parse_sql("INSERT INTO rooms (id, name, description) VALUES (7, 'Dorm A', NULL)").unwrap();
        assert!(matches!(cmd, Command::InsertRoom { description: None, .. }));
    }

    #[test]
    fn parse_insert_beds_multi_row() {
        let cmd = parse_sql("INSERT INTO beds (id, room_id) VALUES (1, 7), (2, 7), (3, 8)").unwrap();
        assert_eq!(cmd, Command::InsertBeds { beds: vec![(1, 7), (2, 7), (3, 8)] });
    }

    #[test]
    fn parse_insert_facility_and_photo() {
        let cmd = parse_sql("INSERT INTO facilities (room_id, name) VALUES (7, 'Locker')").unwrap();
        assert_eq!(cmd, Command::InsertFacility { room_id: 7, name: "Locker".into() });

        let cmd = parse_sql("INSERT INTO photos (room_id, url) VALUES (7, 'https://img/7.jpg')").unwrap();
        assert_eq!(
            cmd,
            Command::InsertPhoto {
                room_id: 7,
                url: "https://img/7.jpg".into(),
                description: None,
            }
        );
    }

    #[test]
    fn parse_insert_guest() {
        let sql = format!("INSERT INTO guests (id, national_id, email) VALUES ('{GUEST}', '1100700000001', 'a@b.c')");
        match parse_sql(&sql).unwrap() {
            Command::InsertGuest { id, national_id, email } => {
                assert_eq!(id.to_string(), GUEST);
                assert_eq!(national_id, "1100700000001");
                assert_eq!(email, "a@b.c");
            }
            cmd => panic!("expected InsertGuest, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_transaction() {
        let sql = format!(
            "INSERT INTO transactions (id, reservation_id, paid, amount_cents, method) VALUES ('{GUEST}', '{GUEST}', true, 4500, 'cash')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertTransaction { paid, amount_cents, method, .. } => {
                assert!(paid);
                assert_eq!(amount_cents, 4500);
                assert_eq!(method.as_deref(), Some("cash"));
            }
            cmd => panic!("expected InsertTransaction, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = format!(
            "INSERT INTO reservations (check_in, check_out, guest_id, bed_ids, special_requests) \
             VALUES ('2024-01-01', '2024-01-05', '{GUEST}', '3, 1,2', 'late arrival')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation { check_in, check_out, bed_ids, special_requests, .. } => {
                assert_eq!(check_in, d(2024, 1, 1));
                assert_eq!(check_out, d(2024, 1, 5));
                // Order and duplicates are the engine's business.
                assert_eq!(bed_ids, vec![3, 1, 2]);
                assert_eq!(special_requests, "late arrival");
            }
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_reservation_single_bed_number() {
        let sql = format!(
            "INSERT INTO reservations (check_in, check_out, guest_id, bed_ids) VALUES ('2024-01-01', '2024-01-05', '{GUEST}', 4)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation { bed_ids, special_requests, .. } => {
                assert_eq!(bed_ids, vec![4]);
                assert_eq!(special_requests, "");
            }
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn malformed_date_is_rejected() {
        let sql = format!(
            "INSERT INTO reservations (check_in, check_out, guest_id, bed_ids) VALUES ('2024-02-30', '2024-03-05', '{GUEST}', '1')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidDate(s)) if s == "2024-02-30"));

        let sql = "SELECT * FROM available_rooms WHERE check_in = '01/05/2024' AND check_out = '2024-01-06'";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidDate(_))));
    }

    #[test]
    fn parse_select_rooms() {
        assert_eq!(parse_sql("SELECT * FROM rooms").unwrap(), Command::SelectRooms);
    }

    #[test]
    fn parse_select_available_rooms() {
        let sql = "SELECT * FROM available_rooms WHERE check_in = '2024-01-05' AND check_out = '2024-01-08'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailableRooms {
                check_in: d(2024, 1, 5),
                check_out: d(2024, 1, 8),
            }
        );
    }

    #[test]
    fn parse_select_available_beds() {
        let sql = "SELECT * FROM available_beds WHERE (room_id = 7 AND check_in = '2024-01-05') AND check_out = '2024-01-08'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailableBeds {
                room_id: 7,
                check_in: d(2024, 1, 5),
                check_out: d(2024, 1, 8),
            }
        );
    }

    #[test]
    fn missing_filters_are_named() {
        let sql = "SELECT * FROM available_rooms WHERE check_in = '2024-01-05'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("check_out"))));
        let sql = "SELECT * FROM available_beds WHERE check_in = '2024-01-05' AND check_out = '2024-01-06'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("room_id"))));
        assert!(matches!(
            parse_sql("SELECT * FROM reservations"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_select_reservation_and_transaction() {
        let sql = format!("SELECT * FROM reservations WHERE id = '{GUEST}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectReservation { id } if id.to_string() == GUEST));
        let sql = format!("SELECT * FROM reservation_transactions WHERE id = '{GUEST}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectReservationTransaction { .. }
        ));
    }

    #[test]
    fn unknown_table_and_statement() {
        assert!(matches!(
            parse_sql("INSERT INTO foobar (id) VALUES (1)"),
            Err(SqlError::UnknownTable(t)) if t == "foobar"
        ));
        assert!(matches!(
            parse_sql("DELETE FROM rooms WHERE id = 1"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO rooms (id, name) VALUES (1, 'a'), (2, 'b')"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn too_many_bed_rows() {
        let rows: Vec<String> = (0..=MAX_BATCH_ROWS).map(|i| format!("({i}, 1)")).collect();
        let sql = format!("INSERT INTO beds (id, room_id) VALUES {}", rows.join(", "));
        assert!(matches!(parse_sql(&sql), Err(SqlError::TooManyRows(n)) if n == MAX_BATCH_ROWS + 1));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn batch_keeps_every_statement_in_order() {
        let cmds = parse_batch(
            "INSERT INTO rooms (id, name) VALUES (1, 'Dorm'); \
             INSERT INTO beds (id, room_id) VALUES (10, 1); \
             SELECT * FROM rooms;",
        )
        .unwrap();
        assert_eq!(
            cmds,
            vec![
                Command::InsertRoom { id: 1, name: "Dorm".into(), description: None },
                Command::InsertBeds { beds: vec![(10, 1)] },
                Command::SelectRooms,
            ]
        );
    }

    #[test]
    fn batch_rejects_whole_query_on_any_bad_statement() {
        let sql = "INSERT INTO rooms (id, name) VALUES (1, 'Dorm'); DELETE FROM rooms";
        assert!(matches!(parse_batch(sql), Err(SqlError::Unsupported(_))));
        assert!(matches!(parse_batch(""), Err(SqlError::Empty)));
    }

    #[test]
    fn single_statement_parse_refuses_batches() {
        let sql = "SELECT * FROM rooms; SELECT * FROM rooms";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }
}
