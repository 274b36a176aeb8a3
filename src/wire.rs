use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::property::PropertyManager;
use crate::sql::{self, Command, SqlError};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    properties: Arc<PropertyManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = BunkhouseFactory::new(properties, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct BunkhouseHandler {
    properties: Arc<PropertyManager>,
    query_parser: Arc<BunkhouseQueryParser>,
}

impl BunkhouseHandler {
    pub fn new(properties: Arc<PropertyManager>) -> Self {
        Self {
            properties,
            query_parser: Arc::new(BunkhouseQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.properties.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("property error: {e}"))
        })
    }

    /// Simple-protocol query: every statement runs in order and answers on its own.
    /// The first failing statement ends the query with its error; statements before it
    /// stay applied, as outside a transaction block.
    async fn run_batch(&self, engine: &Engine, sql: &str) -> PgWireResult<Vec<Response>> {
        let commands = sql::parse_batch(sql).map_err(sql_err)?;
        debug!("{} statement(s): {sql}", commands.len());

        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            match self.run_command(engine, cmd).await {
                Ok(response) => responses.push(response),
                Err(PgWireError::UserError(info)) => {
                    responses.push(Response::Error(info));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(responses)
    }

    async fn run_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertRoom { id, name, description } => {
                engine
                    .create_room(id, name, description)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertBeds { beds } => {
                // Rows are added one by one; an error keeps the rows before it.
                let count = beds.len();
                for (id, room_id) in beds {
                    engine.add_bed(id, room_id).await.map_err(engine_err)?;
                }
                Ok(inserted(count))
            }
            Command::InsertFacility { room_id, name } => {
                engine.add_facility(room_id, name).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertPhoto { room_id, url, description } => {
                engine
                    .add_photo(room_id, url, description)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertGuest { id, national_id, email } => {
                if national_id.trim().is_empty() {
                    return Err(engine_err(EngineError::Validation(
                        "national_id must not be empty".into(),
                    )));
                }
                engine
                    .guests()
                    .register(Guest { id, national_id, email })
                    .await;
                Ok(inserted(1))
            }
            Command::InsertTransaction { id, reservation_id, paid, amount_cents, method } => {
                engine.get_reservation(reservation_id).map_err(engine_err)?;
                engine
                    .payments()
                    .record(Transaction { id, reservation_id, paid, amount_cents, method })
                    .await;
                Ok(inserted(1))
            }
            Command::InsertReservation {
                check_in,
                check_out,
                guest_id,
                bed_ids,
                special_requests,
            } => {
                let reservation = engine
                    .make_reservation(check_in, check_out, guest_id, &bed_ids, special_requests)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(reservation_schema());
                let row = encode_reservation(&schema, &reservation);
                Ok(query_response(schema, vec![row]))
            }
            Command::SelectRooms => {
                let schema = Arc::new(room_schema());
                let rows = engine
                    .list_rooms()
                    .iter()
                    .map(|room| encode_room(&schema, room))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAvailableRooms { check_in, check_out } => {
                let rooms = engine
                    .find_available_rooms(check_in, check_out)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(available_room_schema());
                let rows = rooms
                    .iter()
                    .map(|room| encode_available_room(&schema, room))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAvailableBeds { room_id, check_in, check_out } => {
                let room = engine
                    .find_available_beds(check_in, check_out, room_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(room_schema());
                let row = encode_room(&schema, &room);
                Ok(query_response(schema, vec![row]))
            }
            Command::SelectReservation { id } => {
                let found = engine.get_reservation(id).map_err(engine_err)?;
                let schema = Arc::new(reservation_room_schema());
                let rows = found
                    .rooms
                    .iter()
                    .map(|room| encode_reservation_room(&schema, &found.reservation, room))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectReservationTransaction { id } => {
                let found = engine
                    .get_reservation_transaction(id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(reservation_transaction_schema());
                let row = encode_reservation_transaction(&schema, &found);
                Ok(query_response(schema, vec![row]))
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Reservation columns shared by every reservation-shaped result.
fn reservation_fields() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("check_in", Type::VARCHAR),
        field("check_out", Type::VARCHAR),
        field("guest_id", Type::VARCHAR),
        field("special_requests", Type::VARCHAR),
        field("check_in_enter_time", Type::VARCHAR),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    let mut fields = reservation_fields();
    fields.push(field("bed_ids", Type::VARCHAR));
    fields
}

fn reservation_room_schema() -> Vec<FieldInfo> {
    let mut fields = reservation_fields();
    fields.extend([
        field("room_id", Type::INT8),
        field("room_name", Type::VARCHAR),
        field("bed_count", Type::INT8),
        field("bed_ids", Type::VARCHAR),
    ]);
    fields
}

fn reservation_transaction_schema() -> Vec<FieldInfo> {
    let mut fields = reservation_fields();
    fields.extend([
        field("transaction_id", Type::VARCHAR),
        field("paid", Type::BOOL),
        field("amount_cents", Type::INT8),
        field("method", Type::VARCHAR),
    ]);
    fields
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("name", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("bed_ids", Type::VARCHAR),
        field("facilities", Type::VARCHAR),
        field("photos", Type::VARCHAR),
    ]
}

fn available_room_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("name", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("free_beds", Type::INT8),
        field("facilities", Type::VARCHAR),
        field("photos", Type::VARCHAR),
    ]
}

/// Result columns a statement will produce, judged from its text alone.
/// Extended-protocol statements still hold `$n` placeholders here.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let is_select = lower.trim_start().starts_with("select");
    if lower.contains("reservation_transactions") {
        reservation_transaction_schema()
    } else if lower.contains("available_rooms") {
        available_room_schema()
    } else if lower.contains("available_beds") {
        room_schema()
    } else if lower.contains("reservations") {
        if is_select {
            reservation_room_schema()
        } else {
            reservation_schema()
        }
    } else if is_select && lower.contains("rooms") {
        room_schema()
    } else {
        Vec::new()
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".into())
}

fn encode_reservation_fields(
    encoder: &mut DataRowEncoder,
    reservation: &Reservation,
) -> PgWireResult<()> {
    encoder.encode_field(&reservation.id.to_string())?;
    encoder.encode_field(&reservation.check_in().to_string())?;
    encoder.encode_field(&reservation.check_out().to_string())?;
    encoder.encode_field(&reservation.guest_id.to_string())?;
    encoder.encode_field(&reservation.special_requests)?;
    encoder.encode_field(&reservation.check_in_enter_time.map(|at| at.to_rfc3339()))?;
    Ok(())
}

fn encode_reservation(schema: &Arc<Vec<FieldInfo>>, reservation: &Reservation) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_reservation_fields(&mut encoder, reservation)?;
    encoder.encode_field(&json(&reservation.beds))?;
    Ok(encoder.take_row())
}

fn encode_reservation_room(
    schema: &Arc<Vec<FieldInfo>>,
    reservation: &Reservation,
    room: &BookedRoom,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_reservation_fields(&mut encoder, reservation)?;
    encoder.encode_field(&room.id)?;
    encoder.encode_field(&room.name)?;
    encoder.encode_field(&(room.bed_count() as i64))?;
    encoder.encode_field(&json(&room.beds))?;
    Ok(encoder.take_row())
}

fn encode_reservation_transaction(
    schema: &Arc<Vec<FieldInfo>>,
    found: &ReservationWithTransaction,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_reservation_fields(&mut encoder, &found.reservation)?;
    let tx = found.transaction.as_ref();
    encoder.encode_field(&tx.map(|t| t.id.to_string()))?;
    encoder.encode_field(&found.is_paid())?;
    encoder.encode_field(&tx.map(|t| t.amount_cents))?;
    encoder.encode_field(&tx.and_then(|t| t.method.clone()))?;
    Ok(encoder.take_row())
}

fn encode_room(schema: &Arc<Vec<FieldInfo>>, room: &Room) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&room.id)?;
    encoder.encode_field(&room.name)?;
    encoder.encode_field(&room.description)?;
    encoder.encode_field(&json(&room.beds))?;
    encoder.encode_field(&json(&room.facilities))?;
    encoder.encode_field(&json(&room.photos))?;
    Ok(encoder.take_row())
}

fn encode_available_room(schema: &Arc<Vec<FieldInfo>>, room: &AvailableRoom) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&room.id)?;
    encoder.encode_field(&room.name)?;
    encoder.encode_field(&room.description)?;
    encoder.encode_field(&(room.free_beds as i64))?;
    encoder.encode_field(&json(&room.facilities))?;
    encoder.encode_field(&json(&room.photos))?;
    Ok(encoder.take_row())
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for BunkhouseHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run_batch(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BunkhouseQueryParser;

#[async_trait]
impl QueryParser for BunkhouseQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BunkhouseHandler {
    type Statement = String;
    type QueryParser = BunkhouseQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        debug!("{}: {sql}", command_label(&cmd));
        self.run_command(&engine, cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound parameters (text format) as quoted literals.
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Auth ─────────────────────────────────────────────────────────

/// One shared cleartext password for every user and property.
#[derive(Debug)]
pub struct BunkhouseAuthSource {
    password: String,
}

impl BunkhouseAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for BunkhouseAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BunkhouseFactory {
    handler: Arc<BunkhouseHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BunkhouseAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BunkhouseFactory {
    pub fn new(properties: Arc<PropertyManager>, password: String) -> Self {
        Self {
            handler: Arc::new(BunkhouseHandler::new(properties)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                BunkhouseAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BunkhouseFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error. `Conflict` is a serialization failure so clients
/// retry after a fresh availability query.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "40001",
        EngineError::AlreadyCheckedIn(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidDate(_) => "22007",
        SqlError::TooManyRows(_) => "54000",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::Unsupported(_) => "0A000",
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::WrongArity(..)
        | SqlError::MissingFilter(_) => "42601",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
