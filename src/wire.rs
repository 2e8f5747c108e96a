use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono_tz::Tz;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::DuetAuthSource;
use crate::engine::{project_appointment, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tz;

pub struct DuetHandler {
    engine: Arc<Engine>,
    query_parser: Arc<DuetQueryParser>,
}

impl DuetHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(DuetQueryParser),
        }
    }

    async fn run(&self, sql_text: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertPerson { id, email } => {
                engine.register_person(id, email).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeletePerson { id } => {
                engine.remove_person(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectPerson { id } => {
                let person = engine.get_person(&id).map_err(engine_err)?;
                people_response(&[person])
            }
            Command::SetAvailability { person_id, zone, slots } => {
                let days = engine
                    .set_availability(person_id, &slots, &zone)
                    .await
                    .map_err(engine_err)?;
                availability_response(&days)
            }
            Command::ClearAvailability { person_id, date, zone } => {
                engine
                    .clear_availability(person_id, &date, &zone)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectAvailability { person_id, range, zone } => {
                let days = engine
                    .get_availability(person_id, &range.from, &range.to, &zone)
                    .await
                    .map_err(engine_err)?;
                availability_response(&days)
            }
            Command::BookAppointment { id, host_id, attendee_id, start, end, zone } => {
                let apt = engine
                    .book(id, host_id, attendee_id, &start, &end, &zone)
                    .await
                    .map_err(engine_err)?;
                appointments_response(&[project_appointment(&apt, zone_of(&zone)?)])
            }
            Command::CancelAppointment { id, requester_id, zone } => {
                let tz = match &zone {
                    Some(zone) => zone_of(zone)?,
                    None => Tz::UTC,
                };
                let apt = engine.cancel(id, requester_id).await.map_err(engine_err)?;
                appointments_response(&[project_appointment(&apt, tz)])
            }
            Command::RescheduleAppointment { id, requester_id, start, end, zone } => {
                let apt = engine
                    .reschedule(id, requester_id, &start, &end, &zone)
                    .await
                    .map_err(engine_err)?;
                appointments_response(&[project_appointment(&apt, zone_of(&zone)?)])
            }
            Command::SelectAppointments { person_id, range, zone, status } => {
                let rows = engine
                    .get_appointments(person_id, &range.from, &range.to, &zone, status)
                    .await
                    .map_err(engine_err)?;
                appointments_response(&rows)
            }
            Command::SelectAppointment { id, zone } => {
                let row = engine.get_appointment(&id, &zone).await.map_err(engine_err)?;
                appointments_response(&[row])
            }
        }
    }
}

fn zone_of(zone: &str) -> PgWireResult<Tz> {
    tz::parse_zone(zone).map_err(|e| engine_err(e.into()))
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn people_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("email")]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("person_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        FieldInfo::new("version".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("host_id"),
        text_field("host_email"),
        text_field("attendee_id"),
        text_field("attendee_email"),
        text_field("day"),
        text_field("start"),
        text_field("end"),
        text_field("status"),
    ]
}

fn people_response(people: &[Person]) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(people_schema());
    let rows: Vec<PgWireResult<_>> = people
        .iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&p.id.to_string())?;
            encoder.encode_field(&p.email)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

/// One row per free slot. A declared day with no free time left is a single
/// row with NULL `start` and `end`.
fn availability_response(days: &[DayAvailability]) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(availability_schema());
    let mut rows: Vec<PgWireResult<_>> = Vec::new();
    for day in days {
        let person_id = day.person_id.to_string();
        let version = day.version as i64;
        let encode = |start: Option<&str>, end: Option<&str>| -> PgWireResult<_> {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&person_id)?;
            encoder.encode_field(&day.date)?;
            encoder.encode_field(&start)?;
            encoder.encode_field(&end)?;
            encoder.encode_field(&version)?;
            Ok(encoder.take_row())
        };
        if day.slots.is_empty() {
            rows.push(encode(None, None));
        }
        for slot in &day.slots {
            rows.push(encode(Some(&slot.start), Some(&slot.end)));
        }
    }
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

fn appointments_response(rows: &[AppointmentInfo]) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(appointments_schema());
    let rows: Vec<PgWireResult<_>> = rows
        .iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.host_id.to_string())?;
            encoder.encode_field(&a.host_email)?;
            encoder.encode_field(&a.attendee_id.to_string())?;
            encoder.encode_field(&a.attendee_email)?;
            encoder.encode_field(&a.day)?;
            encoder.encode_field(&a.start)?;
            encoder.encode_field(&a.end)?;
            encoder.encode_field(&a.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

/// Result columns a statement will produce, decided from its leading verb
/// and target table without a full parse.
fn result_schema(sql_text: &str) -> Vec<FieldInfo> {
    let upper = sql_text.trim_start().to_uppercase();
    let mentions = |table: &str| upper.contains(table);
    if upper.starts_with("DELETE") {
        return vec![];
    }
    if mentions("APPOINTMENTS") {
        if upper.starts_with("SELECT") || upper.starts_with("INSERT") || upper.starts_with("UPDATE") {
            return appointments_schema();
        }
    } else if mentions("AVAILABILITY") {
        if upper.starts_with("SELECT") || upper.starts_with("INSERT") {
            return availability_schema();
        }
    } else if mentions("PEOPLE") && upper.starts_with("SELECT") {
        return people_schema();
    }
    vec![]
}

#[async_trait]
impl SimpleQueryHandler for DuetHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct DuetQueryParser;

#[async_trait]
impl QueryParser for DuetQueryParser {
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
impl ExtendedQueryHandler for DuetHandler {
    type Statement = String;
    type QueryParser = DuetQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql_text = substitute_params(portal);
        let responses = self.run(&sql_text).await?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
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

/// Replace `$1`, `$2`, ... with bound text parameters as quoted literals.
/// Higher indices go first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

fn substitute(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory & connection ─────────────────────────────────────────

pub struct DuetFactory {
    handler: Arc<DuetHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<DuetAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl DuetFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = DuetAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(DuetHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for DuetFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(DuetFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) | EngineError::PersonNotFound(_) => "P0002",
        EngineError::SlotUnavailable(_) => "23P01",
        EngineError::Unauthorized { .. } => "42501",
        EngineError::AlreadyCancelled(_) | EngineError::AvailabilityNotFound(_) => "55000",
        EngineError::InvalidTimestamp(_) => "22007",
        EngineError::InvalidTimeZone(_) | EngineError::InvalidRequest(_) => "22023",
        EngineError::Timeout(_) => "57014",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
