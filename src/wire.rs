use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::SlotbookAuthSource;
use crate::booking::{BookingError, CreateOutcome, ReservationService};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct ReservationHandler {
    service: Arc<ReservationService>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl ReservationHandler {
    pub fn new(service: Arc<ReservationService>) -> Self {
        Self {
            service,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        debug!("{label}: {query}");

        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertReservation { request } => match self.service.create(&request).await.map_err(booking_err)? {
                CreateOutcome::Created(reservation) => Ok(reservation_rows(vec![reservation])),
                CreateOutcome::Conflict { slot } => Err(user_error("23505", format!("slot already booked: {slot}"))),
            },
            Command::SelectReservations { filter } => {
                let rows = self.service.list(&filter).await.map_err(booking_err)?;
                Ok(reservation_rows(rows))
            }
            Command::DeleteReservation { id } => {
                let cancelled = self.service.cancel(id).await.map_err(booking_err)?;
                Ok(reservation_rows(vec![cancelled]))
            }
        }
    }
}

/// Columns returned by every reservations statement.
fn reservation_schema() -> Vec<FieldInfo> {
    let text = |name: &str| FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text);
    vec![
        text("id"),
        text("resource_id"),
        text("date"),
        text("time_slot"),
        text("owner_id"),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
        text("status"),
    ]
}

fn reservation_rows(reservations: Vec<Reservation>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource_id)?;
            encoder.encode_field(&r.date.format(DATE_FORMAT).to_string())?;
            encoder.encode_field(&r.time_slot)?;
            encoder.encode_field(&r.owner_id)?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.status.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for ReservationHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, _stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(reservation_schema())
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservationHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
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
        Ok(DescribeStatementResponse::new(param_types, reservation_schema()))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        _target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(reservation_schema()))
    }
}

/// Highest `$N` placeholder in `sql`.
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

fn sql_literal<B: AsRef<[u8]>>(param: &Option<B>) -> String {
    match param {
        Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

/// Inline text-format parameters as quoted literals in one left-to-right
/// pass. Inserted text is never rescanned, and `$N` inside a string literal
/// of `sql` is left alone.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| params.get(n));
        match param {
            Some(param) => out.push_str(&sql_literal(param)),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<ReservationHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(service: Arc<ReservationService>, password: String) -> Self {
        Self {
            handler: Arc::new(ReservationHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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
    service: Arc<ReservationService>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(service, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::Validation(_) => "22023",
        BookingError::NotFound(_) => "02000",
        BookingError::Storage(_) => "58000",
    }
}

fn booking_err(e: BookingError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue(..) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
