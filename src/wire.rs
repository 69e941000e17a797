use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
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
use pgwire::api::{
    ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type, METADATA_USER,
};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::GearbookAuthSource;
use crate::engine::{BookingRequest, Engine, EngineError, RangeCheck, RangeRejection};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct GearbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<GearbookQueryParser>,
}

impl GearbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(GearbookQueryParser),
        }
    }

    /// Parse, run and meter one statement on behalf of the connected user.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let started = Instant::now();
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let caller = client.metadata().get(METADATA_USER).cloned();
        let result = self.execute_command(caller, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, caller: Option<String>, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser { id, name, contact } => {
                // Registering without an id registers the caller.
                let id = id.or(caller).unwrap_or_default();
                engine
                    .register_user(id, name.unwrap_or_default(), contact, Utc::now())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteUser { id } => {
                let caller = require_caller(caller)?;
                authorize(caller == id)?;
                engine.remove_user(&id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectUser { id } => {
                let user = engine.get_user(&id).map_err(engine_err)?;
                let schema = Arc::new(user_schema());
                let row = encode_user(&schema, &user);
                Ok(query_response(schema, vec![row]))
            }
            Command::InsertItem {
                id,
                owner_id,
                fields,
            } => {
                let owner_id = owner_id
                    .or(caller)
                    .filter(|o| !o.trim().is_empty())
                    .ok_or_else(|| engine_err(EngineError::Unauthorized))?;
                let item = engine
                    .list_item(id.unwrap_or_else(Ulid::new), owner_id, fields, Utc::now())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(item_schema());
                let row = encode_item(&schema, &item);
                Ok(query_response(schema, vec![row]))
            }
            Command::UpdateItem { id, fields } => {
                let caller = require_caller(caller)?;
                let item = engine.get_item(id).await.map_err(engine_err)?;
                authorize(item.owner_id == caller)?;
                engine
                    .update_item(id, fields, Utc::now())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteItem { id } => {
                let caller = require_caller(caller)?;
                let item = engine.get_item(id).await.map_err(engine_err)?;
                authorize(item.owner_id == caller)?;
                engine.delist_item(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectItem { id } => {
                let item = engine.get_item(id).await.map_err(engine_err)?;
                let schema = Arc::new(item_schema());
                let row = encode_item(&schema, &item);
                Ok(query_response(schema, vec![row]))
            }
            Command::SelectItems { owner_id } => {
                let items = engine
                    .list_items(owner_id.as_deref())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(item_schema());
                let rows = items.iter().map(|i| encode_item(&schema, i)).collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertBooking {
                item_id,
                start_date,
                end_date,
                total_price,
            } => {
                let req = BookingRequest {
                    caller,
                    item_id,
                    start_date,
                    end_date,
                    total_price,
                };
                let booking = engine
                    .create_booking(&req, Utc::now())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let row = encode_booking(&schema, &booking);
                Ok(query_response(schema, vec![row]))
            }
            Command::UpdateBookingStatus { id, status } => {
                // The owner moves a booking along; its renter may only cancel it.
                let caller = require_caller(caller)?;
                let booking = engine.get_booking(id).await.map_err(engine_err)?;
                let item = engine.get_item(booking.item_id).await.map_err(engine_err)?;
                authorize(
                    item.owner_id == caller
                        || (booking.renter_id == caller && status == BookingStatus::Cancelled),
                )?;
                engine
                    .set_booking_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectBooking { id } => {
                let view = engine.get_booking_view(id).await.map_err(engine_err)?;
                let schema = Arc::new(booking_view_schema());
                let row = encode_booking_view(&schema, &view);
                Ok(query_response(schema, vec![row]))
            }
            Command::SelectItemBookings { item_id, exclude } => {
                let bookings = engine
                    .list_bookings_for_item(item_id, &exclude)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let rows = bookings.iter().map(|b| encode_booking(&schema, b)).collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectDisabledDates { item_id, from, to } => {
                let days = engine
                    .disabled_dates(item_id, from, to, Utc::now())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(disabled_dates_schema());
                let item = item_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = days
                    .iter()
                    .map(|day| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&item)?;
                        encoder.encode_field(&day.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectQuote { item_id, start, end } => {
                let check = engine
                    .quote(item_id, start, end, Utc::now())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(quote_schema());
                let row = encode_quote(&schema, item_id, start, end, &check);
                Ok(query_response(schema, vec![row]))
            }
            Command::SelectPayouts { owner_id } => {
                let summary = engine.owner_payouts(&owner_id).await.map_err(engine_err)?;
                let schema = Arc::new(payouts_schema());
                let row = encode_payouts(&schema, &summary);
                Ok(query_response(schema, vec![row]))
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("contact", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
    ]
}

fn item_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("type", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("price_per_day", Type::VARCHAR),
        field("location", Type::VARCHAR),
        field("available", Type::BOOL),
        field("min_rental_days", Type::INT8),
        field("max_rental_days", Type::INT8),
        field("created_at", Type::VARCHAR),
        field("updated_at", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("item_id", Type::VARCHAR),
        field("renter_id", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        field("total_price", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
    ]
}

/// Booking columns followed by the joined and pre-rendered ones.
fn booking_view_schema() -> Vec<FieldInfo> {
    let mut schema = booking_schema();
    schema.extend([
        field("days", Type::INT8),
        field("start_display", Type::VARCHAR),
        field("end_display", Type::VARCHAR),
        field("created_at_unix", Type::INT8),
        field("created_at_display", Type::VARCHAR),
        field("item", Type::VARCHAR),
        field("owner", Type::VARCHAR),
    ]);
    schema
}

fn disabled_dates_schema() -> Vec<FieldInfo> {
    vec![
        field("item_id", Type::VARCHAR),
        field("calendar_day", Type::VARCHAR),
    ]
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        field("item_id", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        field("days", Type::INT8),
        field("price_per_day", Type::VARCHAR),
        field("subtotal", Type::VARCHAR),
        field("service_fee", Type::VARCHAR),
        field("total", Type::VARCHAR),
        field("bookable", Type::BOOL),
        field("reason", Type::VARCHAR),
        field("violations", Type::VARCHAR),
    ]
}

fn payouts_schema() -> Vec<FieldInfo> {
    vec![
        field("owner_id", Type::VARCHAR),
        field("pending_bookings", Type::INT8),
        field("confirmed_bookings", Type::INT8),
        field("completed_bookings", Type::INT8),
        field("cancelled_bookings", Type::INT8),
        field("pending_revenue", Type::VARCHAR),
        field("completed_revenue", Type::VARCHAR),
        field("platform_fee", Type::VARCHAR),
        field("available_for_payout", Type::VARCHAR),
    ]
}

/// Schema for a statement not yet bound to parameters. Only the verb and
/// table matter, so placeholders don't have to parse.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';' || c == ',')
        .filter(|w| !w.is_empty())
        .collect();
    let table = words
        .windows(2)
        .find(|w| w[0] == "from" || w[0] == "into")
        .map(|w| w[1]);

    match (words.first().copied(), table) {
        (Some("select"), Some("users")) => user_schema(),
        (Some("select"), Some("items")) | (Some("insert"), Some("items")) => item_schema(),
        (Some("select"), Some("bookings")) if lower.contains("item_id") => booking_schema(),
        (Some("select"), Some("bookings")) => booking_view_schema(),
        (Some("insert"), Some("bookings")) => booking_schema(),
        (Some("select"), Some("disabled_dates")) => disabled_dates_schema(),
        (Some("select"), Some("quote")) => quote_schema(),
        (Some("select"), Some("payouts")) => payouts_schema(),
        _ => vec![],
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn encode_user(schema: &Arc<Vec<FieldInfo>>, user: &UserProfile) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&user.id)?;
    encoder.encode_field(&user.name)?;
    encoder.encode_field(&user.contact)?;
    encoder.encode_field(&user.created_at.to_rfc3339())?;
    Ok(encoder.take_row())
}

fn encode_item(schema: &Arc<Vec<FieldInfo>>, item: &Item) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&item.id.to_string())?;
    encoder.encode_field(&item.owner_id)?;
    encoder.encode_field(&item.item_type)?;
    encoder.encode_field(&item.name)?;
    encoder.encode_field(&item.description)?;
    encoder.encode_field(&item.price_per_day.to_string())?;
    encoder.encode_field(&item.location)?;
    encoder.encode_field(&item.available)?;
    encoder.encode_field(&i64::from(item.min_rental_days))?;
    encoder.encode_field(&i64::from(item.max_rental_days))?;
    encoder.encode_field(&item.created_at.to_rfc3339())?;
    encoder.encode_field(&item.updated_at.map(|t| t.to_rfc3339()))?;
    Ok(encoder.take_row())
}

fn encode_booking_fields(encoder: &mut DataRowEncoder, booking: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&booking.item_id.to_string())?;
    encoder.encode_field(&booking.renter_id)?;
    encoder.encode_field(&booking.range.start.to_string())?;
    encoder.encode_field(&booking.range.end.to_string())?;
    encoder.encode_field(&booking.total_price.to_string())?;
    encoder.encode_field(&booking.status.to_string())?;
    encoder.encode_field(&booking.created_at.to_rfc3339())
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, booking: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_booking_fields(&mut encoder, booking)?;
    Ok(encoder.take_row())
}

fn encode_booking_view(schema: &Arc<Vec<FieldInfo>>, view: &BookingView) -> PgWireResult<DataRow> {
    let item = serde_json::to_string(&view.item).map_err(json_err)?;
    let owner = view
        .owner
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(json_err)?;

    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_booking_fields(&mut encoder, &view.booking)?;
    encoder.encode_field(&view.days)?;
    encoder.encode_field(&view.start_display)?;
    encoder.encode_field(&view.end_display)?;
    encoder.encode_field(&view.created_at_unix)?;
    encoder.encode_field(&view.created_at_display)?;
    encoder.encode_field(&item)?;
    encoder.encode_field(&owner)?;
    Ok(encoder.take_row())
}

fn encode_quote(
    schema: &Arc<Vec<FieldInfo>>,
    item_id: Ulid,
    start: Day,
    end: Day,
    check: &RangeCheck,
) -> PgWireResult<DataRow> {
    let reasons: Vec<&str> = check.violations.iter().map(RangeRejection::reason).collect();
    let violations = serde_json::to_string(&reasons).map_err(json_err)?;
    let quote = check.quote.as_ref();

    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&item_id.to_string())?;
    encoder.encode_field(&start.to_string())?;
    encoder.encode_field(&end.to_string())?;
    encoder.encode_field(&quote.map(|q| q.days))?;
    encoder.encode_field(&quote.map(|q| q.price_per_day.to_string()))?;
    encoder.encode_field(&quote.map(|q| q.subtotal.to_string()))?;
    encoder.encode_field(&quote.map(|q| q.service_fee.to_string()))?;
    encoder.encode_field(&quote.map(|q| q.total.to_string()))?;
    encoder.encode_field(&check.is_bookable())?;
    encoder.encode_field(&check.reason().map(|r| format!("{}: {r}", r.reason())))?;
    encoder.encode_field(&violations)?;
    Ok(encoder.take_row())
}

fn encode_payouts(schema: &Arc<Vec<FieldInfo>>, summary: &PayoutSummary) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&summary.owner_id)?;
    encoder.encode_field(&(summary.pending_bookings as i64))?;
    encoder.encode_field(&(summary.confirmed_bookings as i64))?;
    encoder.encode_field(&(summary.completed_bookings as i64))?;
    encoder.encode_field(&(summary.cancelled_bookings as i64))?;
    encoder.encode_field(&summary.pending_revenue.to_string())?;
    encoder.encode_field(&summary.completed_revenue.to_string())?;
    encoder.encode_field(&summary.platform_fee.to_string())?;
    encoder.encode_field(&summary.available_for_payout.to_string())?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for GearbookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct GearbookQueryParser;

#[async_trait]
impl QueryParser for GearbookQueryParser {
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
impl ExtendedQueryHandler for GearbookHandler {
    type Statement = String;
    type QueryParser = GearbookQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(client, &sql).await
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

/// The connected user, or `Unauthorized` when the startup packet named none.
fn require_caller(caller: Option<String>) -> PgWireResult<String> {
    caller
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| engine_err(EngineError::Unauthorized))
}

fn authorize(allowed: bool) -> PgWireResult<()> {
    if allowed {
        Ok(())
    } else {
        Err(engine_err(EngineError::Unauthorized))
    }
}

/// Byte span and 1-based index of every `$N` placeholder outside quoted text.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, so toggling covers escapes.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start + 1
                    && let Ok(n) = sql[start + 1..end].parse::<usize>()
                {
                    out.push((start, end, n));
                }
                i = end;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    out
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Substitute `$1`, `$2`, ... with bound values (text format) in a single pass.
/// Inserted values are never scanned again. Placeholders with no bound value
/// are left for the parser to reject.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct GearbookFactory {
    handler: Arc<GearbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<GearbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl GearbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = GearbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(GearbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for GearbookFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(GearbookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for each engine error. Stable across releases.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Unauthorized => "28000",
        EngineError::MissingFields(_) => "23502",
        EngineError::InvalidDate { .. } => "22007",
        EngineError::Rejected(r) => match r {
            RangeRejection::PastDate { .. } => "22008",
            RangeRejection::InvalidOrder { .. } => "22023",
            RangeRejection::TooShort { .. } | RangeRejection::TooLong { .. } => "23514",
            RangeRejection::Overlap { .. } => "23P01",
        },
        EngineError::Conflict { .. } => "40001",
        EngineError::Transient(_) => "57014",
        EngineError::NotFound { .. } => "P0002",
        EngineError::AlreadyExists { .. } => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::InvalidItem(_) => "22000",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// Client-facing message: the reason code verbatim, then the details.
pub fn error_message(e: &EngineError) -> String {
    format!("{}: {e}", e.reason())
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), error_message(&e))
}

fn sql_error_parts(e: &SqlError) -> (&'static str, String) {
    match e {
        SqlError::Date { .. } => ("22007", format!("InvalidDate: {e}")),
        _ => ("42601", e.to_string()),
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    let (code, message) = sql_error_parts(&e);
    user_error(code, message)
}

fn json_err(e: serde_json::Error) -> PgWireError {
    user_error("XX000", format!("encoding failed: {e}"))
}
