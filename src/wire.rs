use std::fmt::Debug;
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
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::{self, LedgerAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, FacilityFilter, SpaceFilter, StayFilter};
use crate::tenant::TenantManager;

pub struct LedgerHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<LedgerQueryParser>,
}

impl LedgerHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(LedgerQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let caller = resolve_caller(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);

        let start = Instant::now();
        let result = execute_command(&engine, &caller, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }
}

/// The authenticated pgwire user is the caller of every operation.
fn resolve_caller<C: ClientInfo>(client: &C) -> PgWireResult<Account> {
    let user = client.metadata().get("user").map(String::as_str).unwrap_or("");
    auth::check_user(user).map_err(|msg| user_error("28000", msg.to_string()))?;
    Ok(Account::new(user))
}

async fn execute_command(engine: &Engine, caller: &Account, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::InsertFacility { data_uri, active } => {
            let id = engine
                .register_facility(caller, data_uri, active)
                .await
                .map_err(engine_err)?;
            id_response(id)
        }
        Command::UpdateFacility { id, data_uri, active } => {
            engine
                .update_facility(caller, id, data_uri, active)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::DeleteFacility { id } => {
            engine.delete_facility(caller, id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertSpace {
            facility_id,
            capacity,
            price_per_night,
            active,
            data_uri,
        } => {
            let id = engine
                .add_space(caller, facility_id, capacity, price_per_night, active, data_uri)
                .await
                .map_err(engine_err)?;
            id_response(id)
        }
        Command::UpdateSpace {
            id,
            capacity,
            price_per_night,
            active,
            data_uri,
        } => {
            engine
                .update_space(caller, id, capacity, price_per_night, active, data_uri)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::DeleteSpace { id } => {
            engine.delete_space(caller, id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertStay {
            space_id,
            day_start,
            days,
            units,
            payment,
            data_uri,
        } => {
            let stay = engine
                .book_stay(caller, space_id, day_start, days, units, payment, data_uri)
                .await
                .map_err(engine_err)?;
            let schema = Arc::new(booked_schema());
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&stay.id.to_string())?;
            encoder.encode_field(&(stay.token_id as i64))?;
            rows_response(schema, vec![Ok(encoder.take_row())])
        }
        Command::ModifyStay {
            id,
            day_start,
            days,
            units,
            additional_payment,
        } => {
            let stay = engine
                .modify_stay(caller, id, day_start, days, units, additional_payment)
                .await
                .map_err(engine_err)?;
            let schema = Arc::new(stay_schema());
            let row = encode_stay(&schema, &stay);
            rows_response(schema, vec![row])
        }
        Command::CheckIn { id } => {
            let payout = engine.check_in(caller, id).await.map_err(engine_err)?;
            payout_response(&payout)
        }
        Command::CheckOut { id } => {
            let payout = engine.check_out(caller, id).await.map_err(engine_err)?;
            payout_response(&payout)
        }
        Command::CancelStay { id } => {
            let payout = engine.cancel_stay(caller, id).await.map_err(engine_err)?;
            debug!(stay_id = %id, total = %payout.total(), "stay cancelled over the wire");
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectFacilities { filter } => {
            let facilities = match filter {
                FacilityFilter::All => engine.facilities(None).await,
                FacilityFilter::Owner(owner) => engine.facilities(Some(&owner)).await,
                FacilityFilter::Id(id) => engine.facility(&id).await.filter(Facility::exists).into_iter().collect(),
            };
            let schema = Arc::new(facility_schema());
            let rows = facilities.iter().map(|f| encode_facility(&schema, f)).collect();
            rows_response(schema, rows)
        }
        Command::SelectSpaces { filter } => {
            let spaces = match filter {
                SpaceFilter::Facility(facility_id) => engine.spaces_of(&facility_id).await.map_err(engine_err)?,
                SpaceFilter::Id(id) => engine.space(&id).await.filter(Space::exists).into_iter().collect(),
            };
            let schema = Arc::new(space_schema());
            let rows = spaces.iter().map(|s| encode_space(&schema, s)).collect();
            rows_response(schema, rows)
        }
        Command::SelectStays { filter } => {
            let stays = match filter {
                StayFilter::Id(id) => engine.stay(&id).await.into_iter().collect(),
                StayFilter::Guest(guest) => engine.stays_of_guest(&guest).await,
                StayFilter::Space(space_id) => engine.stays_of_space(&space_id).await.map_err(engine_err)?,
            };
            let schema = Arc::new(stay_schema());
            let rows = stays.iter().map(|s| encode_stay(&schema, s)).collect();
            rows_response(schema, rows)
        }
        Command::SelectAvailability {
            space_id,
            day_start,
            days,
        } => {
            let remaining = engine
                .availability(&space_id, day_start, days)
                .await
                .map_err(engine_err)?;
            let schema = Arc::new(availability_schema());
            let rows = remaining
                .into_iter()
                .zip(day_start..)
                .map(|(units, day)| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&day)?;
                    encoder.encode_field(&i64::from(units))?;
                    Ok(encoder.take_row())
                })
                .collect();
            rows_response(schema, rows)
        }
    }
}

fn rows_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> PgWireResult<Response> {
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn id_response(id: ulid::Ulid) -> PgWireResult<Response> {
    let schema = Arc::new(id_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&id.to_string())?;
    rows_response(schema, vec![Ok(encoder.take_row())])
}

fn payout_response(payout: &Payout) -> PgWireResult<Response> {
    let schema = Arc::new(payout_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&payout.owner.to_string())?;
    encoder.encode_field(&payout.owner_amount.to_string())?;
    encoder.encode_field(&payout.charity.to_string())?;
    encoder.encode_field(&payout.charity_amount.to_string())?;
    rows_response(schema, vec![Ok(encoder.take_row())])
}

fn encode_facility(schema: &Arc<Vec<FieldInfo>>, f: &Facility) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&f.id.to_string())?;
    encoder.encode_field(&f.owner.to_string())?;
    encoder.encode_field(&f.data_uri)?;
    encoder.encode_field(&f.active)?;
    Ok(encoder.take_row())
}

fn encode_space(schema: &Arc<Vec<FieldInfo>>, s: &Space) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.facility_id.to_string())?;
    encoder.encode_field(&i64::from(s.capacity))?;
    encoder.encode_field(&s.price_per_night.to_string())?;
    encoder.encode_field(&s.active)?;
    encoder.encode_field(&s.data_uri)?;
    Ok(encoder.take_row())
}

fn encode_stay(schema: &Arc<Vec<FieldInfo>>, s: &Stay) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.space_id.to_string())?;
    encoder.encode_field(&s.guest.to_string())?;
    encoder.encode_field(&s.range.start)?;
    encoder.encode_field(&i64::from(s.range.days))?;
    encoder.encode_field(&i64::from(s.units))?;
    encoder.encode_field(&s.amount_paid.to_string())?;
    encoder.encode_field(&s.escrow.to_string())?;
    encoder.encode_field(&s.price_per_night.to_string())?;
    encoder.encode_field(&s.status.as_str().to_string())?;
    encoder.encode_field(&(s.token_id as i64))?;
    encoder.encode_field(&s.data_uri)?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────
// Money is u128 and travels as text.

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn id_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::VARCHAR)]
}

fn booked_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::VARCHAR), field("token_id", Type::INT8)]
}

fn payout_schema() -> Vec<FieldInfo> {
    vec![
        field("owner", Type::VARCHAR),
        field("owner_amount", Type::VARCHAR),
        field("charity", Type::VARCHAR),
        field("charity_amount", Type::VARCHAR),
    ]
}

fn facility_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner", Type::VARCHAR),
        field("data_uri", Type::VARCHAR),
        field("active", Type::BOOL),
    ]
}

fn space_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("facility_id", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("price_per_night", Type::VARCHAR),
        field("active", Type::BOOL),
        field("data_uri", Type::VARCHAR),
    ]
}

fn stay_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("space_id", Type::VARCHAR),
        field("guest", Type::VARCHAR),
        field("day_start", Type::INT8),
        field("days", Type::INT8),
        field("units", Type::INT8),
        field("amount_paid", Type::VARCHAR),
        field("escrow", Type::VARCHAR),
        field("price_per_night", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("token_id", Type::INT8),
        field("data_uri", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![field("day", Type::INT8), field("remaining", Type::INT8)]
}

/// Result columns of a statement, read from its verb and table alone so
/// that statements with unbound `$n` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(|t| t.trim_matches('"'))
    };
    match words.first().copied() {
        Some("insert") => match after("into") {
            Some("facilities") | Some("spaces") => id_schema(),
            Some("stays") => booked_schema(),
            Some("stay_changes") => stay_schema(),
            Some("check_ins") | Some("check_outs") => payout_schema(),
            _ => vec![],
        },
        Some("select") => match after("from") {
            Some("facilities") => facility_schema(),
            Some("spaces") => space_schema(),
            Some("stays") => stay_schema(),
            Some("availability") => availability_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for LedgerHandler {
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
pub struct LedgerQueryParser;

#[async_trait]
impl QueryParser for LedgerQueryParser {
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
impl ExtendedQueryHandler for LedgerHandler {
    type Statement = String;
    type QueryParser = LedgerQueryParser;

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
        let sql = substitute_params(portal);
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).map(|(_, _, n)| n).max().unwrap_or(0)
}

/// `$N` placeholders outside quoted literals, as `(start, end, N)` byte spans.
fn placeholders(sql: &str) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
    let bytes = sql.as_bytes();
    let mut pos = 0;
    let mut in_literal = false;
    std::iter::from_fn(move || {
        while pos < bytes.len() {
            let start = pos;
            pos += 1;
            match bytes[start] {
                b'\'' => in_literal = !in_literal,
                b'$' if !in_literal => {
                    let digits = bytes[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
                    if let Ok(n) = sql[pos..pos + digits].parse::<usize>() {
                        pos += digits;
                        return Some((start, pos, n));
                    }
                }
                _ => {}
            }
        }
        None
    })
}

/// Splice bound text-format values into the statement in one pass over the
/// original text. Substituted values are never rescanned.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LedgerFactory {
    handler: Arc<LedgerHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LedgerAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LedgerFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(LedgerHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                LedgerAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LedgerFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = LedgerFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    debug!(kind = e.kind(), "engine rejected command: {e}");
    user_error("P0001", e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
