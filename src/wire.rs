use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use pgwire::tokio::{TlsAcceptor, process_socket};
use tokio::net::TcpStream;

use crate::auth::FieldtimeAuthSource;
use crate::engine::EngineError;
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::scheduler::{ReservationFilter, Scheduler};
use crate::sql::{self, Command, ReservationInsert, ReservationQuery};

pub struct FieldtimeHandler {
    scheduler: Arc<Scheduler>,
    query_parser: Arc<FieldtimeQueryParser>,
}

impl FieldtimeHandler {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            query_parser: Arc::new(FieldtimeQueryParser),
        }
    }

    async fn run_sql(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let s = &self.scheduler;
        match cmd {
            Command::InsertReservation(insert) => {
                let r = s.create_reservation(new_reservation(insert)?).await.map_err(engine_err)?;
                self.reservation_rows(vec![r])
            }
            Command::UpdateReservation {
                id,
                requester_id,
                resource_id,
                start,
                end,
                max_participants,
            } => {
                let change = ReservationChange {
                    resource_id,
                    span: span(start, end)?,
                    max_participants,
                };
                let r = s
                    .update_reservation(id, change, requester_id)
                    .await
                    .map_err(engine_err)?;
                self.reservation_rows(vec![r])
            }
            Command::DeleteReservation { id, requester_id } => {
                s.delete_reservation(id, requester_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations(query) => {
                let rows = match query {
                    ReservationQuery::All => s.list_reservations(ReservationFilter::All).await,
                    ReservationQuery::ForUser(user) => {
                        s.list_reservations(ReservationFilter::ForUser(user)).await
                    }
                    ReservationQuery::ById(id) => s.get_reservation(id).await.map(|r| vec![r]),
                    ReservationQuery::ByResourceAndDate { resource_id, date } => {
                        s.list_by_resource_and_date(resource_id, date).await
                    }
                }
                .map_err(engine_err)?;
                self.reservation_rows(rows)
            }
            Command::SelectOccupiedHours { resource_id, date } => {
                let slots = s.occupied_hours(resource_id, date).await.map_err(engine_err)?;
                self.slot_rows(slots, HourSlot::label)
            }
            Command::SelectFreeIntervals { resource_id, date } => {
                let slots = s.free_intervals(resource_id, date).await.map_err(engine_err)?;
                self.slot_rows(slots, HourSlot::range_label)
            }
            Command::SelectResources => {
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = s
                    .catalog()
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&i64::from(r.id))?;
                        encoder.encode_field(&r.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertParticipant {
                reservation_id,
                user_id,
            } => {
                s.join(reservation_id, user_id).await.map_err(engine_err)?;
                message_row(format!("joined reservation {reservation_id}"))
            }
            Command::DeleteParticipant {
                reservation_id,
                user_id,
            } => {
                s.leave(reservation_id, user_id).await.map_err(engine_err)?;
                message_row(format!("left reservation {reservation_id}"))
            }
        }
    }

    fn reservation_rows(&self, reservations: Vec<Reservation>) -> PgWireResult<Response> {
        let schema = Arc::new(reservation_schema());
        let window = self.scheduler.window();
        let catalog = self.scheduler.catalog();
        let rows: Vec<PgWireResult<_>> = reservations
            .into_iter()
            .map(|r| {
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&r.id.to_string())?;
                encoder.encode_field(&i64::from(r.resource_id))?;
                encoder.encode_field(&catalog.name(r.resource_id).map(str::to_string))?;
                encoder.encode_field(&window.format_instant(r.span.start))?;
                encoder.encode_field(&window.format_instant(r.span.end))?;
                encoder.encode_field(&(r.author_id as i64))?;
                encoder.encode_field(&i64::from(r.max_participants))?;
                encoder.encode_field(&id_list(&r))?;
                Ok(encoder.take_row())
            })
            .collect();
        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
    }

    fn slot_rows(&self, slots: Vec<HourSlot>, label: fn(&HourSlot) -> String) -> PgWireResult<Response> {
        let schema = Arc::new(slot_schema());
        let window = self.scheduler.window();
        let rows: Vec<PgWireResult<_>> = slots
            .iter()
            .map(|slot| {
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&label(slot))?;
                encoder.encode_field(&window.format_instant(slot.span.start))?;
                encoder.encode_field(&window.format_instant(slot.span.end))?;
                Ok(encoder.take_row())
            })
            .collect();
        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
    }
}

fn new_reservation(insert: ReservationInsert) -> PgWireResult<NewReservation> {
    Ok(NewReservation {
        resource_id: insert.resource_id,
        span: span(insert.start, insert.end)?,
        author_id: insert.author_id,
        max_participants: insert.max_participants,
        participants: insert.participant_ids,
    })
}

fn span(start: Ms, end: Ms) -> PgWireResult<Span> {
    Span::checked(start, end)
        .ok_or_else(|| engine_err(EngineError::InvalidInterval("end must be after start")))
}

/// Postgres array literal: `{5,6}`.
fn id_list(r: &Reservation) -> String {
    let ids: Vec<String> = r.participants.iter().map(|id| id.to_string()).collect();
    format!("{{{}}}", ids.join(","))
}

fn message_row(message: String) -> PgWireResult<Response> {
    let schema = Arc::new(message_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&message)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::INT8),
        field("resource_name", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("author_id", Type::INT8),
        field("max_participants", Type::INT8),
        field("participant_ids", Type::VARCHAR),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("hour", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::INT8), field("name", Type::VARCHAR)]
}

fn message_schema() -> Vec<FieldInfo> {
    vec![field("message", Type::VARCHAR)]
}

/// Row shape a statement produces, judged from its text alone so that
/// statements with unbound `$N` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let verb = upper.split_whitespace().next().unwrap_or("");
    if upper.contains("PARTICIPANTS") && (verb == "INSERT" || verb == "DELETE") {
        return message_schema();
    }
    match verb {
        "SELECT" if upper.contains("OCCUPIED_HOURS") || upper.contains("FREE_INTERVALS") => slot_schema(),
        "SELECT" if upper.contains("FROM RESOURCES") => resources_schema(),
        "SELECT" | "INSERT" | "UPDATE" if upper.contains("RESERVATIONS") => reservation_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for FieldtimeHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run_sql(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FieldtimeQueryParser;

#[async_trait]
impl QueryParser for FieldtimeQueryParser {
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
impl ExtendedQueryHandler for FieldtimeHandler {
    type Statement = String;
    type QueryParser = FieldtimeQueryParser;

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
        let sql = substitute_params(portal);
        self.run_sql(&sql).await
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format)
/// in one left-to-right pass, so substituted text is never rescanned.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_text(&portal.statement.statement, &params)
}

fn substitute_text(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            result.push_str(&sql[copied..i]);
            match param {
                Some(text) => {
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                None => result.push_str("NULL"),
            }
            copied = end;
        }
        i = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FieldtimeFactory {
    handler: Arc<FieldtimeHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FieldtimeAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FieldtimeFactory {
    pub fn new(scheduler: Arc<Scheduler>, password: String) -> Self {
        let auth_source = FieldtimeAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FieldtimeHandler::new(scheduler)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FieldtimeFactory {
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
    scheduler: Arc<Scheduler>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(FieldtimeFactory::new(scheduler, password));
    process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(schema: Vec<FieldInfo>) -> Vec<String> {
        schema.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM reservations"), 0);
        assert_eq!(count_params("DELETE FROM participants WHERE reservation_id = $1 AND user_id = $2"), 2);
        assert_eq!(count_params("VALUES ($2, $10, $1)"), 10);
    }

    #[test]
    fn substitution_quotes_and_escapes() {
        let sql = "SELECT * FROM reservations WHERE id = $1 AND user_id = $10";
        let mut params: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        params[0] = Some("it's".into());
        assert_eq!(
            substitute_text(sql, &params),
            "SELECT * FROM reservations WHERE id = 'it''s' AND user_id = '10'"
        );
        assert_eq!(substitute_text("VALUES ($1)", &[None]), "VALUES (NULL)");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let params = vec![Some("5".to_string()), Some("costs $1".to_string())];
        assert_eq!(
            substitute_text("VALUES ($1, $2)", &params),
            "VALUES ('5', 'costs $1')"
        );
        // Placeholders past the bound params stay as written.
        assert_eq!(substitute_text("VALUES ($3)", &params), "VALUES ($3)");
    }

    #[test]
    fn schema_follows_statement_shape() {
        assert_eq!(names(result_schema("SELECT * FROM resources")), vec!["id", "name"]);
        assert_eq!(
            names(result_schema("select * from free_intervals where resource_id = $1 and date = $2")),
            vec!["hour", "start", "end"]
        );
        assert_eq!(
            names(result_schema("INSERT INTO participants (reservation_id, user_id) VALUES ($1, $2)")),
            vec!["message"]
        );
        assert_eq!(result_schema("SELECT * FROM reservations WHERE resource_id = $1 AND date = $2").len(), 8);
        assert_eq!(result_schema("UPDATE reservations SET start = $1").len(), 8);
        assert!(result_schema("DELETE FROM reservations WHERE id = $1 AND requester_id = $2").is_empty());
    }

    #[test]
    fn errors_carry_sqlstate() {
        let PgWireError::UserError(info) = engine_err(EngineError::Timeout) else {
            panic!("expected user error");
        };
        assert!(format!("{info:?}").contains("55P03"));
    }

    #[test]
    fn participant_ids_render_as_array_literal() {
        let mut r = Reservation {
            id: ulid::Ulid::new(),
            resource_id: 1,
            span: Span::new(0, HOUR_MS),
            author_id: 1,
            max_participants: 4,
            participants: Default::default(),
        };
        assert_eq!(id_list(&r), "{}");
        r.participants.extend([9, 3]);
        assert_eq!(id_list(&r), "{3,9}");
    }
}
