use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use fieldtime::catalog::Catalog;
use fieldtime::engine::{Engine, EngineSettings};
use fieldtime::model::BookingWindow;
use fieldtime::retry::RetryPolicy;
use fieldtime::scheduler::Scheduler;
use fieldtime::wire;

const PASSWORD: &str = "fieldtime";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("fieldtime_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let settings = EngineSettings {
        window: BookingWindow::new(6, 22, chrono_tz::UTC).unwrap(),
        lock_timeout: Duration::from_millis(500),
        allow_past: true,
    };
    let engine = Engine::new(dir.join("reservations.wal"), Catalog::builtin(), settings).unwrap();
    let scheduler = Arc::new(Scheduler::new(engine, RetryPolicy::default(), 1000));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, scheduler, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("fieldtime")
        .user("coach")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn col<'a>(row: &'a SimpleQueryRow, name: &str) -> &'a str {
    row.get(name).unwrap()
}

/// SQLSTATE of a failed statement.
async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().unwrap().code().to_string()
}

fn insert_sql(resource_id: u32, start: &str, end: &str, max: u32, author: u64) -> String {
    format!(
        r#"INSERT INTO reservations (resource_id, start, "end", max_participants, author_id)
           VALUES ({resource_id}, '{start}', '{end}', {max}, {author})"#
    )
}

async fn create(client: &Client, resource_id: u32, hour: u32, max: u32, author: u64) -> String {
    let start = format!("2030-06-10T{hour:02}:00:00Z");
    let end = format!("2030-06-10T{:02}:00:00Z", hour + 1);
    let created = rows(client, &insert_sql(resource_id, &start, &end, max, author)).await;
    assert_eq!(created.len(), 1);
    col(&created[0], "id").to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn resources_listed() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let resources = rows(&client, "SELECT * FROM resources").await;
    assert_eq!(resources.len(), 15);
    assert_eq!(col(&resources[0], "id"), "1");
    assert_eq!(col(&resources[0], "name"), "Football Field 1");
}

#[tokio::test]
async fn create_returns_row_in_configured_zone() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let created = rows(
        &client,
        &insert_sql(2, "2030-06-10T12:00:00+03:00", "2030-06-10T14:00:00+03:00", 4, 42),
    )
    .await;
    assert_eq!(created.len(), 1);
    let row = &created[0];
    assert_eq!(col(row, "resource_id"), "2");
    assert_eq!(col(row, "resource_name"), "Football Field 2");
    assert_eq!(col(row, "start"), "2030-06-10T09:00:00+00:00");
    assert_eq!(col(row, "end"), "2030-06-10T11:00:00+00:00");
    assert_eq!(col(row, "author_id"), "42");
    assert_eq!(col(row, "max_participants"), "4");
    assert_eq!(col(row, "participant_ids"), "{}");

    let id = col(row, "id");
    let fetched = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(col(&fetched[0], "start"), "2030-06-10T09:00:00+00:00");
}

#[tokio::test]
async fn overlap_rejected_across_connections() {
    let addr = start_test_server().await;
    let first = connect(addr).await;
    let second = connect(addr).await;

    create(&first, 1, 9, 2, 1).await;
    let state = sqlstate(
        &second,
        &insert_sql(1, "2030-06-10T09:30:00Z", "2030-06-10T10:30:00Z", 2, 2),
    )
    .await;
    assert_eq!(state, "23P01");

    // Back-to-back is fine.
    create(&second, 1, 10, 2, 2).await;
}

#[tokio::test]
async fn availability_tables() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    create(&client, 7, 9, 2, 1).await;
    create(&client, 7, 10, 2, 1).await;

    let occupied = rows(
        &client,
        "SELECT * FROM occupied_hours WHERE resource_id = 7 AND date = '2030-06-10'",
    )
    .await;
    let labels: Vec<_> = occupied.iter().map(|r| col(r, "hour").to_string()).collect();
    assert_eq!(labels, vec!["09:00", "10:00"]);

    let free = rows(
        &client,
        "SELECT * FROM free_intervals WHERE resource_id = 7 AND date = '2030-06-10'",
    )
    .await;
    assert_eq!(free.len(), 14);
    assert_eq!(col(&free[0], "hour"), "06:00 - 07:00");
    assert_eq!(col(&free[3], "hour"), "11:00 - 12:00");

    let by_date = rows(
        &client,
        "SELECT * FROM reservations WHERE resource_id = 7 AND date = '2030-06-10'",
    )
    .await;
    assert_eq!(by_date.len(), 2);
}

#[tokio::test]
async fn join_leave_and_capacity() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let id = create(&client, 11, 18, 2, 1).await;

    let joined = rows(
        &client,
        &format!("INSERT INTO participants (reservation_id, user_id) VALUES ('{id}', 2)"),
    )
    .await;
    assert_eq!(col(&joined[0], "message"), format!("joined reservation {id}"));

    // Author plus one joiner fills a two-place reservation.
    let full = sqlstate(
        &client,
        &format!("INSERT INTO participants (reservation_id, user_id) VALUES ('{id}', 3)"),
    )
    .await;
    assert_eq!(full, "23514");

    let mine = rows(&client, "SELECT * FROM reservations WHERE user_id = 2").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(col(&mine[0], "participant_ids"), "{2}");

    let left = rows(
        &client,
        &format!("DELETE FROM participants WHERE reservation_id = '{id}' AND user_id = 2"),
    )
    .await;
    assert_eq!(col(&left[0], "message"), format!("left reservation {id}"));

    let not_in = sqlstate(
        &client,
        &format!("DELETE FROM participants WHERE reservation_id = '{id}' AND user_id = 2"),
    )
    .await;
    assert_eq!(not_in, "P0003");
}

#[tokio::test]
async fn update_and_delete_are_author_only() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let id = create(&client, 3, 9, 2, 1).await;
    let update = |requester: u64| {
        format!(
            r#"UPDATE reservations SET resource_id = 4, start = '2030-06-10T15:00:00Z',
               "end" = '2030-06-10T16:00:00Z', max_participants = 6
               WHERE id = '{id}' AND requester_id = {requester}"#
        )
    };

    assert_eq!(sqlstate(&client, &update(99)).await, "42501");
    let moved = rows(&client, &update(1)).await;
    assert_eq!(col(&moved[0], "resource_id"), "4");
    assert_eq!(col(&moved[0], "max_participants"), "6");

    let delete = |requester: u64| {
        format!("DELETE FROM reservations WHERE id = '{id}' AND requester_id = {requester}")
    };
    assert_eq!(sqlstate(&client, &delete(99)).await, "42501");
    client.simple_query(&delete(1)).await.unwrap();
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await,
        "P0002"
    );
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let id = create(&client, 5, 20, 3, 1).await;
    let joined = client
        .query(
            "INSERT INTO participants (reservation_id, user_id) VALUES ($1, $2)",
            &[&id, &"8"],
        )
        .await
        .unwrap();
    assert_eq!(joined.len(), 1);
    let message: String = joined[0].get("message");
    assert_eq!(message, format!("joined reservation {id}"));
}

#[tokio::test]
async fn malformed_sql_is_a_syntax_error() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    assert_eq!(sqlstate(&client, "SELECT * FROM bookings").await, "42601");
    assert_eq!(
        sqlstate(&client, "SELECT * FROM free_intervals WHERE resource_id = 1").await,
        "42601"
    );
}
