//! Tests against a running ClickHouse server.
//!
//! Set `TEST_INTEGRATION` and `TEST_CLICKHOUSE_ADDR` (e.g. `localhost:8123`) to run them.

use std::time::Duration;

use chclient::{Client, Error, RowError};

macro_rules! maybe_skip_integration {
    () => {{
        use std::env;

        match (
            env::var("TEST_INTEGRATION").is_ok(),
            env::var("TEST_CLICKHOUSE_ADDR").ok(),
        ) {
            (true, Some(addr)) => addr,
            (true, None) => {
                panic!(
                    "TEST_INTEGRATION is set which requires running integration tests, but \
                    TEST_CLICKHOUSE_ADDR is not set. Please set TEST_CLICKHOUSE_ADDR to the \
                    HTTP address of a ClickHouse server, e.g. `localhost:8123`."
                )
            }
            (false, _) => {
                eprintln!(
                    "skipping ClickHouse integration tests - set TEST_INTEGRATION and \
                    TEST_CLICKHOUSE_ADDR to run"
                );
                return;
            }
        }
    }};
}

const EXPECTED_ROWS: u64 = 1_000_000;

async fn read_sequence(client: &Client) {
    let query = format!("SELECT number, number + 1 FROM system.numbers LIMIT {EXPECTED_ROWS}");
    let n = client
        .execute(&query, |rows| -> Result<u64, chclient::BoxError> {
            let mut i = 0;
            while rows.next_row() {
                let (a, b) = (rows.uint()?, rows.uint()?);
                if a != i || b != i + 1 {
                    return Err(format!("unexpected row {i}: ({a}, {b})").into());
                }
                i += 1;
            }
            Ok(i)
        })
        .await
        .expect("read sequence");

    assert_eq!(n, EXPECTED_ROWS);
}

#[tokio::test]
async fn one_million_rows() {
    let addr = maybe_skip_integration!();
    let client = Client::new(addr)
        .expect("create client")
        .with_timeout(Duration::from_secs(10));

    client.ping().await.expect("ping");
    read_sequence(&client).await;
}

#[tokio::test]
async fn one_million_rows_compressed() {
    let addr = maybe_skip_integration!();
    let client = Client::new(addr)
        .expect("create client")
        .with_compression(true)
        .with_timeout(Duration::from_secs(10));

    read_sequence(&client).await;
}

#[tokio::test]
async fn server_side_error() {
    let addr = maybe_skip_integration!();
    let client = Client::new(addr).expect("create client");

    let err = client
        .execute("SELECT * FROM table_that_does_not_exist", |rows| {
            rows.next_row();
            Ok::<_, RowError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Status { .. }), "{err:?}");
}
