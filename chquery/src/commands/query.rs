use std::io::{self, BufWriter, Write};

use chclient::{ResponseBody, RowStream};
use clap::Parser;
use tracing::info;

use super::common::ClickHouseConfig;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Client(#[from] chclient::Error),

    #[error(transparent)]
    Query(#[from] QueryError),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Parser)]
#[clap(visible_alias = "q", trailing_var_arg = true)]
pub(crate) struct Config {
    /// Common ClickHouse config
    #[clap(flatten)]
    clickhouse_config: ClickHouseConfig,

    /// Only count the rows of the result, do not print them
    #[clap(long = "count-only", default_value_t = false)]
    count_only: bool,

    /// The query string to execute
    query: Vec<String>,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let client = config.clickhouse_config.client()?;
    let query = parse_query(config.query)?;
    let count_only = config.count_only;

    let rows = client
        .execute(&query, move |rows| {
            if count_only {
                count_rows(rows)
            } else {
                print_rows(rows, BufWriter::new(io::stdout().lock()))
            }
        })
        .await?;
    info!(rows, "query finished");

    if count_only {
        println!("{rows}");
    }
    Ok(())
}

fn count_rows(rows: &mut RowStream<ResponseBody>) -> io::Result<u64> {
    while rows.next_row() {}
    Ok(rows.rows_read())
}

/// Write every row to `out` as it was received, tab separated
fn print_rows<R: io::Read, W: Write>(rows: &mut RowStream<R>, mut out: W) -> io::Result<u64> {
    while rows.next_row() {
        let mut first = true;
        while rows.has_cols() {
            if !first {
                out.write_all(b"\t")?;
            }
            first = false;
            // columns are always there while `has_cols` holds
            if let Ok(col) = rows.bytes() {
                out.write_all(col)?;
            }
        }
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(rows.rows_read())
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum QueryError {
    #[error("no query provided")]
    NoQuery,
}

/// Parse the user-inputted query string
fn parse_query(input: Vec<String>) -> Result<String> {
    let query = input.join(" ");
    if query.trim().is_empty() {
        Err(QueryError::NoQuery)?
    }
    Ok(query)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn prints_rows_verbatim() {
        let mut rows = RowStream::new(&b"1\ta\\tb\n2\t\\N\n3\n"[..]);
        let mut out = vec![];

        let n = print_rows(&mut rows, &mut out).unwrap();

        assert_eq!(n, 3);
        assert_eq!(String::from_utf8(out).unwrap(), "1\ta\\tb\n2\t\\N\n3\n");
    }

    #[test]
    fn empty_string_rows_are_printed() {
        let mut rows = RowStream::new(&b"a\n\nb\n"[..]);
        let mut out = vec![];

        let n = print_rows(&mut rows, &mut out).unwrap();

        assert_eq!(n, 3);
        assert_eq!(String::from_utf8(out).unwrap(), "a\n\nb\n");
    }

    #[test]
    fn query_words_are_joined() {
        let query = parse_query(vec!["SELECT".into(), "1".into()]).unwrap();
        assert_eq!(query, "SELECT 1");

        assert!(matches!(
            parse_query(vec![]),
            Err(Error::Query(QueryError::NoQuery))
        ));
    }
}
