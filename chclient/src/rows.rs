//! Row-by-row access to a tab-separated query result.
//!
//! ClickHouse's `TabSeparated` output has one row per `\n` terminated line and
//! `\t` between columns; both are escaped inside values, so no quoting is
//! involved. An empty line is a row with a single empty column. [`RowStream`]
//! adds the typed column accessors and keeps the first failure around so it can
//! be reported once the row handler has returned.

use std::{
    fmt,
    io::{self, BufRead, BufReader, Read},
    ops::Range,
    pin::Pin,
    str::FromStr,
};

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt, stream};
use tokio::time::Instant;
use tokio_util::{
    io::{StreamReader, SyncIoBridge},
    sync::CancellationToken,
};

/// Marker ClickHouse writes for `NULL` in `TabSeparated` output
const NULL: &[u8] = b"\\N";

const READ_BUFFER_CAPACITY: usize = 64 * 1024;

type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Error produced while reading rows from a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    #[error("cannot read row {row}: {message}")]
    Read { row: u64, message: String },

    #[error("no current row, `next_row` has not returned true")]
    NoRow,

    #[error("row {row} has no column {col}")]
    MissingColumn { row: u64, col: usize },

    #[error("row {row}, column {col}: cannot parse {value:?} as {ty}")]
    Parse {
        row: u64,
        col: usize,
        value: String,
        ty: &'static str,
    },
}

/// Blocking reader over the body of a successful query response.
///
/// Reads give up with an error once the query deadline passes or the query is
/// cancelled, so a handler stuck waiting on the network is released.
pub struct ResponseBody {
    inner: SyncIoBridge<StreamReader<BodyStream, Bytes>>,
}

impl ResponseBody {
    /// Must be called from within the tokio runtime that drives `resp`.
    pub(crate) fn new(
        resp: reqwest::Response,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Self {
        let stream = bounded_body(resp, deadline, cancel);
        Self {
            inner: SyncIoBridge::new(StreamReader::new(stream)),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody").finish_non_exhaustive()
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

fn bounded_body(
    resp: reqwest::Response,
    deadline: Instant,
    cancel: CancellationToken,
) -> BodyStream {
    let chunks: BodyStream = Box::pin(
        resp.bytes_stream()
            .map_err(|e| io::Error::other(e.without_url())),
    );

    // the state becomes `None` after the first error so the reader sees a clean EOF next
    Box::pin(stream::unfold(Some(chunks), move |state| {
        let cancel = cancel.clone();
        async move {
            let mut chunks = state?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Some((
                    Err(io::Error::other("query cancelled while reading the response")),
                    None,
                )),
                next = tokio::time::timeout_at(deadline, chunks.next()) => match next {
                    Ok(Some(item)) => Some((item, Some(chunks))),
                    Ok(None) => None,
                    Err(_) => Some((
                        Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "query deadline exceeded while reading the response",
                        )),
                        None,
                    )),
                },
            }
        }
    }))
}

/// Forward-only cursor over the rows of a `TabSeparated` result.
///
/// Columns of the current row are consumed left to right by the typed accessors.
///
/// # Example
/// ```
/// # use chclient::RowStream;
/// let mut rows = RowStream::new(&b"1\tfoo\n2\tbar\n"[..]);
/// let mut seen = vec![];
/// while rows.next_row() {
///     seen.push((rows.int()?, rows.string()?));
/// }
/// assert!(rows.error().is_none());
/// assert_eq!(seen, [(1, "foo".to_owned()), (2, "bar".to_owned())]);
/// # Ok::<(), chclient::RowError>(())
/// ```
#[derive(Debug)]
pub struct RowStream<R> {
    reader: BufReader<R>,
    /// Current line, without its terminating `\n`
    line: Vec<u8>,
    /// Byte ranges of the columns in `line`
    fields: Vec<Range<usize>>,
    on_row: bool,
    col: usize,
    rows: u64,
    err: Option<RowError>,
}

impl<R: Read> RowStream<R> {
    pub fn new(rdr: R) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_CAPACITY, rdr),
            line: Vec::new(),
            fields: Vec::new(),
            on_row: false,
            col: 0,
            rows: 0,
            err: None,
        }
    }

    /// Advance to the next row.
    ///
    /// Returns `false` at the end of the result and after any error, in which case
    /// [`error`][Self::error] tells them apart.
    pub fn next_row(&mut self) -> bool {
        self.on_row = false;
        if self.err.is_some() {
            return false;
        }
        self.line.clear();
        match self.reader.read_until(b'\n', &mut self.line) {
            Ok(0) => false,
            Ok(_) => {
                if self.line.last() == Some(&b'\n') {
                    self.line.pop();
                }
                self.split_fields();
                self.rows += 1;
                self.col = 0;
                self.on_row = true;
                true
            }
            Err(e) => {
                self.err = Some(RowError::Read {
                    row: self.rows + 1,
                    message: e.to_string(),
                });
                false
            }
        }
    }

    /// Whether the current row has columns left to read
    pub fn has_cols(&self) -> bool {
        self.on_row && self.col < self.fields.len()
    }

    /// Whether the next column holds `NULL`. Does not consume it.
    pub fn is_null(&self) -> bool {
        self.has_cols() && &self.line[self.fields[self.col].clone()] == NULL
    }

    pub fn int(&mut self) -> Result<i64, RowError> {
        self.parse("int")
    }

    pub fn uint(&mut self) -> Result<u64, RowError> {
        self.parse("uint")
    }

    pub fn float(&mut self) -> Result<f64, RowError> {
        self.parse("float")
    }

    /// Read the next column as text, undoing the `TabSeparated` escaping.
    pub fn string(&mut self) -> Result<String, RowError> {
        let (row, col) = (self.rows, self.col + 1);
        let value = unescape(self.next_field()?);
        match String::from_utf8(value) {
            Ok(s) => Ok(s),
            Err(e) => {
                let value = String::from_utf8_lossy(e.as_bytes()).into_owned();
                Err(self.fail(RowError::Parse {
                    row,
                    col,
                    value,
                    ty: "string",
                }))
            }
        }
    }

    /// Raw bytes of the next column, still escaped.
    pub fn bytes(&mut self) -> Result<&[u8], RowError> {
        self.next_field()
    }

    pub fn skip_col(&mut self) -> Result<(), RowError> {
        self.next_field().map(|_| ())
    }

    /// First error met while reading, if any.
    ///
    /// Check this once [`next_row`][Self::next_row] returns `false`.
    pub fn error(&self) -> Option<&RowError> {
        self.err.as_ref()
    }

    /// Number of rows read so far
    pub fn rows_read(&self) -> u64 {
        self.rows
    }

    pub(crate) fn into_error(self) -> Option<RowError> {
        self.err
    }

    fn parse<T: FromStr>(&mut self, ty: &'static str) -> Result<T, RowError> {
        let (row, col) = (self.rows, self.col + 1);
        let raw = self.next_field()?;
        match std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok()) {
            Some(v) => Ok(v),
            None => {
                let value = String::from_utf8_lossy(raw).into_owned();
                Err(self.fail(RowError::Parse {
                    row,
                    col,
                    value,
                    ty,
                }))
            }
        }
    }

    fn next_field(&mut self) -> Result<&[u8], RowError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if !self.on_row {
            return Err(self.fail(RowError::NoRow));
        }
        let col = self.col;
        if col >= self.fields.len() {
            return Err(self.fail(RowError::MissingColumn {
                row: self.rows,
                col: col + 1,
            }));
        }
        self.col += 1;
        Ok(&self.line[self.fields[col].clone()])
    }

    fn split_fields(&mut self) {
        self.fields.clear();
        let mut start = 0;
        for (i, &b) in self.line.iter().enumerate() {
            if b == b'\t' {
                self.fields.push(start..i);
                start = i + 1;
            }
        }
        self.fields.push(start..self.line.len());
    }

    fn fail(&mut self, err: RowError) -> RowError {
        self.on_row = false;
        self.err.get_or_insert(err).clone()
    }
}

fn unescape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter().copied();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'r') => out.push(b'\r'),
            Some(b'0') => out.push(0),
            Some(b'b') => out.push(0x08),
            Some(b'f') => out.push(0x0c),
            Some(other) => out.push(other),
            None => out.push(b'\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn rows(data: &'static str) -> RowStream<&'static [u8]> {
        RowStream::new(data.as_bytes())
    }

    #[test]
    fn reads_typed_columns() {
        let mut r = rows("0\t1\t-5\t2.5\thello\n1\t2\t-6\t3.5\tworld\n");
        let mut got = vec![];
        while r.next_row() {
            got.push((
                r.uint().unwrap(),
                r.uint().unwrap(),
                r.int().unwrap(),
                r.float().unwrap(),
                r.string().unwrap(),
            ));
            assert!(!r.has_cols());
        }

        assert_eq!(r.error(), None);
        assert_eq!(r.rows_read(), 2);
        assert_eq!(
            got,
            [
                (0, 1, -5, 2.5, "hello".to_owned()),
                (1, 2, -6, 3.5, "world".to_owned())
            ]
        );
    }

    #[test]
    fn unescapes_strings() {
        let mut r = rows("a\\tb\\nc\\\\d\\'e\t\\N\n");
        assert!(r.next_row());
        assert_eq!(r.string().unwrap(), "a\tb\nc\\d'e");
        assert!(r.is_null());
        assert_eq!(r.bytes().unwrap(), b"\\N");
        assert!(!r.next_row());
        assert_eq!(r.error(), None);
    }

    #[test]
    fn parse_failure_is_sticky() {
        let mut r = rows("1\tnope\n2\t3\n");
        assert!(r.next_row());
        assert_eq!(r.int().unwrap(), 1);

        let err = r.int().unwrap_err();
        assert_eq!(
            err,
            RowError::Parse {
                row: 1,
                col: 2,
                value: "nope".to_owned(),
                ty: "int"
            }
        );
        assert!(!r.next_row(), "no rows after an error");
        assert_eq!(r.error(), Some(&err));
        assert_eq!(r.into_error(), Some(err));
    }

    #[test]
    fn missing_column() {
        let mut r = rows("1\n");
        assert!(r.next_row());
        r.skip_col().unwrap();
        assert_eq!(
            r.int().unwrap_err(),
            RowError::MissingColumn { row: 1, col: 2 }
        );
    }

    #[test]
    fn accessor_before_next_row() {
        let mut r = rows("1\n");
        assert_eq!(r.int().unwrap_err(), RowError::NoRow);
        assert!(!r.next_row());
    }

    #[test]
    fn read_error_is_reported() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("connection reset"))
            }
        }

        let mut r = RowStream::new(Broken);
        assert!(!r.next_row());
        match r.error() {
            Some(RowError::Read { row: 1, message }) => {
                assert!(message.contains("connection reset"), "{message}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_lines_are_rows() {
        let mut r = rows("\n\n\n");
        let mut seen = vec![];
        while r.next_row() {
            seen.push(r.string().unwrap());
            assert!(!r.has_cols());
        }
        assert_eq!(r.error(), None);
        assert_eq!(r.rows_read(), 3);
        assert_eq!(seen, ["", "", ""]);

        let mut r = rows("a\n\nb\n");
        let mut seen = vec![];
        while r.next_row() {
            seen.push(r.string().unwrap());
        }
        assert_eq!(seen, ["a", "", "b"]);
    }

    #[test]
    fn empty_columns_and_unterminated_last_line() {
        let mut r = rows("\t1\t\n2\t\t3");
        let mut seen = vec![];
        while r.next_row() {
            let mut row = vec![];
            while r.has_cols() {
                row.push(r.string().unwrap());
            }
            seen.push(row);
        }
        assert_eq!(r.error(), None);
        assert_eq!(seen, [["", "1", ""], ["2", "", "3"]]);
    }

    #[test]
    fn rows_of_varying_width() {
        let mut r = rows("1\t2\t3\n4\n");
        let mut widths = vec![];
        while r.next_row() {
            let mut n = 0;
            while r.has_cols() {
                r.skip_col().unwrap();
                n += 1;
            }
            widths.push(n);
        }
        assert_eq!(r.error(), None);
        assert_eq!(widths, [3, 1]);
    }
}
