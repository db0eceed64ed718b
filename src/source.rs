//! Data sources the generated queries run against.
//!
//! Every input ends up behind a SQLite connection: database files are opened
//! directly, CSV files are loaded into an in-memory database with one table
//! per file.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use itertools::Itertools;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, OptionalExtension};
use tracing::{debug, info, warn};

pub use rusqlite::Connection;

use crate::ast::{ColumnName, RuleId, TableName};
use crate::compiler::{ident, SqlDialect, TableQuery};
use crate::error::SourceError;
use crate::parser::parse_records;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Boolean,
    Date,
    Text,
}

impl ColumnType {
    pub fn as_sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Text => "TEXT",
        }
    }

    /// Maps a declared SQL column type onto the closest known type.
    pub fn from_declared(declared: &str) -> Self {
        let declared = declared.to_ascii_uppercase();
        if declared.contains("BOOL") {
            ColumnType::Boolean
        } else if declared.contains("INT") {
            ColumnType::Integer
        } else if ["REAL", "FLOA", "DOUB", "NUMERIC", "DECIMAL"]
            .iter()
            .any(|t| declared.contains(t))
        {
            ColumnType::Real
        } else if declared.contains("DATE") || declared.contains("TIME") {
            ColumnType::Date
        } else {
            ColumnType::Text
        }
    }

    /// The narrowest type every non-empty value parses as.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let values: Vec<&str> = values.into_iter().filter(|v| !v.is_empty()).collect();
        if values.is_empty() {
            return ColumnType::Text;
        }
        [
            ColumnType::Integer,
            ColumnType::Real,
            ColumnType::Boolean,
            ColumnType::Date,
        ]
        .into_iter()
        .find(|t| values.iter().all(|v| t.coerce(v).is_some()))
        .unwrap_or(ColumnType::Text)
    }

    /// Converts a filter literal into the text bound for this type, or
    /// `None` when it doesn't fit.
    pub fn coerce(self, value: &str) -> Option<String> {
        match self {
            ColumnType::Boolean => match value.to_ascii_lowercase().as_str() {
                "true" | "1" => Some("1".to_owned()),
                "false" | "0" => Some("0".to_owned()),
                _ => None,
            },
            ColumnType::Integer => value.parse::<i64>().ok().map(|_| value.to_owned()),
            ColumnType::Real => value.parse::<f64>().ok().map(|_| value.to_owned()),
            ColumnType::Date if is_iso_date(value) => Some(value.to_owned()),
            ColumnType::Date => None,
            ColumnType::Text => Some(value.to_owned()),
        }
    }

    fn to_value(self, text: &str) -> Value {
        if text.is_empty() {
            return Value::Null;
        }
        match self {
            ColumnType::Integer | ColumnType::Boolean => match self.coerce(text) {
                Some(n) => n.parse().map_or(Value::Text(text.to_owned()), Value::Integer),
                None => Value::Text(text.to_owned()),
            },
            ColumnType::Real => text
                .parse()
                .map_or(Value::Text(text.to_owned()), Value::Real),
            ColumnType::Date | ColumnType::Text => Value::Text(text.to_owned()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_sql().to_ascii_lowercase())
    }
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// A calendar date `YYYY-MM-DD`, optionally followed by a time part.
fn is_iso_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() < 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return false;
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
        || DATETIME_FORMATS
            .iter()
            .any(|format| NaiveDateTime::parse_from_str(value, format).is_ok())
        || DateTime::parse_from_rfc3339(value).is_ok()
}

/// Table and column metadata of a data source.
///
/// Every method may answer "unknown"; the tree builder then skips the
/// expansion or check that needs it.
pub trait Catalog {
    fn tables(&self) -> Vec<TableName> {
        vec![]
    }

    /// Columns of `table` in their canonical order.
    fn columns(&self, _table: &str) -> Option<Vec<ColumnName>> {
        None
    }

    fn column_type(&self, _table: &str, _column: &str) -> Option<ColumnType> {
        None
    }
}

pub struct NoCatalog;

impl Catalog for NoCatalog {}

/// A catalog described in code.
#[derive(Clone, Debug, Default)]
pub struct MemoryCatalog {
    tables: Vec<(TableName, Vec<(ColumnName, ColumnType)>)>,
}

impl MemoryCatalog {
    pub fn table<'a>(
        mut self,
        name: &str,
        columns: impl IntoIterator<Item = (&'a str, ColumnType)>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|(column, t)| (column.to_owned(), t))
            .collect();
        self.tables.push((name.to_owned(), columns));
        self
    }

    fn get(&self, table: &str) -> Option<&[(ColumnName, ColumnType)]> {
        self.tables
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, columns)| columns.as_slice())
    }
}

impl Catalog for MemoryCatalog {
    fn tables(&self) -> Vec<TableName> {
        self.tables.iter().map(|(name, _)| name.clone()).collect()
    }

    fn columns(&self, table: &str) -> Option<Vec<ColumnName>> {
        self.get(table)
            .map(|columns| columns.iter().map(|(name, _)| name.clone()).collect())
    }

    fn column_type(&self, table: &str, column: &str) -> Option<ColumnType> {
        self.get(table)?
            .iter()
            .find(|(name, _)| name == column)
            .map(|&(_, t)| t)
    }
}

impl Catalog for Connection {
    fn tables(&self) -> Vec<TableName> {
        let result = self
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                 ORDER BY rowid",
            )
            .and_then(|mut stmt| {
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>();
                names
            });
        result.unwrap_or_else(|e| {
            warn!("can't list tables: {}", e);
            vec![]
        })
    }

    fn columns(&self, table: &str) -> Option<Vec<ColumnName>> {
        let result = self
            .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
            .and_then(|mut stmt| {
                let names = stmt
                    .query_map(params![table], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>();
                names
            });
        match result {
            Ok(columns) if !columns.is_empty() => Some(columns),
            Ok(_) => None,
            Err(e) => {
                warn!(%table, "can't list columns: {}", e);
                None
            }
        }
    }

    fn column_type(&self, table: &str, column: &str) -> Option<ColumnType> {
        self.query_row(
            "SELECT type FROM pragma_table_info(?1) WHERE name = ?2",
            params![table, column],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .unwrap_or_else(|e| {
            warn!(%table, %column, "can't read column type: {}", e);
            None
        })
        .map(|declared| ColumnType::from_declared(&declared))
    }
}

/// An input file or URL, optionally with the table name it provides.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSource {
    pub path: String,
    pub table: Option<TableName>,
}

impl DataSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table: None,
        }
    }

    pub fn table(mut self, table: impl Into<TableName>) -> Self {
        self.table = Some(table.into());
        self
    }

    fn extension(&self) -> String {
        Path::new(&self.path)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    }

    fn database_path(&self) -> Option<&str> {
        if let Some(path) = self.path.strip_prefix("sqlite://") {
            return Some(path);
        }
        if self.path.contains("://") {
            return None;
        }
        matches!(self.extension().as_str(), "db" | "sqlite" | "sqlite3").then(|| self.path.as_str())
    }

    fn is_csv(&self) -> bool {
        !self.path.contains("://") && self.extension() == "csv"
    }

    /// The table a CSV file is loaded into: the given name or the file stem.
    fn table_name(&self) -> TableName {
        self.table.clone().unwrap_or_else(|| {
            Path::new(&self.path)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

/// Opens a connection over the inputs. A database is used as is and can't
/// be combined with other inputs; CSV files are loaded into a fresh
/// in-memory database.
pub fn connect(sources: &[DataSource]) -> Result<Connection, SourceError> {
    if let [source] = sources {
        if let Some(path) = source.database_path() {
            info!(%path, "opening database");
            return Ok(Connection::open(path)?);
        }
    }

    let conn = Connection::open_in_memory()?;
    for source in sources {
        if !source.is_csv() {
            return Err(SourceError::Unsupported(source.path.clone()));
        }
        load_csv(&conn, &source.table_name(), &source.path)?;
    }
    Ok(conn)
}

/// Loads a CSV file into a new table of `conn`, inferring column types.
pub fn load_csv(conn: &Connection, table: &str, path: &str) -> Result<(), SourceError> {
    let text = std::fs::read_to_string(path)?;
    let csv_error = |message: String| SourceError::Csv {
        path: path.to_owned(),
        message,
    };
    let mut records = parse_records(&text).map_err(csv_error)?.into_iter();
    let header = records
        .next()
        .ok_or_else(|| csv_error("missing header".to_owned()))?;
    let width = header.fields.len();

    let mut rows = vec![];
    for record in records {
        if record.fields.len() > width {
            return Err(csv_error(format!(
                "line {}: expected {} fields, got {}",
                record.line,
                width,
                record.fields.len()
            )));
        }
        let mut fields = record.fields;
        fields.resize(width, String::new());
        rows.push(fields);
    }

    let types: Vec<ColumnType> = (0..width)
        .map(|i| ColumnType::infer(rows.iter().map(|row| row[i].as_str())))
        .collect();
    let definition = header
        .fields
        .iter()
        .zip(&types)
        .map(|(name, t)| format!("{} {}", ident(name), t.as_sql()))
        .join(", ");

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        &format!("CREATE TABLE {} ({})", ident(table), definition),
        [],
    )?;
    {
        let placeholders = vec!["?"; width].join(",");
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} VALUES ({})",
            ident(table),
            placeholders
        ))?;
        for row in &rows {
            stmt.execute(params_from_iter(
                row.iter().zip(&types).map(|(text, t)| t.to_value(text)),
            ))?;
        }
    }
    tx.commit()?;

    info!(%table, %path, rows = rows.len(), "loaded csv");
    Ok(())
}

fn check_table(conn: &Connection, table: &str) -> Result<(), SourceError> {
    match conn.columns(table) {
        Some(_) => Ok(()),
        None => Err(SourceError::MissingTable(table.to_owned())),
    }
}

/// Rows fetched by a data query, rendered as text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataFrame {
    pub columns: Vec<ColumnName>,
    pub rows: Vec<Vec<String>>,
}

impl DataFrame {
    pub fn write_csv(&self, mut out: impl Write) -> std::io::Result<()> {
        let line = |fields: &[String]| fields.iter().map(|field| csv_field(field)).join(",");
        writeln!(out, "{}", line(&self.columns))?;
        for row in &self.rows {
            writeln!(out, "{}", line(row))?;
        }
        Ok(())
    }
}

fn csv_field(field: &str) -> String {
    if field.contains(|c| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

/// Runs the data query of a table. Boolean columns come back as
/// `TRUE`/`FALSE` and NULL as an empty string.
pub fn get_data(conn: &Connection, query: &TableQuery) -> Result<DataFrame, SourceError> {
    check_table(conn, &query.table)?;
    let mut stmt = conn.prepare(&query.data_query.sql)?;
    let columns: Vec<ColumnName> = stmt.column_names().into_iter().map(String::from).collect();
    let booleans: Vec<bool> = columns
        .iter()
        .map(|column| conn.column_type(&query.table, column) == Some(ColumnType::Boolean))
        .collect();

    let mut rows = vec![];
    let mut result = stmt.query(params_from_iter(&query.data_query.args))?;
    while let Some(row) = result.next()? {
        let mut fields = Vec::with_capacity(columns.len());
        for (i, &boolean) in booleans.iter().enumerate() {
            let field = match row.get_ref(i)? {
                ValueRef::Null => String::new(),
                ValueRef::Integer(n) if boolean => if n != 0 { "TRUE" } else { "FALSE" }.to_owned(),
                ValueRef::Integer(n) => n.to_string(),
                ValueRef::Real(x) => x.to_string(),
                ValueRef::Text(s) | ValueRef::Blob(s) => String::from_utf8_lossy(s).into_owned(),
            };
            fields.push(field);
        }
        rows.push(fields);
    }

    debug!(table = %query.table, rows = rows.len(), "fetched data");
    Ok(DataFrame { columns, rows })
}

/// Counts the rows each rule of a table query lets through.
pub fn get_counts(
    conn: &Connection,
    query: &TableQuery,
) -> Result<BTreeMap<RuleId, u64>, SourceError> {
    check_table(conn, &query.table)?;
    let mut counts = BTreeMap::new();
    for (rule_id, count_query) in &query.count_queries {
        let count: i64 = conn.query_row(
            &count_query.sql,
            params_from_iter(&count_query.args),
            |row| row.get(0),
        )?;
        counts.insert(rule_id.clone(), count.max(0) as u64);
    }
    Ok(counts)
}

/// The output columns of a table query and the select rule they come from.
pub fn get_columns(
    conn: &Connection,
    query: &TableQuery,
) -> Result<(RuleId, Vec<ColumnName>), SourceError> {
    if !query.columns.is_empty() {
        return Ok((query.select_rule_id.clone(), query.columns.clone()));
    }
    check_table(conn, &query.table)?;
    let column_query = query.column_query(SqlDialect::Other);
    let stmt = conn.prepare(&column_query.sql)?;
    let columns = stmt.column_names().into_iter().map(String::from).collect();
    Ok((query.select_rule_id.clone(), columns))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &tempfile::TempDir, name: &str, text: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, text).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_iso_date() {
        assert!(is_iso_date("2021-01-31"));
        assert!(is_iso_date("2021-01-31T10:00:00"));
        assert!(is_iso_date("2021-01-31 10:00"));
        assert!(is_iso_date("2021-01-31T10:00:00.250"));
        assert!(is_iso_date("2021-01-31T10:00:00Z"));
        assert!(is_iso_date("2020-02-29"));
        assert!(!is_iso_date("2021-02-30"));
        assert!(!is_iso_date("2021-04-31"));
        assert!(!is_iso_date("2021-02-29"));
        assert!(!is_iso_date("2021-01-31T25:00"));
        assert!(!is_iso_date("2021-13-01"));
        assert!(!is_iso_date("2021-1-01"));
        assert!(!is_iso_date("2021-01-01x"));
        assert!(!is_iso_date("01/02/2021"));
        assert!(!is_iso_date(""));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(ColumnType::Boolean.coerce("TRUE"), Some("1".to_owned()));
        assert_eq!(ColumnType::Boolean.coerce("false"), Some("0".to_owned()));
        assert_eq!(ColumnType::Boolean.coerce("yes"), None);
        assert_eq!(ColumnType::Integer.coerce("-3"), Some("-3".to_owned()));
        assert_eq!(ColumnType::Integer.coerce("3.5"), None);
        assert_eq!(ColumnType::Real.coerce("3.5"), Some("3.5".to_owned()));
        assert_eq!(ColumnType::Text.coerce("anything"), Some("anything".to_owned()));
    }

    #[test]
    fn test_infer_and_declared() {
        assert_eq!(ColumnType::infer(["1", "", "2"]), ColumnType::Integer);
        assert_eq!(ColumnType::infer(["1", "2.5"]), ColumnType::Real);
        assert_eq!(ColumnType::infer(["TRUE", "false"]), ColumnType::Boolean);
        assert_eq!(ColumnType::infer(["2021-01-01"]), ColumnType::Date);
        assert_eq!(ColumnType::infer(["2021-01-01", "2021-02-30"]), ColumnType::Text);
        assert_eq!(ColumnType::infer(["a", "1"]), ColumnType::Text);
        assert_eq!(ColumnType::infer([""]), ColumnType::Text);

        assert_eq!(ColumnType::from_declared("BOOLEAN"), ColumnType::Boolean);
        assert_eq!(ColumnType::from_declared("bigint"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("DOUBLE"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("DATETIME"), ColumnType::Date);
        assert_eq!(ColumnType::from_declared(""), ColumnType::Text);
    }

    #[test]
    fn test_memory_catalog() {
        let catalog = MemoryCatalog::default()
            .table("a", [("x", ColumnType::Integer), ("y", ColumnType::Text)])
            .table("b", [("z", ColumnType::Date)]);
        assert_eq!(catalog.tables(), ["a", "b"]);
        assert_eq!(catalog.columns("a").unwrap(), ["x", "y"]);
        assert_eq!(catalog.column_type("a", "x"), Some(ColumnType::Integer));
        assert_eq!(catalog.column_type("a", "z"), None);
        assert_eq!(catalog.columns("c"), None);
    }

    #[test]
    fn test_connect_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "measures.csv",
            "measureID,value,reportable,reportDate,measure\n\
             1,2.5,TRUE,2021-01-01,mPox\n\
             2,,false,2021-02-01,\"cov, 19\"\n",
        );
        let conn = connect(&[DataSource::new(&path)]).unwrap();

        assert_eq!(conn.tables(), ["measures"]);
        assert_eq!(
            conn.columns("measures").unwrap(),
            ["measureID", "value", "reportable", "reportDate", "measure"]
        );
        let types: Vec<Option<ColumnType>> = ["measureID", "value", "reportable", "reportDate", "measure"]
            .iter()
            .map(|column| conn.column_type("measures", column))
            .collect();
        assert_eq!(
            types,
            [
                Some(ColumnType::Integer),
                Some(ColumnType::Real),
                Some(ColumnType::Boolean),
                Some(ColumnType::Date),
                Some(ColumnType::Text),
            ]
        );

        let nulls: i64 = conn
            .query_row("SELECT COUNT(*) FROM measures WHERE value IS NULL", [], |row| row.get(0))
            .unwrap();
        assert_eq!(nulls, 1);
    }

    #[test]
    fn test_connect_named_csv_tables() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(&dir, "one.csv", "x\n1\n");
        let b = write_file(&dir, "two.csv", "y\n2\n");
        let conn = connect(&[DataSource::new(&a).table("samples"), DataSource::new(&b)]).unwrap();
        assert_eq!(conn.tables(), ["samples", "two"]);
    }

    #[test]
    fn test_connect_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odm.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE sites(siteID TEXT);")
            .unwrap();
        let path = path.to_string_lossy().into_owned();

        let conn = connect(&[DataSource::new(&path)]).unwrap();
        assert_eq!(conn.tables(), ["sites"]);
        let conn = connect(&[DataSource::new(format!("sqlite://{}", path))]).unwrap();
        assert_eq!(conn.tables(), ["sites"]);
    }

    #[test]
    fn test_unsupported_sources() {
        for path in ["odm.xlsx", "postgresql://localhost/odm", "odm.json"] {
            match connect(&[DataSource::new(path)]) {
                Err(SourceError::Unsupported(p)) => assert_eq!(p, path),
                other => panic!("unexpected {:?}", other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_csv_with_extra_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "t.csv", "a,b\n1,2,3\n");
        assert!(matches!(
            connect(&[DataSource::new(&path)]),
            Err(SourceError::Csv { .. })
        ));
    }

    #[test]
    fn test_write_csv() {
        let frame = DataFrame {
            columns: vec!["a".to_owned(), "b".to_owned()],
            rows: vec![vec!["x, y".to_owned(), "say \"hi\"".to_owned()]],
        };
        let mut out = vec![];
        frame.write_csv(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "a,b\n\"x, y\",\"say \"\"hi\"\"\"\n"
        );
    }
}
