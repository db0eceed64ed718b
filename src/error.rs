use std::fmt;

use itertools::Itertools;

use crate::ast::{RuleId, TableName};

/// Where in the rule document an error originates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: Option<usize>,
    pub rule_id: Option<RuleId>,
    pub column: Option<&'static str>,
}

impl Location {
    pub fn file(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_rule(mut self, rule_id: RuleId) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    pub fn with_column(mut self, column: &'static str) -> Self {
        self.column = Some(column);
        self
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file)?;
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "({},{})", line, column)?,
            (Some(line), None) => write!(f, "({})", line)?,
            (None, Some(column)) => write!(f, "({})", column)?,
            (None, None) => {}
        }
        if let Some(rule_id) = &self.rule_id {
            write!(f, " rule {}", rule_id)?;
        }
        Ok(())
    }
}

/// Structural problem in a rule document.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{location}: {kind}")]
pub struct SchemaError {
    pub location: Location,
    pub kind: SchemaErrorKind,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchemaErrorKind {
    #[error("malformed document: {0}")]
    Syntax(String),
    #[error("missing headers: {}", .0.join(", "))]
    MissingHeaders(Vec<&'static str>),
    #[error("expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },
    #[error("invalid rule id: {0}")]
    InvalidId(String),
    #[error("duplicate rule id, first defined on line {first_line}")]
    DuplicateId { first_line: usize },
    #[error("got '{0}', expected {{select, filter, group, share}}")]
    InvalidMode(String),
    #[error("got '{got}', expected {{{}}}", .expected.join(", "))]
    InvalidOperator {
        got: String,
        expected: Vec<&'static str>,
    },
    #[error("{column} required for modes {{{}}}", .modes.join(", "))]
    Required {
        column: &'static str,
        modes: Vec<&'static str>,
    },
    #[error("{0}")]
    InvalidValue(String),
}

/// A rule references a rule id that isn't defined before it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{location}: {}", describe_reference(.missing, .defined_later_on))]
pub struct ReferenceError {
    pub location: Location,
    pub missing: RuleId,
    /// Line of the missing rule when it exists further down the document.
    pub defined_later_on: Option<usize>,
}

fn describe_reference(missing: &RuleId, defined_later_on: &Option<usize>) -> String {
    match defined_later_on {
        Some(line) => format!(
            "rule {} is referenced before its definition on line {}. \
             Hint: rules must be declared before they are referenced",
            missing, line
        ),
        None => format!("missing rule {}", missing),
    }
}

/// The rules are individually valid but can't be combined into a tree.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{location}: {message}")]
pub struct CompileError {
    pub location: Location,
    pub message: String,
}

impl CompileError {
    pub(crate) fn with_column(mut self, column: &'static str) -> Self {
        self.location.column = Some(column);
        self
    }
}

/// A filter literal doesn't fit the declared type of its column.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{location}: value '{value}' of column '{table}.{column}' is not a valid {expected}")]
pub struct ValueError {
    pub location: Location,
    pub table: TableName,
    pub column: String,
    pub value: String,
    pub expected: crate::source::ColumnType,
}

/// Failure to reach or read a data source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{path}: {message}")]
    Csv { path: String, message: String },
    #[error("unsupported data source '{0}'")]
    Unsupported(String),
    #[error("table '{0}' is missing from input")]
    MissingTable(TableName),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{}", .0.iter().join("\n"))]
    Schema(Vec<SchemaError>),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

impl From<SchemaError> for Error {
    fn from(error: SchemaError) -> Self {
        Error::Schema(vec![error])
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
