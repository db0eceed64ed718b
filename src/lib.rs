//! Compiles ODM data-sharing schemas into parameterized SQL.
//!
//! A schema is loaded into a [`RuleSet`](ast::RuleSet), compiled into a
//! per-recipient [`Tree`](tree::Tree) and turned into one
//! [`TableQuery`](compiler::TableQuery) per shared table.

pub mod ast;
pub mod compiler;
pub mod error;
pub mod parser;
pub mod rules;
pub mod source;
pub mod tree;

use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

pub use compiler::{generate, Query, RecipientQueries, SqlDialect, TableQuery};
pub use error::{Error, Result};
pub use rules::{load, load_file};
pub use source::{connect, get_columns, get_counts, get_data, Catalog, DataFrame, DataSource};
pub use tree::{build, Tree, TreeBuilder};

use ast::{Recipient, TableName};

/// Loads a schema file and generates the queries of every recipient in
/// `orgs`, or of every recipient when `orgs` is empty.
pub fn parse(
    schema_path: impl AsRef<Path>,
    orgs: &[Recipient],
    catalog: &dyn Catalog,
) -> Result<RecipientQueries> {
    let schema_path = schema_path.as_ref();
    let rules = load_file(schema_path)?;
    info!(path = %schema_path.display(), rules = rules.len(), "loaded schema");

    let filename = schema_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tree = TreeBuilder::new(&rules)
        .catalog(catalog)
        .orgs(orgs.iter().cloned())
        .filename(filename)
        .build()?;
    Ok(generate(&tree))
}

/// Runs a schema against the given inputs and returns the shared rows per
/// recipient and table.
pub fn extract(
    schema_path: impl AsRef<Path>,
    sources: &[DataSource],
    orgs: &[Recipient],
) -> Result<BTreeMap<Recipient, BTreeMap<TableName, DataFrame>>> {
    let conn = connect(sources)?;
    let queries = parse(schema_path, orgs, &conn)?;

    let mut result = BTreeMap::new();
    for (recipient, tables) in queries {
        let mut frames = BTreeMap::new();
        for (table, query) in tables {
            frames.insert(table, get_data(&conn, &query)?);
        }
        result.insert(recipient, frames);
    }
    Ok(result)
}
