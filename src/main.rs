use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use odm_share::ast::RuleSet;
use odm_share::compiler::TableQuery;
use odm_share::source::Connection;
use odm_share::{
    connect, generate, get_columns, get_counts, get_data, load_file, DataSource, TreeBuilder,
};

const DEBUG_FILENAME: &str = "debug.txt";

/// Extracts the rows of a data source that an ODM sharing schema allows each
/// organization to receive.
#[derive(Debug, StructOpt)]
#[structopt(name = "odm-share")]
struct Opt {
    /// Sharing schema file path
    #[structopt(parse(from_os_str))]
    schema: PathBuf,

    /// CSV files, a SQLite database file or a sqlite:// URL
    #[structopt(required = true)]
    inputs: Vec<String>,

    /// Tables of the CSV inputs, in order. Ex.: --tables=measures,samples
    #[structopt(long, use_delimiter = true)]
    tables: Vec<String>,

    /// Organizations to share with, defaults to all
    #[structopt(long, use_delimiter = true)]
    orgs: Vec<String>,

    /// Output directory
    #[structopt(long, default_value = "./", parse(from_os_str))]
    outdir: PathBuf,

    /// Write the selected columns and per-rule row counts to STDOUT and
    /// debug.txt instead of creating output files
    #[structopt(short, long)]
    debug: bool,

    /// Don't log
    #[structopt(short, long)]
    quiet: bool,

    /// Write output file paths to STDOUT, separated by newlines
    #[structopt(short, long)]
    list: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn data_sources(inputs: &[String], tables: &[String]) -> Result<Vec<DataSource>> {
    if tables.len() > inputs.len() {
        bail!(
            "got {} table names for {} inputs",
            tables.len(),
            inputs.len()
        );
    }
    Ok(inputs
        .iter()
        .enumerate()
        .map(|(i, path)| match tables.get(i) {
            Some(table) => DataSource::new(path).table(table),
            None => DataSource::new(path),
        })
        .collect())
}

fn output_path(outdir: &Path, schema_name: &str, org: &str, table: &str) -> PathBuf {
    outdir.join(format!("{}-{}-{}.csv", schema_name, org, table))
}

/// Pads every cell of a table to the width of its column.
fn tabulate(headers: &[&str], rows: &[Vec<String>]) -> String {
    let widths: Vec<usize> = (0..headers.len())
        .map(|i| {
            rows.iter()
                .map(|row| row[i].len())
                .chain([headers[i].len()])
                .max()
                .unwrap_or_default()
        })
        .collect();
    let line = |cells: &[&str]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{:<width$}", cell, width = width))
            .join("  ")
            .trim_end()
            .to_owned()
    };

    let rules: Vec<String> = widths.iter().map(|&width| "-".repeat(width)).collect();
    let mut lines = vec![line(headers), line(&rules.iter().map(String::as_str).collect_vec())];
    for row in rows {
        lines.push(line(&row.iter().map(String::as_str).collect_vec()));
    }
    lines.join("\n")
}

/// Writes the selected columns and the row count of every rule of a table
/// query as markdown.
fn write_report(
    out: &mut impl Write,
    conn: &Connection,
    rules: &RuleSet,
    org: &str,
    query: &TableQuery,
) -> Result<()> {
    writeln!(out, "# org '{}' - table '{}'\n", org, query.table)?;

    let (_, columns) = get_columns(conn, query)?;
    writeln!(out, "## columns\n")?;
    for column in columns {
        writeln!(out, "- {}", column)?;
    }
    writeln!(out)?;

    writeln!(out, "## counts\n")?;
    let rows: Vec<Vec<String>> = get_counts(conn, query)?
        .into_iter()
        .filter_map(|(id, count)| {
            let rule = rules.get(&id)?;
            Some(vec![
                count.to_string(),
                format!("{:>2}", id),
                rule.mode().to_string(),
                rule.describe(),
            ])
        })
        .collect();
    writeln!(out, "{}\n", tabulate(&["count", "id", "mode", "filter"], &rows))?;
    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    if !opt.quiet {
        init_logging();
    }

    let schema_name = opt
        .schema
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let schema_filename = opt
        .schema
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    info!("loading schema '{}'", schema_filename);
    let rules = load_file(&opt.schema)?;

    info!("connecting...");
    let sources = data_sources(&opt.inputs, &opt.tables)?;
    let conn = connect(&sources)?;

    let tree = TreeBuilder::new(&rules)
        .catalog(&conn)
        .orgs(opt.orgs.iter().cloned())
        .filename(schema_filename)
        .build()?;
    let queries = generate(&tree);

    std::fs::create_dir_all(&opt.outdir)
        .with_context(|| format!("failed to create {}", opt.outdir.display()))?;

    if opt.debug {
        let mut report = vec![];
        for (org, tables) in &queries {
            for query in tables.values() {
                write_report(&mut report, &conn, &rules, org, query)?;
            }
        }
        let path = opt.outdir.join(DEBUG_FILENAME);
        std::fs::write(&path, &report)
            .with_context(|| format!("failed to write {}", path.display()))?;
        print!("{}", String::from_utf8_lossy(&report));
        if opt.list {
            println!("{}", path.display());
        }
        return Ok(());
    }

    for (org, tables) in &queries {
        for (table, query) in tables {
            let frame = get_data(&conn, query)?;
            let path = output_path(&opt.outdir, &schema_name, org, table);
            info!("writing {}", path.display());
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            frame.write_csv(&mut writer)?;
            writer.flush()?;
            if opt.list {
                println!("{}", path.display());
            }
        }
    }
    info!("done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_sources() {
        let inputs = vec!["a.csv".to_owned(), "b.csv".to_owned()];
        let sources = data_sources(&inputs, &["measures".to_owned()]).unwrap();
        assert_eq!(
            sources,
            [DataSource::new("a.csv").table("measures"), DataSource::new("b.csv")]
        );
        assert!(data_sources(&inputs[..1], &["x".to_owned(), "y".to_owned()]).is_err());
    }

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Path::new("out"), "schema", "ohri", "measures"),
            Path::new("out").join("schema-ohri-measures.csv")
        );
    }

    #[test]
    fn test_tabulate() {
        let rows = vec![
            vec!["12".to_owned(), " 1".to_owned(), "select".to_owned(), String::new()],
            vec!["3".to_owned(), " 2".to_owned(), "filter".to_owned(), "x = (1)".to_owned()],
        ];
        assert_eq!(
            tabulate(&["count", "id", "mode", "filter"], &rows),
            "count  id  mode    filter\n\
             -----  --  ------  -------\n\
             12      1  select\n\
             3       2  filter  x = (1)"
        );
    }

    #[test]
    fn test_report() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(x INTEGER); INSERT INTO t VALUES (1), (2), (3);")
            .unwrap();
        let rules = odm_share::load(
            "ruleID,table,mode,key,operator,value\n\
             1,t,select,,,all\n\
             2,t,filter,x,>,1\n\
             3,,share,ohri,,1;2\n",
            "schema.csv",
        )
        .unwrap();
        let tree = TreeBuilder::new(&rules).catalog(&conn).build().unwrap();
        let queries = generate(&tree);

        let mut out = vec![];
        write_report(&mut out, &conn, &rules, "ohri", &queries["ohri"]["t"]).unwrap();
        let report = String::from_utf8(out).unwrap();
        assert!(report.starts_with("# org 'ohri' - table 't'\n\n## columns\n\n- x\n"));
        assert!(report.contains(" 1  select"), "{}", report);
        assert!(report.contains("2       2  filter  x > (1)"), "{}", report);
        assert!(report.contains("2       3  share"), "{}", report);
    }
}
