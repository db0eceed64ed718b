//! Loading of sharing schemas.
//!
//! A schema is a CSV document with one rule per row. Rows are validated
//! independently so that every problem in the document is reported in one
//! pass.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::ast::{
    Columns, FilterOp, Item, LogicalOp, Operands, RangeKind, Recipients, Rule, RuleBody, RuleId,
    RuleMode, RuleSet, Tables, ALL,
};
use crate::error::{Error, Location, Result, SchemaError, SchemaErrorKind, SourceError};
use crate::parser::{parse_list, parse_records, unquote};

pub const RULE_ID: &str = "ruleID";
pub const TABLE: &str = "table";
pub const MODE: &str = "mode";
pub const KEY: &str = "key";
pub const OPERATOR: &str = "operator";
pub const VALUE: &str = "value";
pub const NOTES: &str = "notes";

const REQUIRED_HEADERS: [&str; 6] = [RULE_ID, TABLE, MODE, KEY, OPERATOR, VALUE];

/// Reads and loads the schema at `path`.
pub fn load_file(path: impl AsRef<Path>) -> Result<RuleSet> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(SourceError::from)?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    load(&text, &filename)
}

/// Parses schema text into rules, in document order.
///
/// `filename` is only used to give errors context.
pub fn load(text: &str, filename: &str) -> Result<RuleSet> {
    let file = Location::file(filename);
    let records = parse_records(text).map_err(|message| SchemaError {
        location: file.clone(),
        kind: SchemaErrorKind::Syntax(message),
    })?;

    let mut records = records.into_iter();
    let header = match records.next() {
        Some(header) => header,
        None => {
            return Err(SchemaError {
                location: file,
                kind: SchemaErrorKind::MissingHeaders(REQUIRED_HEADERS.to_vec()),
            }
            .into())
        }
    };
    let columns: HashMap<&str, usize> = header
        .fields
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    // rows can't be interpreted without all headers, so loading stops here
    let missing: Vec<&'static str> = REQUIRED_HEADERS
        .iter()
        .copied()
        .filter(|name| !columns.contains_key(name))
        .collect();
    if !missing.is_empty() {
        return Err(SchemaError {
            location: file.with_line(header.line),
            kind: SchemaErrorKind::MissingHeaders(missing),
        }
        .into());
    }

    let mut rules = RuleSet::default();
    let mut errors = vec![];
    for record in records {
        let location = file.clone().with_line(record.line);
        if record.fields.len() > header.fields.len() {
            errors.push(SchemaError {
                location,
                kind: SchemaErrorKind::FieldCount {
                    expected: header.fields.len(),
                    actual: record.fields.len(),
                },
            });
            continue;
        }

        let row = Row {
            fields: &record.fields,
            columns: &columns,
        };
        match parse_rule(&location, &row) {
            Ok(rule) => {
                debug!(rule = %rule.id, mode = %rule.mode(), line = rule.line, "loaded rule");
                if let Err(rule) = rules.insert(rule) {
                    let first_line = rules.get(&rule.id).map_or(0, |first| first.line);
                    errors.push(SchemaError {
                        location: location.with_rule(rule.id).with_column(RULE_ID),
                        kind: SchemaErrorKind::DuplicateId { first_line },
                    });
                }
            }
            Err(row_errors) => errors.extend(row_errors),
        }
    }

    if errors.is_empty() {
        Ok(rules)
    } else {
        Err(Error::Schema(errors))
    }
}

struct Row<'a> {
    fields: &'a [String],
    columns: &'a HashMap<&'a str, usize>,
}

impl Row<'_> {
    fn get(&self, column: &str) -> &str {
        self.columns
            .get(column)
            .and_then(|&i| self.fields.get(i))
            .map_or("", String::as_str)
    }
}

/// Collects the errors of a single row.
struct RowErrors<'a> {
    location: &'a Location,
    errors: Vec<SchemaError>,
}

impl RowErrors<'_> {
    fn push(&mut self, column: &'static str, kind: SchemaErrorKind) {
        self.errors.push(SchemaError {
            location: self.location.clone().with_column(column),
            kind,
        });
    }

    fn invalid(&mut self, column: &'static str, message: impl Into<String>) {
        self.push(column, SchemaErrorKind::InvalidValue(message.into()));
    }
}

fn required_modes(column: &str) -> &'static [RuleMode] {
    match column {
        TABLE => &[RuleMode::Select, RuleMode::Filter],
        KEY => &[RuleMode::Filter, RuleMode::Share],
        OPERATOR => &[RuleMode::Filter, RuleMode::Group],
        VALUE => &RuleMode::ALL,
        _ => &[],
    }
}

fn parse_rule(location: &Location, row: &Row) -> Result<Rule, Vec<SchemaError>> {
    let mut errors = RowErrors {
        location,
        errors: vec![],
    };

    let id = match row.get(RULE_ID).parse::<RuleId>() {
        Ok(id) => Some(id),
        Err(message) => {
            errors.push(RULE_ID, SchemaErrorKind::InvalidId(message));
            None
        }
    };

    let mode_str = row.get(MODE);
    let mode = match mode_str.parse::<RuleMode>() {
        Ok(mode) => Some(mode),
        Err(()) => {
            errors.push(MODE, SchemaErrorKind::InvalidMode(mode_str.to_owned()));
            None
        }
    };

    let (id, mode) = match (id, mode) {
        (Some(id), Some(mode)) => (id, mode),
        _ => return Err(errors.errors),
    };
    let location = location.clone().with_rule(id.clone());
    let mut errors = RowErrors {
        location: &location,
        errors: errors.errors,
    };

    for column in [TABLE, KEY, OPERATOR, VALUE] {
        let modes = required_modes(column);
        if row.get(column).is_empty() && modes.contains(&mode) {
            errors.push(
                column,
                SchemaErrorKind::Required {
                    column,
                    modes: modes.iter().map(|mode| mode.as_str()).collect(),
                },
            );
        }
    }
    if !errors.errors.is_empty() {
        return Err(errors.errors);
    }

    let tables = parse_tables(&mut errors, mode, row.get(TABLE));
    let body = match mode {
        RuleMode::Select => parse_columns(&mut errors, row.get(VALUE))
            .map(|columns| RuleBody::Select { columns }),
        RuleMode::Filter => parse_filter(&mut errors, row),
        RuleMode::Group => parse_group(&mut errors, row),
        RuleMode::Share => parse_share(&mut errors, row),
    };

    match body {
        Some(body) if errors.errors.is_empty() => Ok(Rule {
            id,
            line: location.line.unwrap_or_default(),
            tables,
            body,
            notes: row.get(NOTES).to_owned(),
        }),
        _ => Err(errors.errors),
    }
}

/// Parses a list of plain values, rejecting ranges.
fn parse_names(errors: &mut RowErrors, column: &'static str, text: &str) -> Option<Vec<String>> {
    let items = match parse_list(text) {
        Ok(items) => items,
        Err(message) => {
            errors.push(column, SchemaErrorKind::Syntax(message));
            return None;
        }
    };
    let mut names = vec![];
    for item in items {
        match item {
            Item::Single(name) => names.push(name),
            Item::Range(lo, hi) => {
                errors.invalid(column, format!("unexpected range '{}:{}'", lo, hi));
                return None;
            }
        }
    }
    Some(names)
}

fn check_count(
    errors: &mut RowErrors,
    column: &'static str,
    values: &[impl Sized],
    min: usize,
    max: Option<usize>,
) -> bool {
    let n = values.len();
    let message = match max {
        Some(max) if min == max && n != min => format!("expected {} values, got {}", min, n),
        Some(max) if !(min..=max).contains(&n) => {
            format!("expected {}-{} values, got {}", min, max, n)
        }
        None if n < min => format!("expected at least {} values, got {}", min, n),
        _ => return true,
    };
    errors.invalid(column, message);
    false
}

fn parse_tables(errors: &mut RowErrors, mode: RuleMode, text: &str) -> Tables {
    if text.is_empty() {
        return Tables::None;
    }
    if mode == RuleMode::Share {
        warn!(location = %errors.location, "ignoring table of share-rule");
        return Tables::None;
    }
    match parse_names(errors, TABLE, text) {
        Some(names) if names.iter().any(|name| name.eq_ignore_ascii_case(ALL)) => Tables::All,
        Some(names) if check_count(errors, TABLE, &names, 1, None) => Tables::Named(names),
        _ => Tables::None,
    }
}

fn parse_columns(errors: &mut RowErrors, text: &str) -> Option<Columns> {
    let items = match parse_list(text) {
        Ok(items) => items,
        Err(message) => {
            errors.push(VALUE, SchemaErrorKind::Syntax(message));
            return None;
        }
    };
    if !check_count(errors, VALUE, &items, 1, None) {
        return None;
    }
    let is_all = |item: &Item| matches!(item, Item::Single(s) if s.eq_ignore_ascii_case(ALL));
    if items.iter().any(is_all) {
        Some(Columns::All)
    } else {
        Some(Columns::Named(items))
    }
}

fn parse_filter(errors: &mut RowErrors, row: &Row) -> Option<RuleBody> {
    let key = parse_names(errors, KEY, row.get(KEY)).and_then(|mut keys| {
        if check_count(errors, KEY, &keys, 1, Some(1)) {
            keys.pop()
        } else {
            None
        }
    });

    let op_str = row.get(OPERATOR);
    let op = match op_str.to_ascii_lowercase().as_str() {
        "=" => Some(FilterOp::Eq),
        ">" => Some(FilterOp::Gt),
        ">=" => Some(FilterOp::Gte),
        "<" => Some(FilterOp::Lt),
        "<=" => Some(FilterOp::Lte),
        "in" => Some(FilterOp::In(RangeKind::Set)),
        _ => {
            errors.push(
                OPERATOR,
                SchemaErrorKind::InvalidOperator {
                    got: op_str.to_owned(),
                    expected: FilterOp::TOKENS.to_vec(),
                },
            );
            None
        }
    };

    let value = row.get(VALUE);
    let (op, operands) = match op? {
        FilterOp::In(_) => {
            let items = match parse_list(value) {
                Ok(items) => items,
                Err(message) => {
                    errors.push(VALUE, SchemaErrorKind::Syntax(message));
                    return None;
                }
            };
            match items.as_slice() {
                [Item::Range(lo, hi)] => (
                    FilterOp::In(RangeKind::Interval),
                    Operands::Interval(lo.clone(), hi.clone()),
                ),
                items if !items.is_empty() && items.iter().all(|i| matches!(i, Item::Single(_))) => {
                    let values = items
                        .iter()
                        .filter_map(|item| match item {
                            Item::Single(value) => Some(value.clone()),
                            Item::Range(..) => None,
                        })
                        .collect();
                    (FilterOp::In(RangeKind::Set), Operands::Set(values))
                }
                _ => {
                    errors.invalid(
                        VALUE,
                        "expected either a single 'lo:hi' range or a ';'-separated set",
                    );
                    return None;
                }
            }
        }
        op => (op, Operands::Single(unquote(value))),
    };

    Some(RuleBody::Filter {
        key: key?,
        op,
        operands,
    })
}

fn parse_refs(errors: &mut RowErrors, text: &str, min: usize) -> Option<Vec<RuleId>> {
    let names = parse_names(errors, VALUE, text)?;
    if !check_count(errors, VALUE, &names, min, None) {
        return None;
    }
    let mut refs = vec![];
    for name in names {
        match name.parse::<RuleId>() {
            Ok(id) => refs.push(id),
            Err(message) => {
                errors.invalid(VALUE, format!("invalid rule reference: {}", message));
                return None;
            }
        }
    }
    Some(refs)
}

fn parse_group(errors: &mut RowErrors, row: &Row) -> Option<RuleBody> {
    let op_str = row.get(OPERATOR);
    let op = op_str.parse::<LogicalOp>().ok();
    if op.is_none() {
        errors.push(
            OPERATOR,
            SchemaErrorKind::InvalidOperator {
                got: op_str.to_owned(),
                expected: vec!["AND", "OR"],
            },
        );
    }
    let refs = parse_refs(errors, row.get(VALUE), 2);
    Some(RuleBody::Group { op: op?, refs: refs? })
}

fn parse_share(errors: &mut RowErrors, row: &Row) -> Option<RuleBody> {
    let recipients = parse_names(errors, KEY, row.get(KEY)).and_then(|names| {
        if names.iter().any(|name| name.eq_ignore_ascii_case(ALL)) {
            Some(Recipients::All)
        } else if check_count(errors, KEY, &names, 1, None) {
            Some(Recipients::Named(names))
        } else {
            None
        }
    });
    let refs = parse_refs(errors, row.get(VALUE), 1);
    Some(RuleBody::Share {
        recipients: recipients?,
        refs: refs?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "ruleID,table,mode,key,operator,value,notes\n";

    fn load_rows(rows: &str) -> Result<RuleSet> {
        load(&format!("{}{}", HEADER, rows), "test.csv")
    }

    fn schema_errors(rows: &str) -> Vec<SchemaError> {
        match load_rows(rows) {
            Err(Error::Schema(errors)) => errors,
            other => panic!("expected schema errors, got {:?}", other),
        }
    }

    #[test]
    fn test_load_filter() {
        let rules = load_rows("1,mytable,filter,x,=,2,\n").unwrap();
        let rule = rules.get(&RuleId::Number(1)).unwrap();
        assert_eq!(rule.line, 2);
        assert_eq!(rule.tables, Tables::Named(vec!["mytable".to_owned()]));
        assert_eq!(
            rule.body,
            RuleBody::Filter {
                key: "x".to_owned(),
                op: FilterOp::Eq,
                operands: Operands::Single("2".to_owned()),
            }
        );
    }

    #[test]
    fn test_load_keeps_document_order() {
        let rules = load_rows(
            "10,measures,select,,,all,\n\
             2,measures,filter,measure,=,mPox,\n\
             x7,,share,ohri,,10;2,\n",
        )
        .unwrap();
        let ids: Vec<String> = rules.iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, ["10", "2", "x7"]);
    }

    #[test]
    fn test_load_in_interval_and_set() {
        let rules = load_rows(
            "1,t,filter,reportDate,in,2021-01-01:2021-12-31,\n\
             2,t,filter,saMaterial,IN,rawWW;sweSed,\n",
        )
        .unwrap();
        match &rules.get(&RuleId::Number(1)).unwrap().body {
            RuleBody::Filter { op, operands, .. } => {
                assert_eq!(*op, FilterOp::In(RangeKind::Interval));
                assert_eq!(
                    *operands,
                    Operands::Interval("2021-01-01".to_owned(), "2021-12-31".to_owned())
                );
            }
            body => panic!("unexpected body {:?}", body),
        }
        match &rules.get(&RuleId::Number(2)).unwrap().body {
            RuleBody::Filter { op, operands, .. } => {
                assert_eq!(*op, FilterOp::In(RangeKind::Set));
                assert_eq!(
                    *operands,
                    Operands::Set(vec!["rawWW".to_owned(), "sweSed".to_owned()])
                );
            }
            body => panic!("unexpected body {:?}", body),
        }
    }

    #[test]
    fn test_load_select_all_and_tables_all() {
        let rules = load_rows("1,all,select,,,ALL,\n").unwrap();
        let rule = rules.get(&RuleId::Number(1)).unwrap();
        assert_eq!(rule.tables, Tables::All);
        assert_eq!(rule.body, RuleBody::Select { columns: Columns::All });
    }

    #[test]
    fn test_missing_operator_does_not_abort_other_rules() {
        let errors = schema_errors(
            "1,t,select,,,all,\n\
             2,t,filter,x,,5,\n\
             3,t,filter,y,~,5,\n\
             4,,share,ohri,,1,\n",
        );
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].location.rule_id, Some(RuleId::Number(2)));
        assert_eq!(errors[0].location.column, Some(OPERATOR));
        assert_eq!(errors[0].location.line, Some(3));
        assert!(matches!(errors[0].kind, SchemaErrorKind::Required { .. }));
        assert_eq!(errors[1].location.rule_id, Some(RuleId::Number(3)));
        assert!(matches!(
            errors[1].kind,
            SchemaErrorKind::InvalidOperator { .. }
        ));
    }

    #[test]
    fn test_duplicate_id() {
        let errors = schema_errors("1,t,select,,,all,\n1,t,select,,,a,\n");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, SchemaErrorKind::DuplicateId { first_line: 2 });
        assert_eq!(errors[0].location.line, Some(3));
    }

    #[test]
    fn test_invalid_mode_and_id() {
        let errors = schema_errors("1,t,project,,,all,\nfoo bar,t,select,,,all,\n");
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[0].kind,
            SchemaErrorKind::InvalidMode("project".to_owned())
        );
        assert_eq!(errors[0].location.column, Some(MODE));
        assert!(matches!(errors[1].kind, SchemaErrorKind::InvalidId(_)));
    }

    #[test]
    fn test_group_operator_and_arity() {
        let errors = schema_errors("1,,group,,XOR,2,\n");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].location.column, Some(OPERATOR));
        assert_eq!(errors[1].location.column, Some(VALUE));
        assert_eq!(
            errors[1].kind,
            SchemaErrorKind::InvalidValue("expected at least 2 values, got 1".to_owned())
        );
    }

    #[test]
    fn test_missing_headers() {
        let errors = match load("ruleID,table,mode\n1,t,select\n", "s.csv") {
            Err(Error::Schema(errors)) => errors,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            errors[0].kind,
            SchemaErrorKind::MissingHeaders(vec![KEY, OPERATOR, VALUE])
        );
    }

    #[test]
    fn test_notes_column_is_optional_and_kept() {
        let rules = load("ruleID,table,mode,key,operator,value\n1,t,select,,,all\n", "s.csv")
            .unwrap();
        assert_eq!(rules.len(), 1);
        let rules = load_rows("1,t,select,,,all,\"shared, weekly\"\n").unwrap();
        assert_eq!(rules.get(&RuleId::Number(1)).unwrap().notes, "shared, weekly");
    }

    #[test]
    fn test_filter_value_keeps_quoted_separators() {
        let rules = load_rows("1,t,filter,site,=,\"a;b\",\n").unwrap();
        match &rules.get(&RuleId::Number(1)).unwrap().body {
            RuleBody::Filter { operands, .. } => {
                assert_eq!(*operands, Operands::Single("a;b".to_owned()))
            }
            body => panic!("unexpected body {:?}", body),
        }
    }
}
