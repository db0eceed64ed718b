use std::borrow::BorrowMut;

use pest::Parser as _;
use pest_derive::Parser;

use crate::ast::Item;

#[derive(Parser)]
#[grammar = "schema.pest"]
struct Parser;

type Pair<'a> = pest::iterators::Pair<'a, Rule>;
type Pairs<'a> = pest::iterators::Pairs<'a, Rule>;

/// A CSV record with the line it starts on (1-based).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub line: usize,
    pub fields: Vec<String>,
}

/// Splits CSV text into records. Blank lines are skipped, fields are
/// trimmed and double-quoted fields are unescaped.
pub fn parse_records(text: &str) -> Result<Vec<Record>, String> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let file = Parser::parse(Rule::file, text)
        .map_err(|e| e.to_string())?
        .next()
        .unwrap();

    Ok(file
        .into_inner()
        .take_while(|pair| pair.as_rule() != Rule::EOI)
        .map(Record::from)
        .filter(|record| !(record.fields.len() == 1 && record.fields[0].is_empty()))
        .collect())
}

/// Splits a `;`-separated cell value into items. Empty items are dropped,
/// `a:b` becomes a range and quoted tokens may contain separators.
pub fn parse_list(text: &str) -> Result<Vec<Item>, String> {
    let list = Parser::parse(Rule::list, text)
        .map_err(|e| e.to_string())?
        .next()
        .unwrap();

    Ok(list
        .into_inner()
        .take_while(|pair| pair.as_rule() != Rule::EOI)
        .map(Item::from)
        .filter(|item| !matches!(item, Item::Single(s) if s.is_empty()))
        .collect())
}

/// Strips the quotes off a fully quoted value, otherwise trims it.
pub fn unquote(text: &str) -> String {
    let text = text.trim();
    match text.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(interior) if !interior.is_empty() || text.len() == 2 => interior.replace("\"\"", "\""),
        _ => text.to_owned(),
    }
}

fn expect_next_rule<'a, P: BorrowMut<Pairs<'a>>>(mut pairs: P, rule: Rule) -> Pair<'a> {
    let pair = pairs.borrow_mut().next().expect("missing pair");
    assert_eq!(pair.as_rule(), rule);
    pair
}

fn convert_quoted(pair: Pair) -> String {
    let interior = expect_next_rule(pair.into_inner(), Rule::quoted_interior);
    interior.as_str().replace("\"\"", "\"")
}

fn convert_token(pair: Pair) -> String {
    assert_eq!(pair.as_rule(), Rule::token);
    let pair = pair.into_inner().next().unwrap();
    match pair.as_rule() {
        Rule::quoted_token => convert_quoted(pair),
        Rule::bare_token => pair.as_str().trim().to_owned(),
        _ => unreachable!(),
    }
}

impl From<Pair<'_>> for Record {
    fn from(pair: Pair<'_>) -> Self {
        assert_eq!(pair.as_rule(), Rule::record);
        let line = pair.as_span().start_pos().line_col().0;
        let fields = pair
            .into_inner()
            .map(|field| {
                let pair = field.into_inner().next().unwrap();
                match pair.as_rule() {
                    Rule::quoted_field => convert_quoted(pair),
                    Rule::bare_field => pair.as_str().trim().to_owned(),
                    _ => unreachable!(),
                }
            })
            .collect();

        Self { line, fields }
    }
}

impl From<Pair<'_>> for Item {
    fn from(pair: Pair<'_>) -> Self {
        assert_eq!(pair.as_rule(), Rule::item);
        let pair = pair.into_inner().next().unwrap();

        match pair.as_rule() {
            Rule::range => {
                let mut pairs = pair.into_inner();
                let lo = convert_token(expect_next_rule(&mut pairs, Rule::token));
                let hi = convert_token(expect_next_rule(&mut pairs, Rule::token));
                Item::Range(lo, hi)
            }

            Rule::token => Item::Single(convert_token(pair)),

            _ => unreachable!(),
        }
    }
}
