use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub type Identifier = String;
pub type TableName = Identifier;
pub type ColumnName = Identifier;
pub type Recipient = Identifier;

/// Wildcard token accepted for tables, columns and recipients.
pub const ALL: &str = "all";

/// Identifier of a rule, unique within a schema.
///
/// Numeric ids order numerically and before textual ids, so count reports
/// list rules in the order custodians usually number them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleId {
    Number(u64),
    Name(String),
}

impl FromStr for RuleId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty rule id".to_owned());
        }
        if let Ok(n) = s.parse::<u64>() {
            return Ok(RuleId::Number(n));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(format!("rule id {:?} contains whitespace", s));
        }
        Ok(RuleId::Name(s.to_owned()))
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleId::Number(n) => f.pad(&n.to_string()),
            RuleId::Name(s) => f.pad(s),
        }
    }
}

impl From<u64> for RuleId {
    fn from(n: u64) -> Self {
        RuleId::Number(n)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleMode {
    Select,
    Filter,
    Group,
    Share,
}

impl RuleMode {
    pub const ALL: [RuleMode; 4] = [
        RuleMode::Select,
        RuleMode::Filter,
        RuleMode::Group,
        RuleMode::Share,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RuleMode::Select => "select",
            RuleMode::Filter => "filter",
            RuleMode::Group => "group",
            RuleMode::Share => "share",
        }
    }
}

impl FromStr for RuleMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or(())
    }
}

impl fmt::Display for RuleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
        }
    }
}

impl FromStr for LogicalOp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" => Ok(LogicalOp::And),
            "OR" => Ok(LogicalOp::Or),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// How an `in` filter tests membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RangeKind {
    /// Inclusive `lo:hi` interval.
    Interval,
    /// Explicit `a;b;c` set.
    Set,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    In(RangeKind),
}

impl FilterOp {
    /// Tokens accepted in the operator column of a filter rule.
    pub const TOKENS: [&'static str; 6] = ["=", ">", ">=", "<", "<=", "in"];

    pub fn as_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::In(RangeKind::Interval) => "BETWEEN",
            FilterOp::In(RangeKind::Set) => "IN",
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            FilterOp::In(_) => "in",
            op => op.as_sql(),
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One element of a `;`-separated cell value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Item {
    Single(String),
    Range(String, String),
}

/// The tables a select or filter rule applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tables {
    /// The rule's mode doesn't take tables.
    None,
    All,
    Named(Vec<TableName>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Columns {
    All,
    /// Column names and `first:last` ranges, in rule order.
    Named(Vec<Item>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operands {
    Single(String),
    Interval(String, String),
    Set(Vec<String>),
}

impl Operands {
    pub fn values(&self) -> Vec<&str> {
        match self {
            Operands::Single(value) => vec![value],
            Operands::Interval(lo, hi) => vec![lo, hi],
            Operands::Set(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipients {
    All,
    Named(Vec<Recipient>),
}

/// The mode-specific part of a rule, validated at load time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleBody {
    Select {
        columns: Columns,
    },
    Filter {
        key: ColumnName,
        op: FilterOp,
        operands: Operands,
    },
    Group {
        op: LogicalOp,
        refs: Vec<RuleId>,
    },
    Share {
        recipients: Recipients,
        refs: Vec<RuleId>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub id: RuleId,
    /// Line of the rule document this rule was read from.
    pub line: usize,
    pub tables: Tables,
    pub body: RuleBody,
    pub notes: String,
}

impl Rule {
    pub fn mode(&self) -> RuleMode {
        match self.body {
            RuleBody::Select { .. } => RuleMode::Select,
            RuleBody::Filter { .. } => RuleMode::Filter,
            RuleBody::Group { .. } => RuleMode::Group,
            RuleBody::Share { .. } => RuleMode::Share,
        }
    }

    /// Short human-readable description used in audit reports.
    pub fn describe(&self) -> String {
        match &self.body {
            RuleBody::Select { .. } | RuleBody::Share { .. } => String::new(),
            RuleBody::Filter { key, op, operands } => {
                let values = match operands {
                    Operands::Interval(lo, hi) => format!("{}:{}", lo, hi),
                    operands => operands.values().join(";"),
                };
                format!("{} {} ({})", key, op, values)
            }
            RuleBody::Group { op, refs } => {
                let refs: Vec<String> = refs.iter().map(RuleId::to_string).collect();
                format!("{:3} ({})", op.as_sql(), refs.join(";"))
            }
        }
    }
}

/// Rules of a schema in document order, addressable by id.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    index: HashMap<RuleId, usize>,
}

impl RuleSet {
    /// Appends a rule, handing it back if its id is already taken.
    pub fn insert(&mut self, rule: Rule) -> Result<(), Rule> {
        if self.index.contains_key(&rule.id) {
            return Err(rule);
        }
        self.index.insert(rule.id.clone(), self.rules.len());
        self.rules.push(rule);
        Ok(())
    }

    pub fn get(&self, id: &RuleId) -> Option<&Rule> {
        self.index.get(id).map(|&i| &self.rules[i])
    }

    /// Document position of a rule.
    pub fn position(&self, id: &RuleId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}
