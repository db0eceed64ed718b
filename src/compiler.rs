use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::debug;

use crate::ast::{ColumnName, FilterOp, RangeKind, Recipient, RuleId, TableName};
use crate::tree::{NodeId, NodeKind, Tree};

/// SQL text with `?` placeholders and the values bound to them, in order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pub sql: String,
    pub args: Vec<String>,
}

/// Everything needed to extract and audit one table for one recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableQuery {
    pub table: TableName,
    /// Columns named by the select rule, empty when it selects all columns.
    pub columns: Vec<ColumnName>,
    pub data_query: Query,
    /// Row count per contributing rule: the select rule counts the whole
    /// table, each filter/group rule its own condition and the share rule
    /// the complete filter.
    pub count_queries: BTreeMap<RuleId, Query>,
    pub select_rule_id: RuleId,
    pub share_rule_id: RuleId,
    select_query: Query,
}

impl TableQuery {
    /// A query returning no rows but the output columns of the data query.
    pub fn column_query(&self, dialect: SqlDialect) -> Query {
        let sql = &self.select_query.sql;
        let sql = match dialect {
            SqlDialect::Mssql | SqlDialect::Sybase => {
                format!("SELECT TOP 0 {}", sql.strip_prefix("SELECT ").unwrap_or(sql))
            }
            SqlDialect::Other => format!("{} LIMIT 0", sql),
        };
        Query {
            sql,
            args: self.select_query.args.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlDialect {
    Mssql,
    Sybase,
    Other,
}

impl SqlDialect {
    /// Falls back to [`SqlDialect::Other`] for unknown names.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "mssql" => SqlDialect::Mssql,
            "sybase" => SqlDialect::Sybase,
            _ => SqlDialect::Other,
        }
    }
}

pub type RecipientQueries = BTreeMap<Recipient, BTreeMap<TableName, TableQuery>>;

/// A double-quoted SQL identifier. Embedded quotes are doubled, everything
/// else is kept as written.
pub fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Generates the queries of every table shared with every recipient.
pub fn generate(tree: &Tree) -> RecipientQueries {
    let mut result = RecipientQueries::new();
    for (share, share_node) in tree.shares() {
        let recipient = match &share_node.kind {
            NodeKind::Share { recipient } => recipient.clone(),
            kind => unreachable!("root child is a {} node", kind.name()),
        };
        let tables = result.entry(recipient).or_default();
        for (table, _) in tree.children(share) {
            let query = generate_table(tree, table);
            debug!(table = %query.table, sql = %query.data_query.sql, "generated query");
            tables.insert(query.table.clone(), query);
        }
    }
    result
}

/// Generates the queries of a single table node.
pub fn generate_table(tree: &Tree, table: NodeId) -> TableQuery {
    let (name, share_rule_id) = match &tree.node(table).kind {
        NodeKind::Table { name, share_rule } => (name.clone(), share_rule.clone()),
        kind => panic!("expected a table node, got a {} node", kind.name()),
    };

    let mut writer = SqlWriter {
        tree,
        args: vec![],
        partials: BTreeMap::new(),
        filter: Query::default(),
    };
    let sql = writer.write(table);
    let data_query = Query {
        sql,
        args: writer.args,
    };

    let (_, select) = tree.children(table).next().expect("table node without select");
    let select_rule_id = select.rule_id.clone().expect("select node without rule");
    let columns = select
        .children
        .iter()
        .filter_map(|&child| match &tree.node(child).kind {
            NodeKind::Literal { value } => Some(value.clone()),
            _ => None,
        })
        .collect();
    let select_query = writer
        .partials
        .remove(&select_rule_id)
        .unwrap_or_default();

    let count = |filter: &Query| {
        let mut sql = format!("SELECT COUNT(*) FROM {}", ident(&name));
        if !filter.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.sql);
        }
        Query {
            sql,
            args: filter.args.clone(),
        }
    };
    let mut count_queries: BTreeMap<RuleId, Query> = writer
        .partials
        .iter()
        .map(|(id, filter)| (id.clone(), count(filter)))
        .collect();
    count_queries.insert(select_rule_id.clone(), count(&Query::default()));
    count_queries.insert(share_rule_id.clone(), count(&writer.filter));

    TableQuery {
        table: name,
        columns,
        data_query,
        count_queries,
        select_rule_id,
        share_rule_id,
        select_query,
    }
}

/// Renders a table subtree, collecting bound arguments and the partial
/// condition of each rule along the way.
struct SqlWriter<'a> {
    tree: &'a Tree,
    args: Vec<String>,
    partials: BTreeMap<RuleId, Query>,
    /// The complete WHERE condition of the table, empty without filters.
    filter: Query,
}

impl SqlWriter<'_> {
    fn record(&mut self, id: NodeId, sql: &str, arg_start: usize) {
        if let Some(rule_id) = &self.tree.node(id).rule_id {
            self.partials.insert(
                rule_id.clone(),
                Query {
                    sql: sql.to_owned(),
                    args: self.args[arg_start..].to_vec(),
                },
            );
        }
    }

    fn literal(&mut self, id: NodeId) -> &'static str {
        match &self.tree.node(id).kind {
            NodeKind::Literal { value } => {
                self.args.push(value.clone());
                "?"
            }
            kind => unreachable!("expected a literal node, got a {} node", kind.name()),
        }
    }

    fn write(&mut self, id: NodeId) -> String {
        let tree = self.tree;
        let node = tree.node(id);
        let arg_start = self.args.len();

        match &node.kind {
            NodeKind::Table { name, .. } => {
                let select = self.write(node.children[0]);
                let mut sql = format!("SELECT {} FROM {}", select, ident(name));
                self.record(node.children[0], &sql, arg_start);
                if let Some(&filter) = node.children.get(1) {
                    let filter_args = self.args.len();
                    let condition = self.write(filter);
                    sql.push_str(" WHERE ");
                    sql.push_str(&condition);
                    self.filter = Query {
                        sql: condition,
                        args: self.args[filter_args..].to_vec(),
                    };
                }
                sql
            }

            NodeKind::Select { all: true } => "*".to_owned(),

            NodeKind::Select { all: false } => node
                .children
                .iter()
                .map(|&child| match &tree.node(child).kind {
                    NodeKind::Literal { value } => ident(value),
                    kind => unreachable!("select node with a {} child", kind.name()),
                })
                .join(","),

            NodeKind::Group { op } => {
                let sql = node
                    .children
                    .iter()
                    .map(|&child| self.write(child))
                    .collect::<Vec<_>>()
                    .into_iter()
                    .reduce(|lhs, rhs| format!("({} {} {})", lhs, op.as_sql(), rhs))
                    .unwrap_or_default();
                self.record(id, &sql, arg_start);
                sql
            }

            NodeKind::Filter { op } => {
                let field = match &tree.node(node.children[0]).kind {
                    NodeKind::Field { name } => ident(name),
                    kind => unreachable!("filter node starting with a {} node", kind.name()),
                };
                let operands = &node.children[1..];
                let sql = match op {
                    FilterOp::In(RangeKind::Interval) => {
                        let lo = self.literal(operands[0]);
                        let hi = self.literal(operands[1]);
                        format!("({} BETWEEN {} AND {})", field, lo, hi)
                    }
                    FilterOp::In(RangeKind::Set) => {
                        let values = operands.iter().map(|&o| self.literal(o)).join(",");
                        format!("({} IN ({}))", field, values)
                    }
                    op => {
                        let value = self.literal(operands[0]);
                        format!("({} {} {})", field, op.as_sql(), value)
                    }
                };
                self.record(id, &sql, arg_start);
                sql
            }

            kind => unreachable!("{} node inside a table subtree", kind.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::load;
    use crate::tree::build;

    const HEADER: &str = "ruleID,table,mode,key,operator,value,notes\n";

    fn queries(rows: &str) -> RecipientQueries {
        let rules = load(&format!("{}{}", HEADER, rows), "test.csv").unwrap();
        generate(&build(&rules).unwrap())
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_in_interval_and_gte() {
        let queries = queries(
            "11,measures,select,,,measure;value;unit;aggregation,\n\
             12,measures,filter,measure,=,mPox,\n\
             13,measures,filter,reportDate,in,2021-01-01:2021-12-31,\n\
             14,,group,,AND,12;13,\n\
             15,measures,filter,measure,=,cov,\n\
             16,measures,filter,reportDate,>=,2020-01-01,\n\
             17,,group,,AND,15;16,\n\
             18,,group,,OR,14;17,\n\
             19,,share,ohri,,11;18,\n",
        );
        let q = &queries["ohri"]["measures"];
        assert_eq!(
            q.data_query.sql,
            "SELECT \"measure\",\"value\",\"unit\",\"aggregation\" FROM \"measures\" \
             WHERE (((\"measure\" = ?) AND (\"reportDate\" BETWEEN ? AND ?)) \
             OR ((\"measure\" = ?) AND (\"reportDate\" >= ?)))"
        );
        assert_eq!(
            q.data_query.args,
            strings(&["mPox", "2021-01-01", "2021-12-31", "cov", "2020-01-01"])
        );
        assert_eq!(q.columns, strings(&["measure", "value", "unit", "aggregation"]));
        assert_eq!(q.select_rule_id, RuleId::Number(11));
    }

    #[test]
    fn test_mpox_example() {
        let queries = queries(
            "10,measures,select,,,all,\n\
             12,measures,filter,measure,=,mPox,\n\
             13,measures,filter,reportDate,in,2021-01-01:2021-12-31,\n\
             14,,group,,AND,12;13,\n\
             19,,share,ohri,,10;14,\n",
        );
        let q = &queries["ohri"]["measures"];
        assert_eq!(
            q.data_query.sql,
            "SELECT * FROM \"measures\" \
             WHERE ((\"measure\" = ?) AND (\"reportDate\" BETWEEN ? AND ?))"
        );
        assert_eq!(
            q.data_query.args,
            strings(&["mPox", "2021-01-01", "2021-12-31"])
        );
        assert!(q.columns.is_empty());
    }

    #[test]
    fn test_in_set() {
        let queries = queries(
            "1,samples,select,,,all,\n\
             2,samples,filter,saMaterial,in,rawWW;sweSed,\n\
             3,,share,PHAC,,1;2,\n",
        );
        let q = &queries["PHAC"]["samples"];
        assert_eq!(
            q.data_query.sql,
            "SELECT * FROM \"samples\" WHERE (\"saMaterial\" IN (?,?))"
        );
        assert_eq!(q.data_query.args, strings(&["rawWW", "sweSed"]));
    }

    #[test]
    fn test_no_filter_omits_where() {
        let queries = queries("1,t,select,,,all,\n2,,share,ohri,,1,\n");
        let q = &queries["ohri"]["t"];
        assert_eq!(q.data_query.sql, "SELECT * FROM \"t\"");
        assert!(q.data_query.args.is_empty());
        assert_eq!(q.count_queries[&RuleId::Number(2)].sql, "SELECT COUNT(*) FROM \"t\"");
    }

    #[test]
    fn test_rule_count_queries() {
        let queries = queries(
            "1,t,select,,,all,\n\
             2,t,filter,x,=,a,\n\
             3,t,filter,y,in,1;2,\n\
             4,,share,ohri,,1;2;3,\n",
        );
        let q = &queries["ohri"]["t"];
        let ids: Vec<RuleId> = q.count_queries.keys().cloned().collect();
        assert_eq!(ids, (1..=4).map(RuleId::Number).collect::<Vec<_>>());

        assert_eq!(q.count_queries[&RuleId::Number(1)].sql, "SELECT COUNT(*) FROM \"t\"");
        assert_eq!(
            q.count_queries[&RuleId::Number(2)],
            Query {
                sql: "SELECT COUNT(*) FROM \"t\" WHERE (\"x\" = ?)".to_owned(),
                args: strings(&["a"]),
            }
        );
        assert_eq!(
            q.count_queries[&RuleId::Number(3)],
            Query {
                sql: "SELECT COUNT(*) FROM \"t\" WHERE (\"y\" IN (?,?))".to_owned(),
                args: strings(&["1", "2"]),
            }
        );
        // the implicit AND group is counted under the share rule
        assert_eq!(
            q.count_queries[&RuleId::Number(4)],
            Query {
                sql: "SELECT COUNT(*) FROM \"t\" WHERE ((\"x\" = ?) AND (\"y\" IN (?,?)))"
                    .to_owned(),
                args: strings(&["a", "1", "2"]),
            }
        );
    }

    #[test]
    fn test_share_table_rule_count_queries() {
        let queries = queries(
            "1,a;b,select,,,all,\n\
             2,a,filter,x,=,1,\n\
             3,b,filter,y,=,1,\n\
             4,,share,ohri,,1;2;3,\n",
        );
        let share_id = RuleId::Number(4);
        assert_eq!(
            queries["ohri"]["a"].count_queries[&share_id].sql,
            "SELECT COUNT(*) FROM \"a\" WHERE (\"x\" = ?)"
        );
        assert_eq!(
            queries["ohri"]["b"].count_queries[&share_id].sql,
            "SELECT COUNT(*) FROM \"b\" WHERE (\"y\" = ?)"
        );
    }

    #[test]
    fn test_ident() {
        assert_eq!(ident("report_Date2"), "\"report_Date2\"");
        assert_eq!(ident("site id"), "\"site id\"");
        assert_eq!(ident("région"), "\"région\"");
        assert_eq!(ident("a\"b"), "\"a\"\"b\"");

        let queries = queries(
            "1,t;x y,select,,,a b-c,\n\
             2,t,filter,x) OR (1=1,=,1' OR '1'='1,\n\
             3,,share,ohri,,1;2,\n",
        );
        let q = &queries["ohri"]["t"];
        assert_eq!(
            q.data_query.sql,
            "SELECT \"a b-c\" FROM \"t\" WHERE (\"x) OR (1=1\" = ?)"
        );
        assert_eq!(q.data_query.args, strings(&["1' OR '1'='1"]));
        assert_eq!(
            queries["ohri"]["x y"].data_query.sql,
            "SELECT \"a b-c\" FROM \"x y\""
        );
    }

    #[test]
    fn test_implicit_and_follows_list_order() {
        let rows = |order: &str| {
            format!(
                "1,t,select,,,all,\n2,t,filter,x,=,1,\n3,t,filter,y,=,2,\n4,,share,ohri,,{},\n",
                order
            )
        };
        let forward = queries(&rows("1;2;3"));
        let backward = queries(&rows("3;2;1"));
        assert_eq!(
            forward["ohri"]["t"].data_query.sql,
            "SELECT * FROM \"t\" WHERE ((\"x\" = ?) AND (\"y\" = ?))"
        );
        assert_eq!(
            backward["ohri"]["t"].data_query.sql,
            "SELECT * FROM \"t\" WHERE ((\"y\" = ?) AND (\"x\" = ?))"
        );
    }

    #[test]
    fn test_generation_is_deterministic() {
        let rows = "1,a;b,select,,,all,\n\
                    2,a,filter,x,in,1:5,\n\
                    3,b,filter,y,<,2,\n\
                    4,,share,ohri;phac,,1;2;3,\n";
        assert_eq!(queries(rows), queries(rows));
    }

    #[test]
    fn test_column_query() {
        let queries = queries("1,t,select,,,all,\n2,t,filter,x,=,1,\n3,,share,ohri,,1;2,\n");
        let q = &queries["ohri"]["t"];
        assert_eq!(
            q.column_query(SqlDialect::Other).sql,
            "SELECT * FROM \"t\" LIMIT 0"
        );
        assert_eq!(
            q.column_query(SqlDialect::from_name("MSSQL")).sql,
            "SELECT TOP 0 * FROM \"t\""
        );
    }
}
