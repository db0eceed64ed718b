//! Compilation of rules into a per-recipient, per-table syntax tree.
//!
//! Rules are processed in document order. Every select, filter and group
//! rule leaves one node instance per table in a lookup table; later group
//! and share rules copy the instances they reference into their own
//! subtrees, so rules can only refer to rules defined above them and the
//! final tree never shares a node between two parents.
//!
//! ```text
//! root
//! └── share 'ohri'
//!     └── table 'measures'
//!         ├── select ''
//!         │   └── literal 'measure' ...
//!         └── group AND
//!             ├── filter =        (field, literal)
//!             └── filter in       (field, literal, literal)
//! ```

use std::collections::HashMap;
use std::fmt;

use itertools::Itertools;
use tracing::{debug, warn};

use crate::ast::{
    ColumnName, Columns, FilterOp, Item, LogicalOp, Operands, RangeKind, Recipient, Recipients,
    Rule, RuleBody, RuleId, RuleMode, RuleSet, TableName, Tables, ALL,
};
use crate::error::{CompileError, Location, ReferenceError, Result, ValueError};
use crate::rules::{KEY, TABLE, VALUE};
use crate::source::{Catalog, NoCatalog};

/// Index of a node in its tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Share { recipient: Recipient },
    /// `share_rule` is the share rule that put the table in its share node.
    Table { name: TableName, share_rule: RuleId },
    Select { all: bool },
    Group { op: LogicalOp },
    Filter { op: FilterOp },
    Field { name: ColumnName },
    Literal { value: String },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Share { .. } => "share",
            NodeKind::Table { .. } => "table",
            NodeKind::Select { .. } => "select",
            NodeKind::Group { .. } => "group",
            NodeKind::Filter { .. } => "filter",
            NodeKind::Field { .. } => "field",
            NodeKind::Literal { .. } => "literal",
        }
    }

    /// The kind-specific payload as text.
    pub fn scalar(&self) -> String {
        match self {
            NodeKind::Root => String::new(),
            NodeKind::Share { recipient } => recipient.clone(),
            NodeKind::Table { name, .. } => name.clone(),
            NodeKind::Select { all } => if *all { ALL } else { "" }.to_owned(),
            NodeKind::Group { op } => op.to_string(),
            NodeKind::Filter { op } => match op {
                FilterOp::In(RangeKind::Interval) => "in interval".to_owned(),
                FilterOp::In(RangeKind::Set) => "in set".to_owned(),
                op => op.to_string(),
            },
            NodeKind::Field { name } => name.clone(),
            NodeKind::Literal { value } => value.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// The rule that produced this node, `None` for implicit nodes.
    pub rule_id: Option<RuleId>,
    pub kind: NodeKind,
    pub children: Vec<NodeId>,
}

impl Node {
    fn leaf(rule_id: &RuleId, kind: NodeKind) -> Self {
        Self {
            rule_id: Some(rule_id.clone()),
            kind,
            children: vec![],
        }
    }
}

/// The compiled, immutable rule tree.
#[derive(Clone, Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Tree {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.node(id)
            .children
            .iter()
            .map(move |&child| (child, self.node(child)))
    }

    /// Share nodes under the root, in creation order.
    pub fn shares(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.children(self.root)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false once built, the root node is part of the arena.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, depth: usize) -> fmt::Result {
        let node = self.node(id);
        let rule_id = node
            .rule_id
            .as_ref()
            .map_or_else(|| "_".to_owned(), RuleId::to_string);
        writeln!(
            f,
            "{}({}, {}, '{}')",
            "    ".repeat(depth),
            rule_id,
            node.kind.name(),
            node.kind.scalar()
        )?;
        for &child in &node.children {
            self.fmt_node(f, child, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f, self.root, 0)
    }
}

/// Builds a tree with no data source information or recipient whitelist.
pub fn build(rules: &RuleSet) -> Result<Tree> {
    TreeBuilder::new(rules).build()
}

pub struct TreeBuilder<'a> {
    rules: &'a RuleSet,
    catalog: &'a dyn Catalog,
    orgs: Vec<Recipient>,
    filename: String,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(rules: &'a RuleSet) -> Self {
        Self {
            rules,
            catalog: &NoCatalog,
            orgs: vec![],
            filename: String::new(),
        }
    }

    /// Table names, column order and column types used to expand `all`
    /// tables, `first:last` column ranges and to check filter literals.
    pub fn catalog(mut self, catalog: &'a dyn Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Only share with these recipients. Empty means everyone.
    pub fn orgs(mut self, orgs: impl IntoIterator<Item = impl Into<Recipient>>) -> Self {
        self.orgs = orgs.into_iter().map(Into::into).collect();
        self
    }

    /// Schema file name reported in errors.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn build(self) -> Result<Tree> {
        let mut state = BuildState {
            rules: self.rules,
            catalog: self.catalog,
            orgs: &self.orgs,
            file: Location::file(&self.filename),
            arena: vec![],
            instances: HashMap::new(),
            all_tables: None,
            shares: vec![],
            share_index: HashMap::new(),
            all_recipients: all_recipients(self.rules, &self.orgs),
        };
        state.validate_schema()?;
        for rule in self.rules {
            state.add_rule(rule)?;
        }

        let root = Node {
            rule_id: None,
            kind: NodeKind::Root,
            children: state.shares.clone(),
        };
        if root.children.is_empty() {
            warn!("no recipients left to share with");
        }
        let root = state.push(root);

        // copy out the nodes reachable from the root, dropping rule instances
        // that were never shared
        let mut nodes = vec![];
        let root = compact(&state.arena, root, &mut nodes);
        Ok(Tree { nodes, root })
    }
}

fn compact(arena: &[Node], id: NodeId, out: &mut Vec<Node>) -> NodeId {
    let node = &arena[id.0];
    let children = node
        .children
        .iter()
        .map(|&child| compact(arena, child, out))
        .collect();
    out.push(Node {
        rule_id: node.rule_id.clone(),
        kind: node.kind.clone(),
        children,
    });
    NodeId(out.len() - 1)
}

/// Recipients that a share rule with key `all` binds to: the whitelist if
/// one is given, otherwise every recipient named by a share rule.
fn all_recipients(rules: &RuleSet, orgs: &[Recipient]) -> Vec<Recipient> {
    if !orgs.is_empty() {
        return orgs.to_vec();
    }
    rules
        .iter()
        .filter_map(|rule| match &rule.body {
            RuleBody::Share {
                recipients: Recipients::Named(names),
                ..
            } => Some(names),
            _ => None,
        })
        .flatten()
        .unique()
        .cloned()
        .collect()
}

/// A rule compiled against one table.
#[derive(Clone, Debug)]
struct Instance {
    table: TableName,
    node: NodeId,
}

struct BuildState<'a> {
    rules: &'a RuleSet,
    catalog: &'a dyn Catalog,
    orgs: &'a [Recipient],
    file: Location,
    arena: Vec<Node>,
    /// Rule id to its per-table node instances.
    instances: HashMap<RuleId, Vec<Instance>>,
    /// Expansion of the `all` table wildcard, filled on first use.
    all_tables: Option<Vec<TableName>>,
    shares: Vec<NodeId>,
    share_index: HashMap<Recipient, NodeId>,
    all_recipients: Vec<Recipient>,
}

impl BuildState<'_> {
    fn push(&mut self, node: Node) -> NodeId {
        self.arena.push(node);
        NodeId(self.arena.len() - 1)
    }

    /// Deep-copies a subtree so the copy can be given to a new parent.
    fn copy(&mut self, id: NodeId) -> NodeId {
        let node = self.arena[id.0].clone();
        let children = node.children.iter().map(|&child| self.copy(child)).collect();
        self.push(Node { children, ..node })
    }

    fn location(&self, rule: &Rule) -> Location {
        self.file
            .clone()
            .with_line(rule.line)
            .with_rule(rule.id.clone())
    }

    fn compile_error(&self, rule: &Rule, message: impl Into<String>) -> CompileError {
        CompileError {
            location: self.location(rule),
            message: message.into(),
        }
    }

    fn validate_schema(&self) -> Result<()> {
        for (mode, what) in [(RuleMode::Share, "share"), (RuleMode::Select, "select")] {
            if !self.rules.iter().any(|rule| rule.mode() == mode) {
                return Err(CompileError {
                    location: self.file.clone(),
                    message: format!("no {}-rules in schema", what),
                }
                .into());
            }
        }
        Ok(())
    }

    fn add_rule(&mut self, rule: &Rule) -> Result<()> {
        debug!(rule = %rule.id, mode = %rule.mode(), "compiling rule");
        match &rule.body {
            RuleBody::Select { columns } => self.add_select(rule, columns),
            RuleBody::Filter { key, op, operands } => self.add_filter(rule, key, *op, operands),
            RuleBody::Group { op, refs } => self.add_group(rule, *op, refs),
            RuleBody::Share { recipients, refs } => self.add_share(rule, recipients, refs),
        }
    }

    fn expand_tables(&mut self, rule: &Rule) -> Result<Vec<TableName>> {
        let tables = match &rule.tables {
            Tables::Named(tables) => tables.clone(),
            Tables::All => {
                if self.all_tables.is_none() {
                    self.all_tables = Some(self.catalog.tables());
                }
                self.all_tables.clone().unwrap_or_default()
            }
            Tables::None => vec![],
        };
        if tables.is_empty() {
            let message = match rule.tables {
                Tables::All => "table 'all' requires a data source that lists its tables",
                _ => "no tables given",
            };
            return Err(CompileError {
                location: self.location(rule).with_column(TABLE),
                message: message.to_owned(),
            }
            .into());
        }
        for table in &tables {
            self.check_identifier(rule, TABLE, table)?;
        }
        Ok(tables)
    }

    fn check_identifier(&self, rule: &Rule, column: &'static str, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('"') {
            return Err(CompileError {
                location: self.location(rule).with_column(column),
                message: format!("'{}' is not a usable table or column name", name),
            }
            .into());
        }
        Ok(())
    }

    fn add_instance(&mut self, rule: &Rule, table: TableName, node: NodeId) {
        self.instances
            .entry(rule.id.clone())
            .or_default()
            .push(Instance { table, node });
    }

    fn add_select(&mut self, rule: &Rule, columns: &Columns) -> Result<()> {
        for table in self.expand_tables(rule)? {
            let node = match columns {
                Columns::All => Node::leaf(&rule.id, NodeKind::Select { all: true }),
                Columns::Named(items) => {
                    let names = self.resolve_columns(rule, &table, items)?;
                    let children = names
                        .into_iter()
                        .map(|value| self.push(Node::leaf(&rule.id, NodeKind::Literal { value })))
                        .collect();
                    Node {
                        rule_id: Some(rule.id.clone()),
                        kind: NodeKind::Select { all: false },
                        children,
                    }
                }
            };
            let node = self.push(node);
            self.add_instance(rule, table, node);
        }
        Ok(())
    }

    /// Expands `first:last` ranges using the table's canonical column order.
    fn resolve_columns(&self, rule: &Rule, table: &str, items: &[Item]) -> Result<Vec<ColumnName>> {
        let mut names = vec![];
        for item in items {
            match item {
                Item::Single(name) => {
                    self.check_identifier(rule, VALUE, name)?;
                    names.push(name.clone());
                }
                Item::Range(first, last) => {
                    let range_error = |message: String| -> crate::error::Error {
                        CompileError {
                            location: self.location(rule).with_column(VALUE),
                            message,
                        }
                        .into()
                    };
                    let order = self.catalog.columns(table).ok_or_else(|| {
                        range_error(format!(
                            "column range '{}:{}' needs the column order of table '{}'",
                            first, last, table
                        ))
                    })?;
                    let position = |name: &str| {
                        order.iter().position(|c| c == name).ok_or_else(|| {
                            range_error(format!("table '{}' has no column '{}'", table, name))
                        })
                    };
                    let (start, end) = (position(first)?, position(last)?);
                    if start > end {
                        return Err(range_error(format!(
                            "column '{}' comes after '{}' in table '{}'",
                            first, last, table
                        )));
                    }
                    names.extend(order[start..=end].iter().cloned());
                }
            }
        }
        Ok(names.into_iter().unique().collect())
    }

    fn add_filter(
        &mut self,
        rule: &Rule,
        key: &str,
        op: FilterOp,
        operands: &Operands,
    ) -> Result<()> {
        self.check_identifier(rule, KEY, key)?;
        for table in self.expand_tables(rule)? {
            let column_type = self.catalog.column_type(&table, key);
            let mut children = vec![self.push(Node::leaf(
                &rule.id,
                NodeKind::Field {
                    name: key.to_owned(),
                },
            ))];
            for value in operands.values() {
                let value = match column_type {
                    Some(expected) => expected.coerce(value).ok_or_else(|| ValueError {
                        location: self.location(rule).with_column(VALUE),
                        table: table.clone(),
                        column: key.to_owned(),
                        value: value.to_owned(),
                        expected,
                    })?,
                    None => value.to_owned(),
                };
                children.push(self.push(Node::leaf(&rule.id, NodeKind::Literal { value })));
            }
            let node = self.push(Node {
                rule_id: Some(rule.id.clone()),
                kind: NodeKind::Filter { op },
                children,
            });
            self.add_instance(rule, table, node);
        }
        Ok(())
    }

    /// Looks up the instances of a referenced rule.
    fn resolve(&self, rule: &Rule, id: &RuleId) -> Result<Vec<Instance>> {
        if let Some(instances) = self.instances.get(id) {
            return Ok(instances.clone());
        }
        let current = self.rules.position(&rule.id);
        match (self.rules.get(id), self.rules.position(id)) {
            (Some(target), Some(position)) if Some(position) < current => {
                // defined above but left no instances, i.e. a share rule
                Err(self
                    .compile_error(
                        rule,
                        format!(
                            "rule {} is a {}-rule and can't be referenced here",
                            id,
                            target.mode()
                        ),
                    )
                    .into())
            }
            (target, _) => Err(ReferenceError {
                location: self.location(rule).with_column(VALUE),
                missing: id.clone(),
                defined_later_on: target.map(|target| target.line),
            }
            .into()),
        }
    }

    fn add_group(&mut self, rule: &Rule, op: LogicalOp, refs: &[RuleId]) -> Result<()> {
        let mut referenced = vec![];
        for id in refs {
            let instances = self.resolve(rule, id)?;
            let mode = self.rules.get(id).map(Rule::mode);
            if !matches!(mode, Some(RuleMode::Filter | RuleMode::Group)) {
                return Err(self
                    .compile_error(rule, "group-rules can only refer to other filter/group-rules")
                    .into());
            }
            referenced.push(instances);
        }

        // each table is resolved independently from the instances that
        // reference it
        let mut tables: Vec<TableName> = referenced
            .iter()
            .flatten()
            .map(|instance| instance.table.clone())
            .unique()
            .collect();
        if !matches!(rule.tables, Tables::None) {
            let wanted = self.expand_tables(rule)?;
            if let Some(missing) = wanted.iter().find(|table| !tables.contains(*table)) {
                return Err(CompileError {
                    location: self.location(rule).with_column(TABLE),
                    message: format!("none of the grouped rules apply to table '{}'", missing),
                }
                .into());
            }
            tables = wanted;
        }

        for table in tables {
            let members: Vec<NodeId> = referenced
                .iter()
                .flatten()
                .filter(|instance| instance.table == table)
                .map(|instance| instance.node)
                .collect();
            let children = members.into_iter().map(|node| self.copy(node)).collect();
            let node = self.push(Node {
                rule_id: Some(rule.id.clone()),
                kind: NodeKind::Group { op },
                children,
            });
            self.add_instance(rule, table, node);
        }
        Ok(())
    }

    fn add_share(&mut self, rule: &Rule, recipients: &Recipients, refs: &[RuleId]) -> Result<()> {
        let recipients: Vec<Recipient> = match recipients {
            Recipients::All => self.all_recipients.clone(),
            Recipients::Named(names) if self.orgs.is_empty() => names.clone(),
            Recipients::Named(names) => names
                .iter()
                .filter(|name| self.orgs.contains(name))
                .cloned()
                .collect(),
        };
        if recipients.is_empty() {
            if self.orgs.is_empty() {
                return Err(self
                    .compile_error(rule, "no recipients to share with")
                    .with_column(KEY)
                    .into());
            }
            debug!(rule = %rule.id, "skipping share-rule without whitelisted recipients");
            return Ok(());
        }

        let mut selects: Vec<(TableName, RuleId, NodeId)> = vec![];
        let mut filters: Vec<Instance> = vec![];
        for id in refs {
            let instances = self.resolve(rule, id)?;
            if self.rules.get(id).map(Rule::mode) == Some(RuleMode::Select) {
                for instance in instances {
                    if let Some((_, other, _)) = selects.iter().find(|s| s.0 == instance.table) {
                        return Err(self
                            .compile_error(
                                rule,
                                format!(
                                    "select-rule {}'s table '{}' is already used by select-rule {}",
                                    id, instance.table, other
                                ),
                            )
                            .into());
                    }
                    selects.push((instance.table, id.clone(), instance.node));
                }
            } else {
                filters.extend(instances);
            }
        }

        if let Some(orphan) = filters
            .iter()
            .find(|f| !selects.iter().any(|(table, ..)| *table == f.table))
        {
            let source = self.arena[orphan.node.0]
                .rule_id
                .as_ref()
                .map_or_else(String::new, RuleId::to_string);
            return Err(self
                .compile_error(
                    rule,
                    format!(
                        "rule {} filters table '{}', which no select-rule of this share-rule includes",
                        source, orphan.table
                    ),
                )
                .into());
        }
        if selects.is_empty() {
            return Err(self
                .compile_error(rule, "share-rule doesn't reference any select-rule")
                .into());
        }

        for recipient in recipients {
            let share = self.share_node(rule, &recipient);
            for (table, select_id, select) in &selects {
                let existing = self.arena[share.0]
                    .children
                    .iter()
                    .map(|&child| &self.arena[child.0].kind)
                    .find_map(|kind| match kind {
                        NodeKind::Table { name, share_rule } if name == table => {
                            Some(share_rule.clone())
                        }
                        _ => None,
                    });
                if let Some(other) = existing {
                    return Err(self
                        .compile_error(
                            rule,
                            format!(
                                "table '{}' is already shared with '{}' by share-rule {}",
                                table, recipient, other
                            ),
                        )
                        .into());
                }

                let select = self.copy(*select);
                let mut children = vec![select];
                let members: Vec<NodeId> = filters
                    .iter()
                    .filter(|f| f.table == *table)
                    .map(|f| f.node)
                    .collect();
                match members.as_slice() {
                    [] => {}
                    [single] => children.push(self.copy(*single)),
                    members => {
                        let members = members.iter().map(|&node| self.copy(node)).collect();
                        children.push(self.push(Node {
                            rule_id: None,
                            kind: NodeKind::Group { op: LogicalOp::And },
                            children: members,
                        }));
                    }
                }

                let node = self.push(Node {
                    rule_id: Some(select_id.clone()),
                    kind: NodeKind::Table {
                        name: table.clone(),
                        share_rule: rule.id.clone(),
                    },
                    children,
                });
                self.arena[share.0].children.push(node);
                debug!(rule = %rule.id, %recipient, %table, "shared table");
            }
        }
        Ok(())
    }

    /// Returns the share node of a recipient, creating it on first use.
    fn share_node(&mut self, rule: &Rule, recipient: &str) -> NodeId {
        if let Some(&node) = self.share_index.get(recipient) {
            return node;
        }
        let node = self.push(Node::leaf(
            &rule.id,
            NodeKind::Share {
                recipient: recipient.to_owned(),
            },
        ));
        self.shares.push(node);
        self.share_index.insert(recipient.to_owned(), node);
        node
    }
}
