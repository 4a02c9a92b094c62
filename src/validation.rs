//! SQL Validator / Sanitizer
//!
//! Model output is untrusted code. A candidate is tokenized and parsed into a statement tree;
//! only a single read-only query whose every table and column resolves against the catalog is
//! turned into a `ValidatedQuery`. Nothing is repaired: anything ambiguous is rejected.

use crate::error::{NlSqlError, Result};
use crate::metadata::SchemaCatalog;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, Ident, ObjectName, Query, SelectItem, SetExpr,
    Statement, TableAlias, TableFactor, TableWithJoins, Visit, Visitor,
};
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::ControlFlow;
use tracing::debug;

// Bare words BigQuery accepts as date/time part arguments, e.g. DATE_TRUNC(d, MONTH).
const DATE_PARTS: &[&str] = &[
    "microsecond", "millisecond", "second", "minute", "hour", "day", "dayofweek", "dayofyear",
    "week", "isoweek", "month", "quarter", "year", "isoyear", "date", "time", "datetime",
];

// Functions whose bare-word arguments are date parts.
const DATE_PART_FUNCTIONS: &[&str] = &[
    "date_trunc", "datetime_trunc", "timestamp_trunc", "time_trunc", "date_diff",
    "datetime_diff", "timestamp_diff", "time_diff", "last_day", "date_bucket",
];

// WEEK(<weekday>) inside a truncation or difference.
const WEEKDAYS: &[&str] = &[
    "sunday", "monday", "tuesday", "wednesday", "thursday", "friday", "saturday",
];

// Bound on CTE-over-CTE `*` chains followed while resolving a column.
const MAX_SHAPE_DEPTH: usize = 8;

/// Statement tree root, tagged read-only or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Other(&'static str),
}

impl StatementKind {
    pub fn classify(statement: &Statement) -> Self {
        match statement {
            Statement::Query(_) => StatementKind::Select,
            Statement::Insert { .. } => StatementKind::Other("INSERT"),
            Statement::Update { .. } => StatementKind::Other("UPDATE"),
            Statement::Delete { .. } => StatementKind::Other("DELETE"),
            Statement::Merge { .. } => StatementKind::Other("MERGE"),
            Statement::Drop { .. } => StatementKind::Other("DROP"),
            Statement::AlterTable { .. } => StatementKind::Other("ALTER"),
            Statement::Truncate { .. } => StatementKind::Other("TRUNCATE"),
            Statement::CreateTable { .. } | Statement::CreateView { .. } => {
                StatementKind::Other("CREATE")
            }
            _ => StatementKind::Other("non-query"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

/// A candidate that passed every safety and schema check. Only the validator constructs it.
#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    statement: Statement,
    sql: String,
    tables: BTreeSet<String>,
    columns: BTreeSet<ColumnRef>,
    ordered: bool,
}

impl ValidatedQuery {
    /// Canonical rendering of the validated statement tree; this is what gets executed.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    pub fn columns(&self) -> &BTreeSet<ColumnRef> {
        &self.columns
    }

    pub fn references(&self, table: &str, column: &str) -> bool {
        self.columns
            .iter()
            .any(|c| c.table.eq_ignore_ascii_case(table) && c.column.eq_ignore_ascii_case(column))
    }

    /// Top-level ORDER BY present, so row order is meaningful.
    pub fn has_order_by(&self) -> bool {
        self.ordered
    }

    /// Validated queries are pure reads.
    pub fn is_idempotent(&self) -> bool {
        true
    }
}

/// Columns a CTE or derived table exposes to the query around it.
#[derive(Debug, Default)]
struct Shape {
    columns: HashSet<String>,
    /// FROM items a `*` or `alias.*` projection passes through unchanged.
    star_sources: Vec<String>,
}

impl Shape {
    fn of(body: &SetExpr, alias: Option<&TableAlias>) -> Self {
        let mut shape = Self::of_body(body);
        if let Some(alias) = alias.filter(|a| !a.columns.is_empty()) {
            shape.columns = alias.columns.iter().map(|c| c.value.to_lowercase()).collect();
            shape.star_sources.clear();
        }
        shape
    }

    fn of_body(body: &SetExpr) -> Self {
        match body {
            SetExpr::Select(select) => {
                let mut shape = Shape::default();
                for item in &select.projection {
                    match item {
                        SelectItem::ExprWithAlias { alias, .. } => {
                            shape.columns.insert(alias.value.to_lowercase());
                        }
                        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                            shape.columns.insert(ident.value.to_lowercase());
                        }
                        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                            if let Some(last) = parts.last() {
                                shape.columns.insert(last.value.to_lowercase());
                            }
                        }
                        // Unnamed expressions get anonymous names like f0_.
                        SelectItem::UnnamedExpr(_) => {}
                        SelectItem::Wildcard(_) => {
                            for table in &select.from {
                                from_names(table, &mut shape.star_sources);
                            }
                        }
                        SelectItem::QualifiedWildcard(name, _) => {
                            if let Some(last) = name_parts(name).pop() {
                                shape.star_sources.push(last);
                            }
                        }
                    }
                }
                shape
            }
            // Set operations take their column names from the first input.
            SetExpr::SetOperation { left, .. } => Self::of_body(left),
            SetExpr::Query(query) => Self::of_body(&query.body),
            _ => Shape::default(),
        }
    }
}

/// Names the FROM items of one table expression are addressed by.
fn from_names(table: &TableWithJoins, names: &mut Vec<String>) {
    factor_name(&table.relation, names);
    for join in &table.joins {
        factor_name(&join.relation, names);
    }
}

fn factor_name(factor: &TableFactor, names: &mut Vec<String>) {
    match factor {
        TableFactor::Table {
            alias: Some(alias), ..
        }
        | TableFactor::Derived {
            alias: Some(alias), ..
        } => names.push(alias.name.value.to_lowercase()),
        TableFactor::Table { name, .. } => {
            if let Some(last) = name_parts(name).pop() {
                names.push(last);
            }
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => from_names(table_with_joins, names),
        _ => {}
    }
}

/// Everything a statement tree references, gathered in one walk.
#[derive(Debug, Default)]
struct ReferenceCollector {
    statements: Vec<StatementKind>,
    relations: Vec<ObjectName>,
    table_aliases: HashMap<String, ObjectName>,
    cte_names: HashSet<String>,
    /// CTE names and derived-table aliases.
    shapes: HashMap<String, Shape>,
    output_aliases: HashSet<String>,
    qualified_wildcards: Vec<ObjectName>,
    identifiers: Vec<Vec<Ident>>,
    /// Bare date-part words seen as date function arguments, by word.
    date_part_args: HashMap<String, usize>,
    select_into: bool,
    locking: bool,
}

impl ReferenceCollector {
    fn collect_body(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    self.select_into = true;
                }
                for item in &select.projection {
                    match item {
                        SelectItem::ExprWithAlias { alias, .. } => {
                            self.output_aliases.insert(alias.value.to_lowercase());
                        }
                        SelectItem::QualifiedWildcard(name, _) => {
                            self.qualified_wildcards.push(name.clone());
                        }
                        _ => {}
                    }
                }
                for table in &select.from {
                    self.collect_factor(&table.relation);
                    for join in &table.joins {
                        self.collect_factor(&join.relation);
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_body(left);
                self.collect_body(right);
            }
            // Nested queries are reached through pre_visit_query.
            _ => {}
        }
    }

    fn collect_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table {
                name,
                alias: Some(alias),
                ..
            } => {
                self.table_aliases
                    .insert(alias.name.value.to_lowercase(), name.clone());
            }
            TableFactor::Derived {
                subquery,
                alias: Some(alias),
                ..
            } => {
                self.shapes.insert(
                    alias.name.value.to_lowercase(),
                    Shape::of(&subquery.body, Some(alias)),
                );
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.collect_factor(&table_with_joins.relation);
                for join in &table_with_joins.joins {
                    self.collect_factor(&join.relation);
                }
            }
            _ => {}
        }
    }

    fn collect_date_part_args(&mut self, function: &Function) {
        let name = match function.name.0.last() {
            Some(ident) => ident.value.to_lowercase(),
            None => return,
        };
        let words = if name == "week" {
            WEEKDAYS
        } else if DATE_PART_FUNCTIONS.contains(&name.as_str()) {
            DATE_PARTS
        } else {
            return;
        };
        for arg in &function.args {
            if let FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Identifier(ident))) = arg {
                let word = ident.value.to_lowercase();
                if words.contains(&word.as_str()) {
                    *self.date_part_args.entry(word).or_insert(0) += 1;
                }
            }
        }
    }
}

impl Visitor for ReferenceCollector {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        self.statements.push(StatementKind::classify(statement));
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = cte.alias.name.value.to_lowercase();
                self.shapes
                    .insert(name.clone(), Shape::of(&cte.query.body, Some(&cte.alias)));
                self.cte_names.insert(name);
            }
        }
        if !query.locks.is_empty() {
            self.locking = true;
        }
        self.collect_body(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.push(relation.clone());
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.identifiers.push(vec![ident.clone()]),
            Expr::CompoundIdentifier(parts) => self.identifiers.push(parts.clone()),
            Expr::Function(function) => self.collect_date_part_args(function),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// Split an object name into lowercase parts; backticked `project.dataset.table` is one ident
/// in BigQuery but three parts here.
fn name_parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .flat_map(|ident| ident.value.split('.').map(str::to_lowercase).collect::<Vec<_>>())
        .collect()
}

fn ident_parts(idents: &[Ident]) -> Vec<String> {
    idents
        .iter()
        .flat_map(|ident| ident.value.split('.').map(str::to_lowercase).collect::<Vec<_>>())
        .collect()
}

/// What a qualifier such as `c` in `c.word_count` stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    /// Catalog table, by its catalog spelling
    Table(String),
    /// CTE or derived table, by its lowercase name
    Derived(String),
}

/// Resolution state for one candidate.
struct Resolver<'a> {
    catalog: &'a SchemaCatalog,
    collector: &'a ReferenceCollector,
    tables: BTreeSet<String>,
    columns: BTreeSet<ColumnRef>,
    date_parts: HashMap<String, usize>,
}

impl<'a> Resolver<'a> {
    fn new(catalog: &'a SchemaCatalog, collector: &'a ReferenceCollector) -> Self {
        Self {
            catalog,
            collector,
            tables: BTreeSet::new(),
            columns: BTreeSet::new(),
            date_parts: collector.date_part_args.clone(),
        }
    }

    /// Resolve a table name to its catalog spelling, checking any dataset/project qualifier.
    fn catalog_table(&self, parts: &[String]) -> Result<Option<String>> {
        let (table, qualifiers) = match parts.split_last() {
            Some(split) => split,
            None => return Ok(None),
        };
        if qualifiers.len() > 2 {
            return Err(NlSqlError::SchemaMismatch(format!(
                "table reference '{}' has too many qualifiers",
                parts.join(".")
            )));
        }
        if let Some(dataset) = qualifiers.last() {
            if let Some(expected) = self.catalog.dataset_id() {
                if !dataset.eq_ignore_ascii_case(expected) {
                    return Err(NlSqlError::SchemaMismatch(format!(
                        "dataset '{}' is outside the catalog",
                        dataset
                    )));
                }
            }
        }
        if qualifiers.len() == 2 {
            if let Some(expected) = self.catalog.project_id() {
                if !qualifiers[0].eq_ignore_ascii_case(expected) {
                    return Err(NlSqlError::SchemaMismatch(format!(
                        "project '{}' is outside the catalog",
                        qualifiers[0]
                    )));
                }
            }
        }
        Ok(self.catalog.table(table).map(|t| t.table.clone()))
    }

    fn resolve_relations(&mut self) -> Result<()> {
        let collector = self.collector;
        for relation in &collector.relations {
            let parts = name_parts(relation);
            let rendered = parts.join(".");
            if parts.len() == 1 && collector.cte_names.contains(&parts[0]) {
                continue;
            }
            match self.catalog_table(&parts)? {
                Some(table) => {
                    self.tables.insert(table);
                }
                None if rendered.contains('*') => {
                    return Err(NlSqlError::UnsafeQuery(format!(
                        "wildcard table reference '{}' is not in the catalog",
                        rendered
                    )))
                }
                None => {
                    return Err(NlSqlError::SchemaMismatch(format!(
                        "table '{}' is not in the catalog",
                        rendered
                    )))
                }
            }
        }
        Ok(())
    }

    fn source(&self, qualifier: &str) -> Option<Source> {
        if let Some(name) = self.collector.table_aliases.get(qualifier) {
            let parts = name_parts(name);
            if let [single] = parts.as_slice() {
                if self.collector.cte_names.contains(single) {
                    return Some(Source::Derived(single.clone()));
                }
            }
            return match self.catalog_table(&parts) {
                Ok(Some(table)) => Some(Source::Table(table)),
                _ => None,
            };
        }
        if self.collector.shapes.contains_key(qualifier) {
            return Some(Source::Derived(qualifier.to_string()));
        }
        self.tables
            .iter()
            .find(|t| t.eq_ignore_ascii_case(qualifier))
            .map(|t| Source::Table(t.clone()))
    }

    fn resolve_wildcards(&self) -> Result<()> {
        for name in &self.collector.qualified_wildcards {
            let parts = name_parts(name);
            let qualifier = parts.last().cloned().unwrap_or_default();
            if self.source(&qualifier).is_none() {
                return Err(NlSqlError::UnsafeQuery(format!(
                    "wildcard reference '{}.*' is not in the catalog",
                    parts.join(".")
                )));
            }
        }
        Ok(())
    }

    fn record_column(&mut self, table: &str, column: &str) -> bool {
        match self.catalog.table(table).and_then(|d| d.column(column)) {
            Some(col) => {
                self.columns.insert(ColumnRef {
                    table: table.to_string(),
                    column: col.name.clone(),
                });
                true
            }
            None => false,
        }
    }

    /// Whether the CTE or derived table `name` produces `column`.
    fn shape_column(&mut self, name: &str, column: &str, depth: usize) -> bool {
        let collector = self.collector;
        let shape = match collector.shapes.get(name) {
            Some(shape) => shape,
            None => return false,
        };
        if shape.columns.contains(column) {
            return true;
        }
        if depth >= MAX_SHAPE_DEPTH {
            return false;
        }
        for star in &shape.star_sources {
            let found = match self.source(star) {
                Some(Source::Table(table)) => self.record_column(&table, column),
                Some(Source::Derived(inner)) if inner != name => {
                    self.shape_column(&inner, column, depth + 1)
                }
                _ => false,
            };
            if found {
                return true;
            }
        }
        false
    }

    fn record_unqualified(&mut self, column: &str) -> bool {
        let matches: Vec<String> = self
            .tables
            .iter()
            .filter(|t| self.catalog.resolve_reference(t, column))
            .cloned()
            .collect();
        for table in &matches {
            if let Some(descriptor) = self.catalog.table(table) {
                if let Some(col) = descriptor.column(column) {
                    self.columns.insert(ColumnRef {
                        table: table.clone(),
                        column: col.name.clone(),
                    });
                }
            }
        }
        !matches.is_empty()
    }

    fn resolve_unqualified(&mut self, column: &str) -> Result<()> {
        if self.record_unqualified(column) || self.collector.output_aliases.contains(column) {
            return Ok(());
        }
        if let Some(remaining) = self.date_parts.get_mut(column).filter(|n| **n > 0) {
            *remaining -= 1;
            return Ok(());
        }
        Err(NlSqlError::SchemaMismatch(format!(
            "column '{}' is not in any referenced table",
            column
        )))
    }

    fn resolve_identifier(&mut self, parts: &[String]) -> Result<()> {
        let (qualifier, rest) = match parts.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };
        if rest.is_empty() {
            return self.resolve_unqualified(qualifier);
        }
        // `alias.column[.field]`, else `dataset.table.column`.
        let (source, column) = match self.source(qualifier) {
            Some(source) => (source, rest[0].as_str()),
            None if parts.len() >= 3 => match self.source(&parts[parts.len() - 2]) {
                Some(source) => (source, parts[parts.len() - 1].as_str()),
                None => return self.resolve_unqualified(qualifier),
            },
            // `struct_col.field`
            None => return self.resolve_unqualified(qualifier),
        };

        match source {
            Source::Table(table) => {
                if self.record_column(&table, column) {
                    Ok(())
                } else {
                    Err(NlSqlError::SchemaMismatch(format!(
                        "column '{}.{}' is not in the catalog",
                        table, column
                    )))
                }
            }
            Source::Derived(name) => {
                if self.shape_column(&name, column, 0) {
                    Ok(())
                } else {
                    Err(NlSqlError::SchemaMismatch(format!(
                        "column '{}.{}' is not produced by '{}'",
                        qualifier, column, name
                    )))
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SqlValidator;

impl SqlValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a candidate against the catalog.
    ///
    /// Fails with `UnsafeQuery` unless the text is exactly one read-only query with no comments,
    /// and with `SchemaMismatch` when a table or column is absent from the catalog.
    pub fn validate(&self, candidate: &str, catalog: &SchemaCatalog) -> Result<ValidatedQuery> {
        let dialect = BigQueryDialect {};
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return Err(NlSqlError::UnsafeQuery("candidate SQL is empty".to_string()));
        }

        Self::check_tokens(&dialect, candidate)?;

        let mut statements = Parser::parse_sql(&dialect, candidate).map_err(|e| {
            NlSqlError::UnsafeQuery(format!("candidate is not a parseable statement: {}", e))
        })?;
        if statements.len() != 1 {
            return Err(NlSqlError::UnsafeQuery(format!(
                "expected exactly one statement, found {}",
                statements.len()
            )));
        }
        let statement = statements.remove(0);

        let mut collector = ReferenceCollector::default();
        let _ = statement.visit(&mut collector);

        if let Some(StatementKind::Other(verb)) = collector
            .statements
            .iter()
            .find(|k| matches!(k, StatementKind::Other(_)))
        {
            return Err(NlSqlError::UnsafeQuery(format!(
                "{} statements are not allowed",
                verb
            )));
        }
        if collector.select_into {
            return Err(NlSqlError::UnsafeQuery(
                "SELECT INTO writes data and is not allowed".to_string(),
            ));
        }
        if collector.locking {
            return Err(NlSqlError::UnsafeQuery(
                "locking clauses are not allowed".to_string(),
            ));
        }

        let mut resolver = Resolver::new(catalog, &collector);
        resolver.resolve_relations()?;
        resolver.resolve_wildcards()?;
        for idents in &collector.identifiers {
            resolver.resolve_identifier(&ident_parts(idents))?;
        }

        let ordered = match &statement {
            Statement::Query(query) => !query.order_by.is_empty(),
            _ => false,
        };
        let tables = resolver.tables;
        let columns = resolver.columns;
        let sql = statement.to_string();
        debug!(
            "Validated query over {:?} ({} column references)",
            tables,
            columns.len()
        );

        Ok(ValidatedQuery {
            statement,
            sql,
            tables,
            columns,
            ordered,
        })
    }

    /// Token-level checks the parser cannot see: comments and statement separators.
    fn check_tokens(dialect: &BigQueryDialect, candidate: &str) -> Result<()> {
        let tokens = Tokenizer::new(dialect, candidate)
            .tokenize()
            .map_err(|e| NlSqlError::UnsafeQuery(format!("candidate cannot be tokenized: {}", e)))?;

        let mut after_separator = false;
        for token in &tokens {
            match token {
                Token::Whitespace(Whitespace::SingleLineComment { .. })
                | Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                    return Err(NlSqlError::UnsafeQuery(
                        "comments are not allowed in generated SQL".to_string(),
                    ));
                }
                Token::Whitespace(_) => {}
                Token::SemiColon if after_separator => {
                    return Err(NlSqlError::UnsafeQuery(
                        "multiple statement separators".to_string(),
                    ));
                }
                Token::SemiColon => after_separator = true,
                _ if after_separator => {
                    return Err(NlSqlError::UnsafeQuery(
                        "multiple statements are not allowed".to_string(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::corpus_stats_fixture;

    fn validate(sql: &str) -> Result<ValidatedQuery> {
        SqlValidator::new().validate(sql, &corpus_stats_fixture())
    }

    #[test]
    fn test_accepts_ordered_aggregate() {
        let query = validate(
            "SELECT pub_date, SUM(word_count) AS total_words FROM corpus_stats \
             GROUP BY pub_date ORDER BY pub_date",
        )
        .unwrap();
        assert!(query.has_order_by());
        assert!(query.sql().contains("ORDER BY pub_date"));
        assert!(query.references("corpus_stats", "word_count"));
        assert!(query.references("corpus_stats", "pub_date"));
        assert!(!query.references("corpus_stats", "corpus_id"));
        assert_eq!(query.tables().len(), 1);
    }

    #[test]
    fn test_write_verbs_rejected_regardless_of_casing_and_noise() {
        let candidates = [
            "DROP TABLE corpus_stats",
            "  drop   table corpus_stats  ",
            "DeLeTe FROM corpus_stats WHERE word_count > 0",
            "UPDATE corpus_stats SET word_count = 0",
            "insert into corpus_stats (corpus_id) values ('x')",
            "ALTER TABLE corpus_stats ADD COLUMN extra INT64",
            "/* cleanup */ DROP TABLE corpus_stats",
            "-- note\nDELETE FROM corpus_stats",
            "\n\tUpDaTe corpus_stats SET word_count = 1;",
        ];
        for sql in candidates {
            let err = validate(sql).unwrap_err();
            assert!(
                matches!(err, NlSqlError::UnsafeQuery(_)),
                "{} produced {:?}",
                sql,
                err
            );
        }
    }

    #[test]
    fn test_multi_statement_rejected() {
        let err = validate("SELECT * FROM corpus_stats; DROP TABLE corpus_stats;").unwrap_err();
        assert!(matches!(err, NlSqlError::UnsafeQuery(_)));
        let err = validate("SELECT 1;;").unwrap_err();
        assert!(matches!(err, NlSqlError::UnsafeQuery(_)));
    }

    #[test]
    fn test_single_trailing_semicolon_allowed() {
        assert!(validate("SELECT word_count FROM corpus_stats;").is_ok());
    }

    #[test]
    fn test_comment_hiding_statement_rejected() {
        let err = validate("SELECT word_count FROM corpus_stats -- ; DROP TABLE corpus_stats")
            .unwrap_err();
        assert!(matches!(err, NlSqlError::UnsafeQuery(_)));
    }

    #[test]
    fn test_unknown_table_is_schema_mismatch() {
        let err = validate("SELECT word FROM shakespeare").unwrap_err();
        assert!(matches!(err, NlSqlError::SchemaMismatch(_)));
    }

    #[test]
    fn test_unknown_column_is_schema_mismatch() {
        let err = validate("SELECT author FROM corpus_stats").unwrap_err();
        assert!(matches!(err, NlSqlError::SchemaMismatch(_)));
        let err = validate("SELECT c.author FROM corpus_stats AS c").unwrap_err();
        assert!(matches!(err, NlSqlError::SchemaMismatch(_)));
    }

    #[test]
    fn test_aliases_and_ctes_resolve() {
        let query = validate(
            "WITH totals AS (SELECT corpus_id, SUM(word_count) AS words FROM corpus_stats \
             GROUP BY corpus_id) SELECT t.corpus_id, t.words FROM totals AS t ORDER BY words DESC",
        )
        .unwrap();
        assert!(query.references("corpus_stats", "corpus_id"));

        let query =
            validate("SELECT c.word_count FROM corpus_stats AS c WHERE c.pub_date > '1600-01-01'")
                .unwrap();
        assert!(query.references("corpus_stats", "pub_date"));
        assert!(!query.has_order_by());
    }

    #[test]
    fn test_cte_and_derived_columns_limited_to_projection() {
        let err = validate(
            "WITH t AS (SELECT corpus_id FROM corpus_stats) SELECT t.word_count FROM t",
        )
        .unwrap_err();
        assert!(matches!(err, NlSqlError::SchemaMismatch(_)));

        let err = validate("SELECT d.word_count FROM (SELECT corpus_id FROM corpus_stats) AS d")
            .unwrap_err();
        assert!(matches!(err, NlSqlError::SchemaMismatch(_)));

        let query = validate("SELECT d.word_count FROM (SELECT * FROM corpus_stats) AS d").unwrap();
        assert!(query.references("corpus_stats", "word_count"));
        let err = validate("SELECT d.author FROM (SELECT * FROM corpus_stats) AS d").unwrap_err();
        assert!(matches!(err, NlSqlError::SchemaMismatch(_)));

        let query = validate(
            "WITH base AS (SELECT c.* FROM corpus_stats AS c), \
             recent AS (SELECT * FROM base WHERE pub_date > '1600-01-01') \
             SELECT r.word_count FROM recent AS r",
        )
        .unwrap();
        assert!(query.references("corpus_stats", "word_count"));
    }

    #[test]
    fn test_date_parts_only_as_date_function_arguments() {
        for sql in [
            "SELECT year FROM corpus_stats",
            "SELECT month FROM corpus_stats WHERE day > 3",
            "SELECT year, DATE_TRUNC(pub_date, YEAR) AS y FROM corpus_stats",
            "SELECT COUNT(month) AS n FROM corpus_stats",
        ] {
            let err = validate(sql).unwrap_err();
            assert!(matches!(err, NlSqlError::SchemaMismatch(_)), "{}", sql);
        }

        assert!(validate(
            "SELECT DATE_TRUNC(pub_date, MONTH) AS month_start, SUM(word_count) AS words \
             FROM corpus_stats GROUP BY month_start ORDER BY month_start"
        )
        .is_ok());
        assert!(validate(
            "SELECT corpus_id, DATE_DIFF(pub_date, DATE '1590-01-01', YEAR) AS age \
             FROM corpus_stats"
        )
        .is_ok());
        assert!(validate("SELECT DATE_TRUNC(pub_date, WEEK(MONDAY)) AS wk FROM corpus_stats").is_ok());
    }

    #[test]
    fn test_qualified_wildcard_outside_catalog_is_unsafe() {
        let err = validate("SELECT other.* FROM corpus_stats").unwrap_err();
        assert!(matches!(err, NlSqlError::UnsafeQuery(_)));
        assert!(validate("SELECT corpus_stats.* FROM corpus_stats").is_ok());
    }

    #[test]
    fn test_empty_and_garbage_rejected() {
        assert!(matches!(
            validate("   ").unwrap_err(),
            NlSqlError::UnsafeQuery(_)
        ));
        assert!(matches!(
            validate("please drop everything").unwrap_err(),
            NlSqlError::UnsafeQuery(_)
        ));
    }

    #[test]
    fn test_dataset_qualifier_checked() {
        let catalog = corpus_stats_fixture().with_location("my-project", "samples");
        let validator = SqlValidator::new();
        assert!(validator
            .validate("SELECT word_count FROM samples.corpus_stats", &catalog)
            .is_ok());
        assert!(validator
            .validate("SELECT word_count FROM `my-project.samples.corpus_stats`", &catalog)
            .is_ok());
        let err = validator
            .validate("SELECT word_count FROM secret.corpus_stats", &catalog)
            .unwrap_err();
        assert!(matches!(err, NlSqlError::SchemaMismatch(_)));
    }
}
