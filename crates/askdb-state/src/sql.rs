//! SQL text inspection
//!
//! Queries are parsed with `sqlparser` in the DuckDB dialect. Anything that
//! fails to parse is treated as unsafe.

use sqlparser::ast::{Query, Statement, TableFactor, Visit, Visitor};
use sqlparser::dialect::{DuckDbDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::HashSet;
use std::ops::ControlFlow;

fn parse(sql: &str) -> Option<Vec<Statement>> {
    Parser::parse_sql(&DuckDbDialect {}, sql).ok()
}

/// Strip Markdown fences, surrounding whitespace and trailing semicolons
pub fn normalize(sql: &str) -> String {
    let mut text = sql.trim();

    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string (```sql) up to the first newline
        text = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        };
        text = text.trim_end();
        text = text.strip_suffix("```").unwrap_or(text);
    }

    text.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace()).to_string()
}

/// Counts statements that are not plain queries, nested ones included
#[derive(Default)]
struct WriteFinder {
    writes: usize,
}

impl Visitor for WriteFinder {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<()> {
        if !matches!(statement, Statement::Query(_)) {
            self.writes += 1;
        }
        ControlFlow::Continue(())
    }
}

/// True when a statement separator is followed by more text
///
/// Escape strings (`E'\''`) and dollar quoting move where a literal ends, so
/// the text is also lexed the PostgreSQL way and a separator seen by either
/// lexer counts.
fn has_trailing_statement(sql: &str) -> bool {
    let Ok(tokens) = Tokenizer::new(&PostgreSqlDialect {}, sql).tokenize() else {
        return true;
    };

    let mut significant = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF));
    if !significant.any(|t| *t == Token::SemiColon) {
        return false;
    }
    significant.any(|t| *t != Token::SemiColon)
}

/// True when the text is a single statement that only reads data
pub fn is_read_only(sql: &str) -> bool {
    let Some(statements) = parse(sql) else {
        return false;
    };
    let [statement @ Statement::Query(_)] = statements.as_slice() else {
        return false;
    };

    // Data-modifying CTEs nest a second statement inside the query
    let mut finder = WriteFinder::default();
    let _ = statement.visit(&mut finder);

    finder.writes == 0 && !has_trailing_statement(sql)
}

/// Base tables in FROM/JOIN clauses, skipping CTE names and table functions
#[derive(Default)]
struct RelationCollector {
    tables: Vec<String>,
    ctes: HashSet<String>,
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_ascii_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<()> {
        if let TableFactor::Table { name, args: None, .. } = factor {
            // schema.table keeps the last component
            if let Some(ident) = name.0.last() {
                self.tables.push(ident.value.clone());
            }
        }
        ControlFlow::Continue(())
    }
}

/// Tables a query reads from, in order of first appearance
///
/// Unparseable text yields no tables.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let Some(statements) = parse(sql) else {
        return Vec::new();
    };

    let mut collector = RelationCollector::default();
    let _ = statements.visit(&mut collector);

    let mut seen = HashSet::new();
    collector
        .tables
        .into_iter()
        .filter(|name| {
            let key = name.to_ascii_lowercase();
            !collector.ctes.contains(&key) && seen.insert(key)
        })
        .collect()
}
