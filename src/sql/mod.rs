/// Statement analysis for routing and merging
///
/// Statements are parsed with `sqlparser`'s MySQL dialect and the AST is
/// walked for the few facts the proxy needs: the statement kind, the target
/// table, equality and IN predicates of the top-level WHERE conjunction,
/// inserted rows, assigned columns, ORDER BY and LIMIT. Constructs the walk
/// does not recognize yield less information, which widens the route.

use crate::error::{ShardGateError, ShardGateResult};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, Ident, ObjectName, OrderByExpr, SetExpr, TableFactor,
    TableWithJoins, UnaryOperator, Value,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::{Token, Tokenizer};
use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
    Use,
    Set,
    ShowDatabases,
    Show,
    Other,
}

impl StatementKind {
    /// Statements that may be served by a replica
    pub fn is_read(self) -> bool {
        matches!(
            self,
            StatementKind::Select | StatementKind::Show | StatementKind::ShowDatabases
        )
    }

    pub fn is_insert(self) -> bool {
        matches!(self, StatementKind::Insert | StatementKind::Replace)
    }
}

/// Literal operand of a routing predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Int(i64),
    Str(String),
    /// Anything else: floats, NULL, expressions
    Other,
}

/// `column = literal` or `column IN (literal, ...)` from the WHERE conjunction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub column: String,
    pub values: Vec<Literal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    Column(String),
    /// 1-based select-list position
    Position(usize),
    /// Expression text, matched against result column names
    Expr(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByItem {
    pub key: SortKey,
    pub descending: bool,
}

/// `LIMIT [offset,] count` with the operands as written; they are validated
/// only when the rows are sliced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitClause {
    pub offset: Option<String>,
    pub count: String,
}

impl LimitClause {
    /// (offset, count), rejecting negative or non-numeric operands
    pub fn bounds(&self) -> ShardGateResult<(u64, u64)> {
        let offset = match &self.offset {
            Some(raw) => parse_limit_value(raw)?,
            None => 0,
        };
        Ok((offset, parse_limit_value(&self.count)?))
    }
}

pub fn parse_limit_value(raw: &str) -> ShardGateResult<u64> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ShardGateError::merge(format!("invalid LIMIT value '{}'", raw)))?;
    u64::try_from(value).map_err(|_| ShardGateError::merge(format!("negative LIMIT value {}", value)))
}

/// Rows of an INSERT or REPLACE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Literal>>,
    pub from_select: bool,
}

impl InsertRows {
    /// Values of `column` in every row, `None` if the column is not listed
    pub fn column_values(&self, column: &str) -> Option<Vec<&Literal>> {
        let index = self.columns.iter().position(|c| c == column)?;
        Some(self.rows.iter().map(|row| row.get(index).unwrap_or(&Literal::Other)).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub kind: StatementKind,
    /// Target table, lower case, without schema qualifier
    pub table: Option<String>,
    pub conditions: Vec<Condition>,
    /// Set when the predicates cannot narrow the node set (top-level OR,
    /// joins, unions)
    pub unrestricted: bool,
    pub insert: Option<InsertRows>,
    /// Columns assigned by UPDATE ... SET
    pub assigned_columns: Vec<String>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<LimitClause>,
    /// Target of USE
    pub database: Option<String>,
    /// Parsed SELECT, kept for the per-shard LIMIT rewrite
    query: Option<Box<ast::Query>>,
}

impl Statement {
    fn new(sql: &str, kind: StatementKind) -> Self {
        Self {
            sql: sql.to_string(),
            kind,
            table: None,
            conditions: Vec::new(),
            unrestricted: false,
            insert: None,
            assigned_columns: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            database: None,
            query: None,
        }
    }

    /// Literal values the WHERE conjunction pins `column` to.
    ///
    /// `None` means the column is unconstrained. Several predicates on the
    /// same column keep the values common to all of them.
    pub fn key_values(&self, column: &str) -> Option<Vec<&Literal>> {
        if self.unrestricted {
            return None;
        }
        let mut result: Option<Vec<&Literal>> = None;
        for condition in self.conditions.iter().filter(|c| c.column == column) {
            let values: Vec<&Literal> = condition.values.iter().collect();
            result = Some(match result {
                None => values,
                Some(previous) => {
                    let common: Vec<&Literal> =
                        previous.into_iter().filter(|v| values.contains(v)).collect();
                    if common.is_empty() {
                        values
                    } else {
                        common
                    }
                }
            });
        }
        result
    }

    /// Statement text to send to each shard of a fan-out select.
    ///
    /// `LIMIT o, c` becomes `LIMIT o + c` so the merged rows can be sliced
    /// globally; other statements are sent unchanged.
    pub fn shard_sql(&self) -> ShardGateResult<String> {
        let (limit, query) = match (&self.limit, &self.query, self.kind) {
            (Some(limit), Some(query), StatementKind::Select) => (limit, query),
            _ => return Ok(self.sql.clone()),
        };
        let (offset, count) = limit.bounds()?;
        if limit.offset.is_none() {
            return Ok(self.sql.clone());
        }
        let mut rewritten = query.as_ref().clone();
        rewritten.limit = Some(Expr::Value(Value::Number(
            offset.saturating_add(count).to_string(),
            false,
        )));
        rewritten.offset = None;
        Ok(rewritten.to_string())
    }
}

/// Analyze one statement
pub fn analyze(sql: &str) -> ShardGateResult<Statement> {
    let dialect = MySqlDialect {};
    let mut parsed = match Parser::parse_sql(&dialect, sql) {
        Ok(parsed) => parsed,
        Err(ParserError::TokenizerError(e)) => return Err(syntax_error(e)),
        Err(e) => return unparsed(sql, e),
    };
    match parsed.len() {
        0 => Err(ShardGateError::syntax("Query was empty")),
        1 => Ok(from_ast(sql, parsed.remove(0))),
        _ => Err(ShardGateError::syntax(
            "multiple statements in one query are not supported",
        )),
    }
}

fn syntax_error(e: impl std::fmt::Display) -> ShardGateError {
    ShardGateError::syntax(format!("You have an error in your SQL syntax: {}", e))
}

/// Classify a statement the parser rejects by its leading keywords.
/// Data statements must parse; anything else keeps only its kind.
fn unparsed(sql: &str, error: ParserError) -> ShardGateResult<Statement> {
    let words: Vec<String> = lex(sql)?
        .iter()
        .filter_map(|t| match &t.token {
            Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_ascii_uppercase()),
            _ => None,
        })
        .take(2)
        .collect();
    let kind = match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["SELECT" | "INSERT" | "REPLACE" | "UPDATE" | "DELETE" | "WITH" | "USE", ..] => {
            return Err(syntax_error(error))
        }
        ["SET", ..] => StatementKind::Set,
        ["SHOW", "DATABASES" | "SCHEMAS"] => StatementKind::ShowDatabases,
        ["SHOW", ..] => StatementKind::Show,
        _ => StatementKind::Other,
    };
    log::debug!("statement passed through unparsed as {:?}: {}", kind, error);
    Ok(Statement::new(sql, kind))
}

fn from_ast(sql: &str, parsed: ast::Statement) -> Statement {
    match parsed {
        ast::Statement::Query(query) => select(sql, *query),
        ast::Statement::Insert(insert) => insert_rows(sql, insert),
        ast::Statement::Update {
            table,
            assignments,
            from,
            selection,
            ..
        } => {
            let mut statement = Statement::new(sql, StatementKind::Update);
            statement.table = relation_table(&table.relation);
            statement.unrestricted = !table.joins.is_empty() || from.is_some();
            statement.assigned_columns = assignments
                .iter()
                .filter_map(|a| a.id.last().map(|column| column.value.to_lowercase()))
                .collect();
            where_clause(selection.as_ref(), &mut statement);
            statement
        }
        ast::Statement::Delete(delete) => {
            let mut statement = Statement::new(sql, StatementKind::Delete);
            let from = match &delete.from {
                FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from) => from,
            };
            from_clause(from, &mut statement);
            // multi-table form: DELETE t1 FROM t1 JOIN t2 ...
            if let Some(target) = delete.tables.first() {
                statement.table = table_name(target);
                statement.unrestricted = true;
            }
            if delete.using.is_some() {
                statement.unrestricted = true;
            }
            where_clause(delete.selection.as_ref(), &mut statement);
            statement
        }
        ast::Statement::StartTransaction { .. } => Statement::new(sql, StatementKind::Begin),
        ast::Statement::Commit { .. } => Statement::new(sql, StatementKind::Commit),
        ast::Statement::Rollback {
            savepoint: None, ..
        } => Statement::new(sql, StatementKind::Rollback),
        ast::Statement::Use { db_name } => {
            let mut statement = Statement::new(sql, StatementKind::Use);
            statement.database = Some(db_name.value.to_lowercase());
            statement
        }
        ast::Statement::SetVariable { .. }
        | ast::Statement::SetNames { .. }
        | ast::Statement::SetNamesDefault {}
        | ast::Statement::SetTimeZone { .. }
        | ast::Statement::SetRole { .. }
        | ast::Statement::SetTransaction { .. } => Statement::new(sql, StatementKind::Set),
        ast::Statement::ShowVariable { variable } if lists_databases(&variable) => {
            Statement::new(sql, StatementKind::ShowDatabases)
        }
        ast::Statement::ShowVariable { .. }
        | ast::Statement::ShowVariables { .. }
        | ast::Statement::ShowStatus { .. }
        | ast::Statement::ShowTables { .. }
        | ast::Statement::ShowColumns { .. }
        | ast::Statement::ShowCreate { .. }
        | ast::Statement::ShowCollation { .. }
        | ast::Statement::ShowFunctions { .. } => Statement::new(sql, StatementKind::Show),
        _ => Statement::new(sql, StatementKind::Other),
    }
}

/// `SHOW DATABASES` and `SHOW SCHEMAS` parse as a generic SHOW of one name
fn lists_databases(variable: &[Ident]) -> bool {
    matches!(variable, [only] if only.value.eq_ignore_ascii_case("databases")
        || only.value.eq_ignore_ascii_case("schemas"))
}

fn select(sql: &str, query: ast::Query) -> Statement {
    let mut statement = Statement::new(sql, StatementKind::Select);
    if let Some(select) = leading_select(&query.body) {
        from_clause(&select.from, &mut statement);
        where_clause(select.selection.as_ref(), &mut statement);
    }
    // unions and parenthesized bodies
    if !matches!(query.body.as_ref(), SetExpr::Select(_)) {
        statement.unrestricted = true;
    }

    statement.order_by = query.order_by.iter().filter_map(order_by_item).collect();
    statement.limit = query.limit.as_ref().map(|count| LimitClause {
        offset: query.offset.as_ref().map(|offset| offset.value.to_string()),
        count: count.to_string(),
    });
    statement.query = Some(Box::new(query));
    statement
}

/// First SELECT of a possibly compound query body
fn leading_select(body: &SetExpr) -> Option<&ast::Select> {
    match body {
        SetExpr::Select(select) => Some(select.as_ref()),
        SetExpr::Query(query) => leading_select(&query.body),
        SetExpr::SetOperation { left, .. } => leading_select(left),
        _ => None,
    }
}

/// Target table from the table references; joins, derived tables and
/// several references make the statement unrestricted
fn from_clause(from: &[TableWithJoins], statement: &mut Statement) {
    if let [first, rest @ ..] = from {
        statement.table = relation_table(&first.relation);
        if statement.table.is_none() || !first.joins.is_empty() || !rest.is_empty() {
            statement.unrestricted = true;
        }
    }
}

fn table_name(name: &ObjectName) -> Option<String> {
    name.0.last().map(|part| part.value.to_lowercase())
}

fn relation_table(relation: &TableFactor) -> Option<String> {
    match relation {
        TableFactor::Table { name, .. } => table_name(name),
        _ => None,
    }
}

fn where_clause(selection: Option<&Expr>, statement: &mut Statement) {
    let selection = match selection {
        Some(selection) => selection,
        None => return,
    };
    if matches!(
        unnest(selection),
        Expr::BinaryOp {
            op: BinaryOperator::Or | BinaryOperator::Xor | BinaryOperator::StringConcat,
            ..
        }
    ) {
        statement.unrestricted = true;
    }
    collect_conditions(selection, &mut statement.conditions);
}

fn unnest(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => unnest(inner),
        expr => expr,
    }
}

/// Equality and IN predicates joined by AND; any other conjunct adds nothing
fn collect_conditions(expr: &Expr, conditions: &mut Vec<Condition>) {
    match unnest(expr) {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_conditions(left, conditions);
            collect_conditions(right, conditions);
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let pair = match (column_name(left), literal(right)) {
                (Some(column), Some(value)) => Some((column, value)),
                _ => column_name(right).zip(literal(left)),
            };
            if let Some((column, value)) = pair {
                conditions.push(Condition {
                    column,
                    values: vec![value],
                });
            }
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let values: Option<Vec<Literal>> = list.iter().map(literal).collect();
            if let (Some(column), Some(values)) = (column_name(expr), values) {
                if !values.is_empty() {
                    conditions.push(Condition { column, values });
                }
            }
        }
        _ => {}
    }
}

/// Unqualified lower-case column name
fn column_name(expr: &Expr) -> Option<String> {
    match unnest(expr) {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|part| part.value.to_lowercase()),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Option<Literal> {
    match unnest(expr) {
        Expr::Value(Value::Number(n, _)) => Some(n.parse().map_or(Literal::Other, Literal::Int)),
        Expr::Value(
            Value::SingleQuotedString(s)
            | Value::DoubleQuotedString(s)
            | Value::NationalStringLiteral(s),
        ) => Some(Literal::Str(s.clone())),
        Expr::Value(Value::Placeholder(_)) => None,
        Expr::Value(_) => Some(Literal::Other),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match unnest(expr) {
            Expr::Value(Value::Number(n, _)) => {
                Some(format!("-{}", n).parse().map_or(Literal::Other, Literal::Int))
            }
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Plus,
            expr,
        } => match unnest(expr) {
            Expr::Value(Value::Number(n, _)) => Some(n.parse().map_or(Literal::Other, Literal::Int)),
            _ => None,
        },
        _ => None,
    }
}

fn order_by_item(item: &OrderByExpr) -> Option<OrderByItem> {
    let key = match &item.expr {
        Expr::Value(Value::Null) => return None,
        Expr::Value(Value::Number(n, _)) => match n.parse::<usize>() {
            Ok(position) if position > 0 => SortKey::Position(position),
            _ => SortKey::Expr(n.clone()),
        },
        expr => column_name(expr).map_or_else(|| SortKey::Expr(expr.to_string()), SortKey::Column),
    };
    Some(OrderByItem {
        key,
        descending: item.asc == Some(false),
    })
}

fn insert_rows(sql: &str, insert: ast::Insert) -> Statement {
    let kind = if insert.replace_into {
        StatementKind::Replace
    } else {
        StatementKind::Insert
    };
    let mut statement = Statement::new(sql, kind);
    statement.table = table_name(&insert.table_name);

    let mut rows = InsertRows {
        columns: insert
            .columns
            .iter()
            .map(|column| column.value.to_lowercase())
            .collect(),
        ..Default::default()
    };
    match insert.source.as_deref().map(|source| source.body.as_ref()) {
        Some(SetExpr::Values(values)) => {
            rows.rows = values
                .rows
                .iter()
                .map(|row| row.iter().map(|e| literal(e).unwrap_or(Literal::Other)).collect())
                .collect();
        }
        Some(_) => rows.from_select = true,
        None => {}
    }
    statement.insert = Some(rows);
    statement
}

/// Number of `?` parameter markers
pub fn count_placeholders(sql: &str) -> ShardGateResult<usize> {
    Ok(lex(sql)?
        .iter()
        .filter(|t| matches!(t.token, Token::Placeholder(ref p) if p == "?"))
        .count())
}

/// Replace each `?` marker with the matching rendered literal
pub fn bind_placeholders(sql: &str, values: &[String]) -> ShardGateResult<String> {
    let markers: Vec<Tok> = lex(sql)?
        .into_iter()
        .filter(|t| matches!(t.token, Token::Placeholder(ref p) if p == "?"))
        .collect();
    if markers.len() != values.len() {
        return Err(ShardGateError::protocol(format!(
            "statement has {} parameters, {} supplied",
            markers.len(),
            values.len()
        )));
    }

    let mut bound = String::with_capacity(sql.len() + values.iter().map(String::len).sum::<usize>());
    let mut last = 0;
    for (marker, value) in markers.iter().zip(values) {
        bound.push_str(sql.get(last..marker.start).unwrap_or_default());
        bound.push_str(value);
        last = marker.start + 1;
    }
    bound.push_str(sql.get(last..).unwrap_or_default());
    Ok(bound)
}

/// A significant token with its byte offset in the statement text
#[derive(Debug, Clone)]
struct Tok {
    token: Token,
    start: usize,
}

fn lex(sql: &str) -> ShardGateResult<Vec<Tok>> {
    let dialect = MySqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(syntax_error)?;

    let mut cursor = LineCursor::new(sql);
    Ok(tokens
        .into_iter()
        .map(|t| {
            let start = cursor.seek(t.location.line, t.location.column);
            Tok {
                token: t.token,
                start,
            }
        })
        .filter(|t| !matches!(t.token, Token::Whitespace(_)))
        .collect())
}

/// Converts the tokenizer's 1-based line/column positions into byte offsets
struct LineCursor<'a> {
    chars: Peekable<CharIndices<'a>>,
    line: u64,
    column: u64,
    len: usize,
}

impl<'a> LineCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.char_indices().peekable(),
            line: 1,
            column: 1,
            len: text.len(),
        }
    }

    fn seek(&mut self, line: u64, column: u64) -> usize {
        while (self.line, self.column) < (line, column) {
            match self.chars.next() {
                Some((_, '\n')) => {
                    self.line += 1;
                    self.column = 1;
                }
                Some(_) => self.column += 1,
                None => return self.len,
            }
        }
        self.chars.peek().map_or(self.len, |(i, _)| *i)
    }
}
