use sqlparser::ast::{
    self, Delete, Expr, FromTable, Insert, JoinOperator, LimitClause, OrderByExpr, OrderByKind,
    Query, Select, SetExpr, SetQuantifier, Statement, TableFactor, TableObject, TableWithJoins,
    Update, Value,
};
use std::fmt::Write;

use crate::schema::Table;

pub const BIND_PK: &str = ":#pk";
pub const BIND_VALUES: &str = ":#values";
pub const BIND_MAX_LIMIT: &str = ":#maxLimit";

/// Byte span of a named bind hole inside a rewritten query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindLocation {
    pub offset: usize,
    pub length: usize,
}

/// A rewritten SQL fragment with the named holes (`:#pk`, `:#values`,
/// `:#maxLimit`) the execution layer substitutes at bind time.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub query: String,
    pub bind_locations: Vec<BindLocation>,
}

/// String builder that remembers where bind holes were written.
struct TrackedBuffer {
    buf: String,
    bind_locations: Vec<BindLocation>,
}

impl TrackedBuffer {
    fn new() -> TrackedBuffer {
        TrackedBuffer {
            buf: String::new(),
            bind_locations: Vec::new(),
        }
    }

    fn write_arg(&mut self, name: &str) {
        self.bind_locations.push(BindLocation {
            offset: self.buf.len(),
            length: name.len(),
        });
        self.buf.push_str(name);
    }

    fn parsed_query(self) -> ParsedQuery {
        ParsedQuery {
            query: self.buf,
            bind_locations: self.bind_locations,
        }
    }
}

impl Write for TrackedBuffer {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.buf.push_str(s);
        Ok(())
    }
}

/// Canonical reprint of the statement.
pub fn generate_full_query(stmt: &Statement) -> ParsedQuery {
    let mut buf = TrackedBuffer::new();
    let _ = write!(buf, "{stmt}");
    buf.parsed_query()
}

/// A user SELECT with `limit :#maxLimit` injected iff absent. Lock clauses
/// stay behind the injected limit so the statement keeps parsing.
pub fn generate_select_limit_query(query: &Query) -> ParsedQuery {
    let mut buf = TrackedBuffer::new();
    if query.limit_clause.is_some() {
        let _ = write!(buf, "{query}");
    } else {
        let mut stripped = query.clone();
        let locks = std::mem::take(&mut stripped.locks);
        let _ = write!(buf, "{stripped} limit ");
        buf.write_arg(BIND_MAX_LIMIT);
        for lock in &locks {
            let _ = write!(buf, " {lock}");
        }
    }
    buf.parsed_query()
}

/// The statement with every SELECT's WHERE replaced by `1 != 1`, so the
/// backend returns field metadata without rows. Returns `None` when the
/// rewritten form would still reference bind variables, or when the shape
/// has no impossible form (no FROM, exotic set operations).
pub fn generate_field_query(query: &Query) -> Option<ParsedQuery> {
    if impossible_has_placeholders(&query.body) {
        return None;
    }
    let mut buf = TrackedBuffer::new();
    format_impossible(&mut buf, &query.body)?;
    Some(buf.parsed_query())
}

fn format_impossible(buf: &mut TrackedBuffer, body: &SetExpr) -> Option<()> {
    match body {
        SetExpr::Select(sel) => {
            if sel.from.is_empty() {
                return None;
            }
            let _ = write!(buf, "select ");
            for (i, item) in sel.projection.iter().enumerate() {
                if i > 0 {
                    let _ = write!(buf, ", ");
                }
                let _ = write!(buf, "{item}");
            }
            let _ = write!(buf, " from ");
            for (i, twj) in sel.from.iter().enumerate() {
                if i > 0 {
                    let _ = write!(buf, ", ");
                }
                format_impossible_from(buf, twj)?;
            }
            let _ = write!(buf, " where 1 != 1");
            Some(())
        }
        SetExpr::SetOperation {
            op,
            set_quantifier,
            left,
            right,
        } => {
            format_impossible(buf, left)?;
            let _ = write!(buf, " {}", op.to_string().to_lowercase());
            if matches!(set_quantifier, SetQuantifier::All) {
                let _ = write!(buf, " all");
            }
            let _ = write!(buf, " ");
            format_impossible(buf, right)
        }
        SetExpr::Query(inner) => {
            let _ = write!(buf, "(");
            format_impossible(buf, &inner.body)?;
            let _ = write!(buf, ")");
            Some(())
        }
        _ => None,
    }
}

fn format_impossible_from(buf: &mut TrackedBuffer, twj: &TableWithJoins) -> Option<()> {
    let _ = write!(buf, "{}", twj.relation);
    for join in &twj.joins {
        match &join.join_operator {
            // Left/right joins need an ON clause to stay valid.
            JoinOperator::Left(_) | JoinOperator::LeftOuter(_) => {
                let _ = write!(buf, " left join {} on 1 != 1", join.relation);
            }
            JoinOperator::Right(_) | JoinOperator::RightOuter(_) => {
                let _ = write!(buf, " right join {} on 1 != 1", join.relation);
            }
            JoinOperator::Join(_) | JoinOperator::Inner(_) => {
                let _ = write!(buf, " join {}", join.relation);
            }
            JoinOperator::CrossJoin(_) => {
                let _ = write!(buf, " cross join {}", join.relation);
            }
            _ => return None,
        }
    }
    Some(())
}

/// `select <all columns> from <from> where :#pk` — fetches full rows for the
/// PK tuples a plan identified.
pub fn generate_select_outer_query(from: &TableWithJoins, table: &Table) -> ParsedQuery {
    let mut buf = TrackedBuffer::new();
    let _ = write!(buf, "select ");
    write_column_list(&mut buf, table);
    let _ = write!(buf, " from {from} where ");
    buf.write_arg(BIND_PK);
    buf.parsed_query()
}

pub fn generate_insert_outer_query(ins: &Insert) -> ParsedQuery {
    let mut buf = TrackedBuffer::new();
    let verb = if ins.replace_into { "replace" } else { "insert" };
    let _ = write!(buf, "{verb} ");
    if ins.ignore {
        let _ = write!(buf, "ignore ");
    }
    let _ = write!(buf, "into ");
    if let TableObject::TableName(name) = &ins.table {
        let _ = write!(buf, "{name}");
    }
    if !ins.columns.is_empty() {
        let _ = write!(buf, "(");
        for (i, col) in ins.columns.iter().enumerate() {
            if i > 0 {
                let _ = write!(buf, ", ");
            }
            let _ = write!(buf, "{col}");
        }
        let _ = write!(buf, ")");
    }
    let _ = write!(buf, " values ");
    buf.write_arg(BIND_VALUES);
    buf.parsed_query()
}

pub fn generate_update_outer_query(upd: &Update) -> ParsedQuery {
    let mut buf = TrackedBuffer::new();
    let _ = write!(buf, "update {} set ", upd.table.relation);
    for (i, assignment) in upd.assignments.iter().enumerate() {
        if i > 0 {
            let _ = write!(buf, ", ");
        }
        let _ = write!(buf, "{assignment}");
    }
    let _ = write!(buf, " where ");
    buf.write_arg(BIND_PK);
    buf.parsed_query()
}

pub fn generate_delete_outer_query(del: &Delete) -> ParsedQuery {
    let mut buf = TrackedBuffer::new();
    let _ = write!(buf, "delete from {} where ", delete_table(del));
    buf.write_arg(BIND_PK);
    buf.parsed_query()
}

/// Limit forwarded into a PK subquery.
pub(crate) enum LimitForward<'a> {
    FromQuery(&'a LimitClause),
    FromDml(&'a Expr),
    /// No user limit: the implicit `:#maxLimit` cap.
    Default,
}

pub(crate) fn generate_select_subquery(
    sel: &Select,
    query: &Query,
    table: &Table,
    index: &str,
) -> ParsedQuery {
    let order = match query.order_by.as_ref().map(|o| &o.kind) {
        Some(OrderByKind::Expressions(exprs)) => exprs.as_slice(),
        _ => &[],
    };
    let limit = match &query.limit_clause {
        Some(lc) => LimitForward::FromQuery(lc),
        None => LimitForward::Default,
    };
    generate_subquery(
        &table.indexes[0].columns,
        &sel.from[0].relation,
        Some(index),
        sel.selection.as_ref(),
        order,
        limit,
        false,
    )
}

pub(crate) fn generate_update_subquery(upd: &Update, table: &Table) -> ParsedQuery {
    let limit = match &upd.limit {
        Some(e) => LimitForward::FromDml(e),
        None => LimitForward::Default,
    };
    generate_subquery(
        &table.indexes[0].columns,
        &upd.table.relation,
        None,
        upd.selection.as_ref(),
        &[],
        limit,
        true,
    )
}

pub(crate) fn generate_delete_subquery(del: &Delete, table: &Table) -> ParsedQuery {
    let limit = match &del.limit {
        Some(e) => LimitForward::FromDml(e),
        None => LimitForward::Default,
    };
    generate_subquery(
        &table.indexes[0].columns,
        delete_table(del),
        None,
        del.selection.as_ref(),
        &del.order_by,
        limit,
        true,
    )
}

/// `select <pk columns> from <table> [use index] [where] [order by] limit ...
/// [for update]` — the pre-read that resolves affected PK tuples.
fn generate_subquery(
    pk_names: &[String],
    table: &TableFactor,
    index: Option<&str>,
    selection: Option<&Expr>,
    order: &[OrderByExpr],
    limit: LimitForward,
    for_update: bool,
) -> ParsedQuery {
    let mut buf = TrackedBuffer::new();
    let _ = write!(buf, "select ");
    for (i, name) in pk_names.iter().enumerate() {
        if i > 0 {
            let _ = write!(buf, ", ");
        }
        let _ = write!(buf, "{name}");
    }
    let _ = write!(buf, " from {table}");
    if let Some(index) = index {
        let _ = write!(buf, " use index ({index})");
    }
    if let Some(selection) = selection {
        let _ = write!(buf, " where {selection}");
    }
    if !order.is_empty() {
        let _ = write!(buf, " order by ");
        for (i, o) in order.iter().enumerate() {
            if i > 0 {
                let _ = write!(buf, ", ");
            }
            let _ = write!(buf, "{o}");
        }
    }
    match limit {
        LimitForward::FromQuery(lc) => match lc {
            LimitClause::LimitOffset {
                limit: Some(l),
                offset: None,
                ..
            } => {
                let _ = write!(buf, " limit {l}");
            }
            LimitClause::LimitOffset {
                limit: Some(l),
                offset: Some(o),
                ..
            } => {
                let _ = write!(buf, " limit {}, {l}", o.value);
            }
            LimitClause::OffsetCommaLimit { offset, limit } => {
                let _ = write!(buf, " limit {offset}, {limit}");
            }
            _ => {
                let _ = write!(buf, " limit ");
                buf.write_arg(BIND_MAX_LIMIT);
            }
        },
        LimitForward::FromDml(e) => {
            let _ = write!(buf, " limit {e}");
        }
        LimitForward::Default => {
            let _ = write!(buf, " limit ");
            buf.write_arg(BIND_MAX_LIMIT);
        }
    }
    if for_update {
        let _ = write!(buf, " for update");
    }
    buf.parsed_query()
}

fn write_column_list(buf: &mut TrackedBuffer, table: &Table) {
    for (i, col) in table.columns.iter().enumerate() {
        if i > 0 {
            let _ = write!(buf, ", ");
        }
        let _ = write!(buf, "{}", col.name);
    }
}

pub(crate) fn delete_table(del: &Delete) -> &TableFactor {
    let tables = match &del.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    &tables[0].relation
}

// Bind-variable detection, used to suppress field queries that would still
// carry user placeholders after the rewrite. Only the parts the impossible
// form reprints count: projections and table factors. WHERE, GROUP BY and
// join constraints are dropped or replaced, so their placeholders vanish.

fn impossible_has_placeholders(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(sel) => {
            sel.projection.iter().any(|item| match item {
                ast::SelectItem::UnnamedExpr(e) => expr_has_placeholders(e),
                ast::SelectItem::ExprWithAlias { expr, .. } => expr_has_placeholders(expr),
                _ => false,
            }) || sel.from.iter().any(|twj| {
                table_factor_has_placeholders(&twj.relation)
                    || twj
                        .joins
                        .iter()
                        .any(|j| table_factor_has_placeholders(&j.relation))
            })
        }
        SetExpr::SetOperation { left, right, .. } => {
            impossible_has_placeholders(left) || impossible_has_placeholders(right)
        }
        SetExpr::Query(q) => impossible_has_placeholders(&q.body),
        _ => false,
    }
}

fn query_has_placeholders(query: &Query) -> bool {
    if set_expr_has_placeholders(&query.body) {
        return true;
    }
    if let Some(order_by) = &query.order_by {
        if let OrderByKind::Expressions(exprs) = &order_by.kind {
            if exprs.iter().any(|o| expr_has_placeholders(&o.expr)) {
                return true;
            }
        }
    }
    match &query.limit_clause {
        Some(LimitClause::LimitOffset { limit, offset, .. }) => {
            limit.as_ref().is_some_and(expr_has_placeholders)
                || offset.as_ref().is_some_and(|o| expr_has_placeholders(&o.value))
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            expr_has_placeholders(offset) || expr_has_placeholders(limit)
        }
        None => false,
    }
}

fn set_expr_has_placeholders(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(sel) => {
            let projection = sel.projection.iter().any(|item| match item {
                ast::SelectItem::UnnamedExpr(e) => expr_has_placeholders(e),
                ast::SelectItem::ExprWithAlias { expr, .. } => expr_has_placeholders(expr),
                _ => false,
            });
            if projection {
                return true;
            }
            if sel.selection.as_ref().is_some_and(expr_has_placeholders) {
                return true;
            }
            if sel.having.as_ref().is_some_and(expr_has_placeholders) {
                return true;
            }
            if let ast::GroupByExpr::Expressions(exprs, _) = &sel.group_by {
                if exprs.iter().any(expr_has_placeholders) {
                    return true;
                }
            }
            sel.from.iter().any(from_has_placeholders)
        }
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_has_placeholders(left) || set_expr_has_placeholders(right)
        }
        SetExpr::Query(q) => query_has_placeholders(q),
        SetExpr::Values(values) => values
            .rows
            .iter()
            .any(|row| row.iter().any(expr_has_placeholders)),
        _ => false,
    }
}

fn from_has_placeholders(twj: &TableWithJoins) -> bool {
    if table_factor_has_placeholders(&twj.relation) {
        return true;
    }
    twj.joins.iter().any(|join| {
        if table_factor_has_placeholders(&join.relation) {
            return true;
        }
        match &join.join_operator {
            JoinOperator::Join(c)
            | JoinOperator::Inner(c)
            | JoinOperator::Left(c)
            | JoinOperator::LeftOuter(c)
            | JoinOperator::Right(c)
            | JoinOperator::RightOuter(c)
            | JoinOperator::FullOuter(c) => match c {
                ast::JoinConstraint::On(e) => expr_has_placeholders(e),
                _ => false,
            },
            _ => false,
        }
    })
}

fn table_factor_has_placeholders(factor: &TableFactor) -> bool {
    match factor {
        TableFactor::Derived { subquery, .. } => query_has_placeholders(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => from_has_placeholders(table_with_joins),
        _ => false,
    }
}

fn expr_has_placeholders(expr: &Expr) -> bool {
    match expr {
        Expr::Value(v) => matches!(v.value, Value::Placeholder(_)),
        Expr::BinaryOp { left, right, .. } => {
            expr_has_placeholders(left) || expr_has_placeholders(right)
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr) => expr_has_placeholders(expr),
        Expr::Cast { expr, .. } => expr_has_placeholders(expr),
        Expr::InList { expr, list, .. } => {
            expr_has_placeholders(expr) || list.iter().any(expr_has_placeholders)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            expr_has_placeholders(expr)
                || expr_has_placeholders(low)
                || expr_has_placeholders(high)
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            expr_has_placeholders(expr) || expr_has_placeholders(pattern)
        }
        Expr::Tuple(exprs) => exprs.iter().any(expr_has_placeholders),
        Expr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => {
            operand.as_deref().is_some_and(expr_has_placeholders)
                || conditions.iter().any(|c| {
                    expr_has_placeholders(&c.condition) || expr_has_placeholders(&c.result)
                })
                || else_result.as_deref().is_some_and(expr_has_placeholders)
        }
        Expr::Function(f) => match &f.args {
            ast::FunctionArguments::List(list) => list.args.iter().any(|arg| match arg {
                ast::FunctionArg::Named { arg, .. }
                | ast::FunctionArg::ExprNamed { arg, .. }
                | ast::FunctionArg::Unnamed(arg) => match arg {
                    ast::FunctionArgExpr::Expr(e) => expr_has_placeholders(e),
                    _ => false,
                },
            }),
            ast::FunctionArguments::Subquery(q) => query_has_placeholders(q),
            ast::FunctionArguments::None => false,
        },
        Expr::InSubquery { expr, subquery, .. } => {
            expr_has_placeholders(expr) || query_has_placeholders(subquery)
        }
        Expr::Subquery(q) => query_has_placeholders(q),
        Expr::Exists { subquery, .. } => query_has_placeholders(subquery),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::MySqlDialect;
    use sqlparser::parser::Parser;

    fn parse_query(sql: &str) -> Query {
        let mut stmts = Parser::parse_sql(&MySqlDialect {}, sql).unwrap();
        match stmts.remove(0) {
            Statement::Query(q) => *q,
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn field_query_replaces_where() {
        let q = parse_query("select a, b from t where pk = 5");
        let fq = generate_field_query(&q).unwrap();
        assert_eq!(fq.query, "select a, b from t where 1 != 1");
        assert!(fq.bind_locations.is_empty());
    }

    #[test]
    fn field_query_left_join_keeps_on_clause() {
        let q = parse_query("select a from t left join u on t.id = u.id where a = 1");
        let fq = generate_field_query(&q).unwrap();
        assert_eq!(fq.query, "select a from t left join u on 1 != 1 where 1 != 1");
    }

    #[test]
    fn field_query_suppressed_on_bind_vars() {
        let q = parse_query("select a + ? from t where pk = 5");
        assert!(generate_field_query(&q).is_none());
    }

    #[test]
    fn select_limit_query_injects_cap() {
        let q = parse_query("select a from t where pk = 5");
        let pq = generate_select_limit_query(&q);
        assert!(pq.query.ends_with(" limit :#maxLimit"));
        assert_eq!(pq.bind_locations.len(), 1);
        let loc = pq.bind_locations[0];
        assert_eq!(&pq.query[loc.offset..loc.offset + loc.length], ":#maxLimit");

        let q = parse_query("select a from t where pk = 5 limit 10");
        let pq = generate_select_limit_query(&q);
        assert!(pq.bind_locations.is_empty());
    }
}
