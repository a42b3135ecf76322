use sqlparser::ast::{
    self, BinaryOperator, Delete, Expr, FromTable, Insert, LimitClause, ObjectName,
    ObjectNamePart, Query, Select, SetExpr, Statement, TableFactor, TableObject, TableWithJoins,
    Update, Value,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::rewrite::{self, ParsedQuery};
use crate::schema::{Index, SqlValue, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
    PassSelect,
    PkEqual,
    PkIn,
    SelectSubquery,
    PassDml,
    DmlPk,
    DmlSubquery,
    InsertPk,
    InsertSubquery,
    Set,
    Ddl,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonType {
    Default,
    Select,
    Table,
    TableNoindex,
    PkChange,
    HasHints,
    Upsert,
}

/// One element of a PK tuple: a literal sourced from the query, a bind
/// variable name, or no value at all.
#[derive(Debug, Clone, PartialEq)]
pub enum PkValue {
    Literal(SqlValue),
    Bind(String),
    Null,
}

/// PK values carried by a plan. The shape depends on the plan kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PkValues {
    #[default]
    None,
    /// `pk-equal` / `dml-pk`: one value per PK column.
    Tuple(Vec<PkValue>),
    /// `pk-in` / `dml-pk` over IN: the values of the single PK column.
    List(Vec<PkValue>),
    /// `insert-pk`: one PK tuple per VALUES row.
    Rows(Vec<Vec<PkValue>>),
}

/// The product of analysis: a classification plus the rewritten fragments
/// needed to execute the statement. Read-only once built.
#[derive(Debug, Clone)]
pub struct ExecPlan {
    pub plan_id: PlanType,
    pub reason: ReasonType,
    pub table_name: String,

    /// Fetches field metadata without rows; `None` when suppressed.
    pub field_query: Option<ParsedQuery>,
    /// Set for all plans that carry a statement.
    pub full_query: Option<ParsedQuery>,

    /// For PK plans only `outer_query` is set; subquery plans also set
    /// `subquery`. `index_used` is set for `select-subquery`.
    pub outer_query: Option<ParsedQuery>,
    pub subquery: Option<ParsedQuery>,
    pub index_used: String,

    /// For selects: columns returned. For `insert-subquery`: columns inserted.
    pub column_numbers: Vec<usize>,

    pub pk_values: PkValues,

    /// `pk-in`: forwarded LIMIT value.
    pub limit: Option<PkValue>,

    /// For updates whose SET writes a PK column: the new values, in
    /// `pk_columns` order, `None` at untouched positions.
    pub secondary_pk_values: Vec<Option<PkValue>>,

    /// For `insert-subquery`: positions of the PK columns in the subquery's
    /// projection.
    pub subquery_pk_columns: Vec<usize>,

    pub set_key: String,
    pub set_value: Option<SqlValue>,
}

impl ExecPlan {
    fn new(plan_id: PlanType) -> ExecPlan {
        ExecPlan {
            plan_id,
            reason: ReasonType::Default,
            table_name: String::new(),
            field_query: None,
            full_query: None,
            outer_query: None,
            subquery: None,
            index_used: String::new(),
            column_numbers: Vec::new(),
            pk_values: PkValues::None,
            limit: None,
            secondary_pk_values: Vec::new(),
            subquery_pk_columns: Vec::new(),
            set_key: String::new(),
            set_value: None,
        }
    }
}

/// Schema lookup the analyser resolves table names through. Must be
/// thread-safe for callers analysing in parallel.
pub type TableGetter<'a> = dyn Fn(&str) -> Option<Arc<Table>> + 'a;

/// Parses one statement and classifies it into an execution plan.
pub fn get_exec_plan(sql: &str, get_table: &TableGetter) -> Result<ExecPlan> {
    let mut statements = Parser::parse_sql(&MySqlDialect {}, sql)?;
    if statements.len() != 1 {
        return Err(Error::NotSupported(
            "expected exactly one statement".into(),
        ));
    }
    let statement = statements.remove(0);
    let plan = analyze_statement(&statement, get_table)?;
    if plan.plan_id == PlanType::PassDml {
        warn!("pass-dml: {sql}");
    }
    Ok(plan)
}

fn analyze_statement(statement: &Statement, get_table: &TableGetter) -> Result<ExecPlan> {
    match statement {
        Statement::Query(query) => analyze_query(statement, query, get_table),
        Statement::Insert(insert) => analyze_insert(statement, insert, get_table),
        Statement::Update(update) => analyze_update(statement, update, get_table),
        Statement::Delete(delete) => analyze_delete(statement, delete, get_table),
        Statement::Set(set) => Ok(analyze_set(statement, set)),
        _ if is_ddl(statement) => Ok(analyze_ddl(statement)),
        _ => Ok(ExecPlan::new(PlanType::Other)),
    }
}

fn is_ddl(statement: &Statement) -> bool {
    matches!(
        statement,
        Statement::CreateTable { .. }
            | Statement::AlterTable { .. }
            | Statement::Drop { .. }
            | Statement::Truncate { .. }
            | Statement::CreateIndex { .. }
            | Statement::CreateView { .. }
            | Statement::RenameTable { .. }
    )
}

fn analyze_ddl(statement: &Statement) -> ExecPlan {
    let mut plan = ExecPlan::new(PlanType::Ddl);
    plan.full_query = Some(rewrite::generate_full_query(statement));
    if let Some(name) = ddl_table_name(statement) {
        plan.table_name = name;
    }
    plan
}

fn ddl_table_name(statement: &Statement) -> Option<String> {
    match statement {
        Statement::CreateTable(create) => object_name_last(&create.name),
        Statement::AlterTable(alter) => object_name_last(&alter.name),
        Statement::Drop { names, .. } => names.first().and_then(object_name_last),
        Statement::Truncate(truncate) => {
            truncate.table_names.first().and_then(|t| object_name_last(&t.name))
        }
        Statement::CreateIndex(create) => object_name_last(&create.table_name),
        Statement::CreateView(create_view) => object_name_last(&create_view.name),
        // Schema reload happens under the name being renamed to.
        Statement::RenameTable(renames) => {
            renames.first().and_then(|r| object_name_last(&r.new_name))
        }
        _ => None,
    }
}

fn analyze_query(statement: &Statement, query: &Query, get_table: &TableGetter) -> Result<ExecPlan> {
    match query.body.as_ref() {
        SetExpr::Select(select) => analyze_select(query, select, get_table),
        _ => {
            // Unions and friends pass straight through.
            let mut plan = ExecPlan::new(PlanType::PassSelect);
            plan.reason = ReasonType::Select;
            plan.field_query = rewrite::generate_field_query(query);
            plan.full_query = Some(rewrite::generate_full_query(statement));
            Ok(plan)
        }
    }
}

fn analyze_select(query: &Query, select: &Select, get_table: &TableGetter) -> Result<ExecPlan> {
    let mut plan = ExecPlan::new(PlanType::PassSelect);
    plan.field_query = rewrite::generate_field_query(query);
    plan.full_query = Some(rewrite::generate_select_limit_query(query));

    let Some(table_expr) = single_table_expr(&select.from) else {
        plan.reason = ReasonType::Table;
        return Ok(plan);
    };
    let Some((table_name, has_hints)) = table_factor_parts(&table_expr.relation) else {
        plan.reason = ReasonType::Table;
        return Ok(plan);
    };
    let Some(table) = get_table(&table_name) else {
        return Err(Error::Schema(format!(
            "table {table_name} not found in schema"
        )));
    };
    plan.table_name = table.name.clone();

    if !table.has_primary() {
        plan.reason = ReasonType::TableNoindex;
        return Ok(plan);
    }

    let Some(column_numbers) = analyze_select_exprs(&select.projection, &table)? else {
        plan.reason = ReasonType::Select;
        return Ok(plan);
    };
    plan.column_numbers = column_numbers;

    if has_hints {
        plan.reason = ReasonType::HasHints;
        return Ok(plan);
    }

    let Some(conditions) = select.selection.as_ref().and_then(analyze_where) else {
        plan.reason = ReasonType::TableNoindex;
        return Ok(plan);
    };

    if let Some(pk_values) = get_pk_values(&conditions, &table.indexes[0]) {
        plan.index_used = "PRIMARY".into();
        plan.outer_query = Some(rewrite::generate_select_outer_query(table_expr, &table));
        if let PkValues::List(_) = pk_values {
            plan.plan_id = PlanType::PkIn;
            plan.limit = limit_value(query);
        } else {
            plan.plan_id = PlanType::PkEqual;
        }
        plan.pk_values = pk_values;
        return Ok(plan);
    }

    if let Some(index) = index_match(&conditions, &table) {
        plan.plan_id = PlanType::SelectSubquery;
        plan.subquery = Some(rewrite::generate_select_subquery(
            select, query, &table, &index,
        ));
        plan.outer_query = Some(rewrite::generate_select_outer_query(table_expr, &table));
        plan.index_used = index;
        return Ok(plan);
    }

    plan.reason = ReasonType::TableNoindex;
    Ok(plan)
}

fn analyze_insert(
    statement: &Statement,
    insert: &Insert,
    get_table: &TableGetter,
) -> Result<ExecPlan> {
    let mut plan = ExecPlan::new(PlanType::PassDml);
    plan.full_query = Some(rewrite::generate_full_query(statement));

    let TableObject::TableName(name) = &insert.table else {
        plan.reason = ReasonType::Table;
        return Ok(plan);
    };
    let Some(table) = object_name_last(name).and_then(|n| get_table(&n)) else {
        plan.reason = ReasonType::Table;
        return Ok(plan);
    };
    plan.table_name = table.name.clone();

    if !table.has_primary() {
        plan.reason = ReasonType::TableNoindex;
        return Ok(plan);
    }

    // An empty column list means the full column list in table order.
    let columns: Vec<String> = if insert.columns.is_empty() {
        table.column_names()
    } else {
        insert.columns.iter().map(|c| c.value.clone()).collect()
    };
    let mut column_numbers = Vec::with_capacity(columns.len());
    for column in &columns {
        let Some(idx) = table.find_column(column) else {
            return Err(Error::Schema(format!(
                "column {column} not found in table {}",
                table.name
            )));
        };
        column_numbers.push(idx);
    }
    plan.column_numbers = column_numbers;

    // Position of each PK column within the insert column list.
    let pk_positions: Vec<Option<usize>> = table
        .pk_columns
        .iter()
        .map(|&ci| {
            let pk_name = &table.columns[ci].name;
            columns.iter().position(|c| c.eq_ignore_ascii_case(pk_name))
        })
        .collect();

    if insert.on.is_some() {
        plan.reason = ReasonType::Upsert;
        return Ok(plan);
    }
    let Some(source) = &insert.source else {
        return Ok(plan);
    };

    match source.body.as_ref() {
        SetExpr::Values(values) => {
            let Some(rows) = insert_pk_values(&values.rows, &pk_positions, &table) else {
                // Non-literal values in a PK position.
                return Ok(plan);
            };
            plan.plan_id = PlanType::InsertPk;
            plan.outer_query = Some(rewrite::generate_insert_outer_query(insert));
            plan.pk_values = PkValues::Rows(rows);
        }
        SetExpr::Select(_) | SetExpr::Query(_) | SetExpr::SetOperation { .. } => {
            let mut subquery_pk_columns = Vec::with_capacity(pk_positions.len());
            for position in &pk_positions {
                // The sub-source must supply every PK column.
                let Some(position) = position else {
                    return Ok(plan);
                };
                subquery_pk_columns.push(*position);
            }
            plan.plan_id = PlanType::InsertSubquery;
            plan.subquery = Some(rewrite::generate_select_limit_query(source));
            plan.outer_query = Some(rewrite::generate_insert_outer_query(insert));
            plan.subquery_pk_columns = subquery_pk_columns;
        }
        _ => {}
    }
    Ok(plan)
}

fn analyze_update(
    statement: &Statement,
    update: &Update,
    get_table: &TableGetter,
) -> Result<ExecPlan> {
    let mut plan = ExecPlan::new(PlanType::PassDml);
    plan.full_query = Some(rewrite::generate_full_query(statement));

    if !update.table.joins.is_empty() {
        plan.reason = ReasonType::Table;
        return Ok(plan);
    }
    let Some(table) = table_factor_parts(&update.table.relation)
        .and_then(|(name, _)| get_table(&name))
    else {
        plan.reason = ReasonType::Table;
        return Ok(plan);
    };
    plan.table_name = table.name.clone();

    if !table.has_primary() {
        plan.reason = ReasonType::TableNoindex;
        return Ok(plan);
    }

    let Some(secondary) = analyze_update_assignments(&update.assignments, &table) else {
        // A PK column is written with a value analysis cannot carry.
        plan.reason = ReasonType::PkChange;
        return Ok(plan);
    };
    plan.secondary_pk_values = secondary;
    let pk_change = plan.secondary_pk_values.iter().any(|v| v.is_some());

    let Some(selection) = &update.selection else {
        return Ok(plan);
    };
    plan.outer_query = Some(rewrite::generate_update_outer_query(update));

    if let Some(pk_values) = analyze_where(selection)
        .and_then(|conditions| get_pk_values(&conditions, &table.indexes[0]))
    {
        plan.plan_id = PlanType::DmlPk;
        plan.pk_values = pk_values;
    } else {
        plan.plan_id = PlanType::DmlSubquery;
        plan.subquery = Some(rewrite::generate_update_subquery(update, &table));
    }
    if pk_change {
        plan.reason = ReasonType::PkChange;
    }
    Ok(plan)
}

fn analyze_delete(
    statement: &Statement,
    delete: &Delete,
    get_table: &TableGetter,
) -> Result<ExecPlan> {
    let mut plan = ExecPlan::new(PlanType::PassDml);
    plan.full_query = Some(rewrite::generate_full_query(statement));

    let from_tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if from_tables.len() != 1
        || !from_tables[0].joins.is_empty()
        || !delete.tables.is_empty()
        || delete.using.is_some()
    {
        plan.reason = ReasonType::Table;
        return Ok(plan);
    }
    let Some(table) = table_factor_parts(&from_tables[0].relation)
        .and_then(|(name, _)| get_table(&name))
    else {
        plan.reason = ReasonType::Table;
        return Ok(plan);
    };
    plan.table_name = table.name.clone();

    if !table.has_primary() {
        plan.reason = ReasonType::TableNoindex;
        return Ok(plan);
    }

    let Some(selection) = &delete.selection else {
        return Ok(plan);
    };
    plan.outer_query = Some(rewrite::generate_delete_outer_query(delete));

    if let Some(pk_values) = analyze_where(selection)
        .and_then(|conditions| get_pk_values(&conditions, &table.indexes[0]))
    {
        plan.plan_id = PlanType::DmlPk;
        plan.pk_values = pk_values;
    } else {
        plan.plan_id = PlanType::DmlSubquery;
        plan.subquery = Some(rewrite::generate_delete_subquery(delete, &table));
    }
    Ok(plan)
}

fn analyze_set(statement: &Statement, set: &ast::Set) -> ExecPlan {
    let mut plan = ExecPlan::new(PlanType::Set);
    plan.full_query = Some(rewrite::generate_full_query(statement));
    if let ast::Set::SingleAssignment {
        variable, values, ..
    } = set
    {
        if values.len() == 1 {
            if let (Some(key), Some(value)) =
                (object_name_last(variable), literal_value(&values[0]))
            {
                plan.set_key = key;
                plan.set_value = Some(value);
                return plan;
            }
        }
    }
    // Anything but a single literal assignment passes through.
    plan.plan_id = PlanType::PassDml;
    plan
}

// WHERE analysis: a conjunction of `col = value` / `col in (...)` terms.

enum ConditionOp {
    Eq,
    In,
}

struct Condition {
    column: String,
    op: ConditionOp,
    values: Vec<PkValue>,
}

fn analyze_where(expr: &Expr) -> Option<Vec<Condition>> {
    let mut conditions = Vec::new();
    collect_conjuncts(expr, &mut conditions)?;
    Some(conditions)
}

fn collect_conjuncts(expr: &Expr, acc: &mut Vec<Condition>) -> Option<()> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_conjuncts(left, acc)?;
            collect_conjuncts(right, acc)
        }
        Expr::Nested(inner) => collect_conjuncts(inner, acc),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let column = column_name(left)?;
            let value = pk_value_from_expr(right)?;
            acc.push(Condition {
                column,
                op: ConditionOp::Eq,
                values: vec![value],
            });
            Some(())
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let column = column_name(expr)?;
            let values = list
                .iter()
                .map(pk_value_from_expr)
                .collect::<Option<Vec<_>>>()?;
            acc.push(Condition {
                column,
                op: ConditionOp::In,
                values,
            });
            Some(())
        }
        _ => None,
    }
}

fn get_pk_values(conditions: &[Condition], pk_index: &Index) -> Option<PkValues> {
    if conditions.len() == 1 && matches!(conditions[0].op, ConditionOp::In) {
        if pk_index.columns.len() == 1 && pk_index.find_column(&conditions[0].column).is_some() {
            return Some(PkValues::List(conditions[0].values.clone()));
        }
        return None;
    }
    if conditions.len() != pk_index.columns.len() {
        return None;
    }
    let mut tuple: Vec<Option<PkValue>> = vec![None; pk_index.columns.len()];
    for condition in conditions {
        if !matches!(condition.op, ConditionOp::Eq) {
            return None;
        }
        let position = pk_index.find_column(&condition.column)?;
        if tuple[position].is_some() {
            return None;
        }
        tuple[position] = Some(condition.values[0].clone());
    }
    tuple
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .map(PkValues::Tuple)
}

/// Picks the secondary index with the longest covered run of leading
/// columns; earlier indexes win ties.
fn index_match(conditions: &[Condition], table: &Table) -> Option<String> {
    let eq_columns: Vec<&str> = conditions
        .iter()
        .filter(|c| matches!(c.op, ConditionOp::Eq))
        .map(|c| c.column.as_str())
        .collect();
    let mut best: Option<(usize, &Index)> = None;
    for index in table.indexes.iter().skip(1) {
        let covered = index
            .columns
            .iter()
            .take_while(|col| eq_columns.iter().any(|c| c.eq_ignore_ascii_case(col)))
            .count();
        if covered == 0 {
            continue;
        }
        if best.is_none_or(|(b, _)| covered > b) {
            best = Some((covered, index));
        }
    }
    best.map(|(_, index)| index.name.clone())
}

fn analyze_select_exprs(
    projection: &[ast::SelectItem],
    table: &Table,
) -> Result<Option<Vec<usize>>> {
    let mut columns = Vec::new();
    for item in projection {
        match item {
            ast::SelectItem::Wildcard(_) => columns.extend(0..table.columns.len()),
            ast::SelectItem::UnnamedExpr(expr)
            | ast::SelectItem::ExprWithAlias { expr, .. } => {
                let Some(name) = column_name(expr) else {
                    return Ok(None);
                };
                let Some(idx) = table.find_column(&name) else {
                    return Err(Error::Schema(format!(
                        "column {name} not found in table {}",
                        table.name
                    )));
                };
                columns.push(idx);
            }
            _ => return Ok(None),
        }
    }
    Ok(Some(columns))
}

/// Inspects the SET clause for writes to PK columns. Returns `None` when a
/// PK column is assigned something analysis cannot carry; otherwise the new
/// values in `pk_columns` order, or an empty vec when no PK column is
/// touched.
fn analyze_update_assignments(
    assignments: &[ast::Assignment],
    table: &Table,
) -> Option<Vec<Option<PkValue>>> {
    let pk_index = &table.indexes[0];
    let mut values: Vec<Option<PkValue>> = vec![None; pk_index.columns.len()];
    let mut touched = false;
    for assignment in assignments {
        let name = match &assignment.target {
            ast::AssignmentTarget::ColumnName(name) => object_name_last(name)?,
            ast::AssignmentTarget::Tuple(_) => return None,
        };
        let Some(position) = pk_index.find_column(&name) else {
            continue;
        };
        touched = true;
        match pk_value_from_expr(&assignment.value) {
            Some(value) => values[position] = Some(value),
            None => return None,
        }
    }
    if touched {
        Some(values)
    } else {
        Some(Vec::new())
    }
}

fn insert_pk_values(
    rows: &[Vec<Expr>],
    pk_positions: &[Option<usize>],
    table: &Table,
) -> Option<Vec<Vec<PkValue>>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut tuple = Vec::with_capacity(pk_positions.len());
        for (i, position) in pk_positions.iter().enumerate() {
            match position {
                Some(p) => tuple.push(pk_value_from_expr(row.get(*p)?)?),
                // PK column absent from the insert list: its default applies.
                None => tuple.push(match &table.pk_column(i).default {
                    SqlValue::Null => PkValue::Null,
                    value => PkValue::Literal(value.clone()),
                }),
            }
        }
        out.push(tuple);
    }
    Some(out)
}

fn single_table_expr(from: &[TableWithJoins]) -> Option<&TableWithJoins> {
    if from.len() != 1 || !from[0].joins.is_empty() {
        return None;
    }
    Some(&from[0])
}

fn table_factor_parts(factor: &TableFactor) -> Option<(String, bool)> {
    match factor {
        TableFactor::Table {
            name, index_hints, ..
        } => Some((object_name_last(name)?, !index_hints.is_empty())),
        _ => None,
    }
}

fn object_name_last(name: &ObjectName) -> Option<String> {
    match name.0.last()? {
        ObjectNamePart::Identifier(ident) => Some(ident.value.clone()),
        _ => None,
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => idents.last().map(|i| i.value.clone()),
        _ => None,
    }
}

fn pk_value_from_expr(expr: &Expr) -> Option<PkValue> {
    match expr {
        Expr::Value(v) => match &v.value {
            Value::Number(n, _) => Some(PkValue::Literal(SqlValue::Number(n.clone()))),
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
                Some(PkValue::Literal(SqlValue::Text(s.clone())))
            }
            Value::Placeholder(name) => Some(PkValue::Bind(name.clone())),
            Value::Null => Some(PkValue::Null),
            _ => None,
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(v) => match &v.value {
                Value::Number(n, _) => Some(PkValue::Literal(SqlValue::Number(format!("-{n}")))),
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

fn literal_value(expr: &Expr) -> Option<SqlValue> {
    match pk_value_from_expr(expr)? {
        PkValue::Literal(value) => Some(value),
        _ => None,
    }
}

fn limit_value(query: &Query) -> Option<PkValue> {
    match &query.limit_clause {
        Some(LimitClause::LimitOffset {
            limit: Some(limit),
            offset: None,
            ..
        }) => pk_value_from_expr(limit),
        _ => None,
    }
}
