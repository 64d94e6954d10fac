//! SQL text rendering of logical plans

use super::RelationalSink;
use crate::error::IngestResult;
use crate::logical::{
    Alteration, ArithmeticOp, Condition, Expr, Join, JoinKind, LogicalPlan, Operation, Order,
    Select, SelectItem, Source, Value,
};
use crate::models::{DatasetReference, Field, SchemaDefinition};

/// Renders logical operations as SQL for one sink
pub struct SqlRenderer<'a> {
    sink: &'a dyn RelationalSink,
}

impl<'a> SqlRenderer<'a> {
    pub fn new(sink: &'a dyn RelationalSink) -> Self {
        Self { sink }
    }

    /// Render every operation of a plan, in order
    pub fn render_plan(&self, plan: &LogicalPlan) -> IngestResult<Vec<String>> {
        plan.operations
            .iter()
            .map(|op| self.render_operation(op))
            .collect()
    }

    pub fn render_operation(&self, operation: &Operation) -> IngestResult<String> {
        match operation {
            Operation::CreateTable {
                table,
                schema,
                if_not_exists,
            } => Ok(self.render_create(table, schema, *if_not_exists)),
            Operation::DropTable { table, if_exists } => {
                let mut sql = String::from("DROP TABLE ");
                if *if_exists {
                    sql.push_str("IF EXISTS ");
                }
                sql.push_str(&self.table_name(table));
                if self.sink.drop_cascade() {
                    sql.push_str(" CASCADE");
                }
                Ok(sql)
            }
            Operation::Insert {
                table,
                columns,
                select,
            } => Ok(format!(
                "INSERT INTO {} ({}) ({})",
                self.table_name(table),
                self.column_list(columns),
                self.render_select(select)?
            )),
            Operation::Update {
                table,
                assignments,
                where_clause,
            } => {
                let alias = table.alias.as_deref();
                let sets = assignments
                    .iter()
                    .map(|(column, value)| {
                        let target = match alias {
                            Some(a) if self.sink.qualify_update_columns() => {
                                format!("{}.{}", a, self.sink.quote_identifier(column))
                            }
                            _ => self.sink.quote_identifier(column),
                        };
                        Ok(format!("{} = {}", target, self.render_expr(value)?))
                    })
                    .collect::<IngestResult<Vec<_>>>()?;
                let mut sql = format!(
                    "UPDATE {} SET {}",
                    self.table_with_alias(table),
                    sets.join(", ")
                );
                if let Some(condition) = where_clause {
                    sql.push_str(" WHERE ");
                    sql.push_str(&self.render_condition(condition)?);
                }
                Ok(sql)
            }
            Operation::Delete {
                table,
                where_clause,
            } => {
                let mut sql = format!("DELETE FROM {}", self.table_with_alias(table));
                if let Some(condition) = where_clause {
                    sql.push_str(" WHERE ");
                    sql.push_str(&self.render_condition(condition)?);
                }
                Ok(sql)
            }
            Operation::Alter { table, alteration } => {
                let table = self.table_name(table);
                Ok(match alteration {
                    Alteration::AddColumn(field) => {
                        format!("ALTER TABLE {} ADD COLUMN {}", table, self.column_def(field))
                    }
                    Alteration::ChangeDataType(field) => format!(
                        "ALTER TABLE {} ALTER COLUMN {} SET DATA TYPE {}",
                        table,
                        self.sink.quote_identifier(&field.name),
                        self.sink.type_name(&field.field_type)
                    ),
                    Alteration::DropNotNull(column) => format!(
                        "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
                        table,
                        self.sink.quote_identifier(column)
                    ),
                })
            }
            Operation::Query(select) => self.render_select(select),
        }
    }

    fn render_create(
        &self,
        table: &DatasetReference,
        schema: &SchemaDefinition,
        if_not_exists: bool,
    ) -> String {
        let mut parts: Vec<String> = schema.fields().iter().map(|f| self.column_def(f)).collect();
        let keys = schema.primary_key_names();
        if !keys.is_empty() {
            parts.push(format!(
                "PRIMARY KEY ({})",
                keys.iter()
                    .map(|k| self.sink.quote_identifier(k))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        format!(
            "CREATE TABLE {}{}({})",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            self.table_name(table),
            parts.join(", ")
        )
    }

    fn column_def(&self, field: &Field) -> String {
        let mut def = format!(
            "{} {}",
            self.sink.quote_identifier(&field.name),
            self.sink.type_name(&field.field_type)
        );
        if !field.nullable || field.primary_key {
            def.push_str(" NOT NULL");
        }
        if field.unique && !field.primary_key {
            def.push_str(" UNIQUE");
        }
        def
    }

    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.sink.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Qualified table name without alias
    pub fn table_name(&self, table: &DatasetReference) -> String {
        [&table.database, &table.group]
            .into_iter()
            .flatten()
            .chain(std::iter::once(&table.name))
            .map(|part| self.sink.quote_identifier(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn table_with_alias(&self, table: &DatasetReference) -> String {
        match &table.alias {
            Some(alias) => format!("{} as {}", self.table_name(table), alias),
            None => self.table_name(table),
        }
    }

    pub fn render_select(&self, select: &Select) -> IngestResult<String> {
        let items = select
            .projection
            .iter()
            .map(|item| self.render_item(item))
            .collect::<IngestResult<Vec<_>>>()?;

        let mut sql = String::from("SELECT ");
        if select.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&items.join(","));

        if let Some(source) = &select.from {
            sql.push_str(" FROM ");
            sql.push_str(&self.render_source(source)?);
        }
        for join in &select.joins {
            sql.push_str(&self.render_join(join)?);
        }
        if let Some(condition) = &select.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&self.render_condition(condition)?);
        }
        if !select.group_by.is_empty() {
            let group = select
                .group_by
                .iter()
                .map(|e| self.render_expr(e))
                .collect::<IngestResult<Vec<_>>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&group.join(", "));
        }
        if let Some(having) = &select.having {
            sql.push_str(" HAVING ");
            sql.push_str(&self.render_condition(having)?);
        }
        Ok(sql)
    }

    fn render_item(&self, item: &SelectItem) -> IngestResult<String> {
        let expr = self.render_expr(&item.expr)?;
        Ok(match &item.alias {
            Some(alias) => format!("{} as {}", expr, self.sink.quote_identifier(alias)),
            None => expr,
        })
    }

    fn render_source(&self, source: &Source) -> IngestResult<String> {
        match source {
            Source::Table(table) => Ok(self.table_with_alias(table)),
            Source::Subquery { select, alias } => {
                Ok(format!("({}) as {}", self.render_select(select)?, alias))
            }
            Source::StagedFiles {
                properties,
                files,
                schema,
                alias,
            } => Ok(format!(
                "{} as {}",
                self.sink.staged_files_source(properties, files, schema)?,
                alias
            )),
        }
    }

    fn render_join(&self, join: &Join) -> IngestResult<String> {
        let kind = match join.kind {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT OUTER JOIN",
        };
        Ok(format!(
            " {} {} ON {}",
            kind,
            self.render_source(&join.source)?,
            self.render_condition(&join.on)?
        ))
    }

    pub fn render_expr(&self, expr: &Expr) -> IngestResult<String> {
        Ok(match expr {
            Expr::Column { table, name } => match table {
                Some(alias) => format!("{}.{}", alias, self.sink.quote_identifier(name)),
                None => self.sink.quote_identifier(name),
            },
            Expr::Literal(value) => render_value(value),
            Expr::Star => "*".to_string(),
            Expr::Function {
                name,
                args,
                distinct,
            } => {
                let args = args
                    .iter()
                    .map(|a| self.render_expr(a))
                    .collect::<IngestResult<Vec<_>>>()?;
                format!(
                    "{}({}{})",
                    name,
                    if *distinct { "DISTINCT " } else { "" },
                    args.join(",")
                )
            }
            Expr::Cast { expr, data_type } => format!(
                "CAST({} AS {})",
                self.render_expr(expr)?,
                self.sink.type_name(data_type)
            ),
            Expr::Concat(parts) => {
                let parts = parts
                    .iter()
                    .map(|p| self.render_expr(p))
                    .collect::<IngestResult<Vec<_>>>()?;
                format!("CONCAT({})", parts.join(","))
            }
            Expr::Arithmetic { left, op, right } => {
                let op = match op {
                    ArithmeticOp::Add => "+",
                    ArithmeticOp::Subtract => "-",
                };
                format!(
                    "{}{}{}",
                    self.render_expr(left)?,
                    op,
                    self.render_expr(right)?
                )
            }
            Expr::Subquery(select) => format!("({})", self.render_select(select)?),
            Expr::Window {
                function,
                partition_by,
                order_by,
            } => {
                let partition = partition_by
                    .iter()
                    .map(|e| self.render_expr(e))
                    .collect::<IngestResult<Vec<_>>>()?;
                let order = order_by
                    .iter()
                    .map(|(e, o)| {
                        let dir = match o {
                            Order::Asc => "ASC",
                            Order::Desc => "DESC",
                        };
                        Ok(format!("{} {}", self.render_expr(e)?, dir))
                    })
                    .collect::<IngestResult<Vec<_>>>()?;
                let mut over = Vec::new();
                if !partition.is_empty() {
                    over.push(format!("PARTITION BY {}", partition.join(",")));
                }
                if !order.is_empty() {
                    over.push(format!("ORDER BY {}", order.join(",")));
                }
                format!("{}() OVER ({})", function, over.join(" "))
            }
            Expr::Placeholder(text) => text.clone(),
        })
    }

    pub fn render_condition(&self, condition: &Condition) -> IngestResult<String> {
        Ok(match condition {
            Condition::Compare { left, op, right } => format!(
                "{} {} {}",
                self.render_expr(left)?,
                op.as_sql(),
                self.render_expr(right)?
            ),
            Condition::IsNull(expr) => format!("{} IS NULL", self.render_expr(expr)?),
            Condition::IsNotNull(expr) => format!("{} IS NOT NULL", self.render_expr(expr)?),
            Condition::In {
                expr,
                values,
                negated,
            } => {
                let values = values
                    .iter()
                    .map(|v| self.render_expr(v))
                    .collect::<IngestResult<Vec<_>>>()?;
                format!(
                    "{} {}IN ({})",
                    self.render_expr(expr)?,
                    if *negated { "NOT " } else { "" },
                    values.join(",")
                )
            }
            Condition::Exists(select) => format!("EXISTS ({})", self.render_select(select)?),
            Condition::Not(inner) => format!("NOT ({})", self.render_condition(inner)?),
            Condition::And(items) => self.render_junction(items, "AND", "1 = 1")?,
            Condition::Or(items) => self.render_junction(items, "OR", "1 = 0")?,
        })
    }

    fn render_junction(&self, items: &[Condition], op: &str, empty: &str) -> IngestResult<String> {
        if items.is_empty() {
            return Ok(empty.to_string());
        }
        let parts = items
            .iter()
            .map(|c| Ok(format!("({})", self.render_condition(c)?)))
            .collect::<IngestResult<Vec<_>>>()?;
        Ok(parts.join(&format!(" {} ", op)))
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Boolean(b) => b.to_string(),
    }
}
