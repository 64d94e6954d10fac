//! Relational operations of a logical plan

use crate::models::{DatasetReference, Field, SchemaDefinition, StagedFilesProperties};

use super::expr::{Condition, Expr};

/// Projected expression with an optional alias
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl From<Expr> for SelectItem {
    fn from(expr: Expr) -> Self {
        SelectItem { expr, alias: None }
    }
}

/// Relation read by a select
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Table(DatasetReference),
    Subquery {
        select: Box<Select>,
        alias: String,
    },
    /// Files read by the engine, with the schema their columns follow
    StagedFiles {
        properties: StagedFilesProperties,
        files: Vec<String>,
        schema: SchemaDefinition,
        alias: String,
    },
}

/// Join kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub source: Source,
    pub on: Condition,
}

/// `SELECT` statement
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    pub distinct: bool,
    pub projection: Vec<SelectItem>,
    pub from: Option<Source>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Condition>,
    pub group_by: Vec<Expr>,
    pub having: Option<Condition>,
}

impl Select {
    /// `SELECT * FROM table`
    pub fn star_from(table: &DatasetReference) -> Self {
        Select {
            projection: vec![SelectItem::from(Expr::Star)],
            from: Some(Source::Table(table.clone())),
            ..Default::default()
        }
    }

    /// Select from a source with the given projection
    pub fn from_source(source: Source, projection: Vec<SelectItem>) -> Self {
        Select {
            projection,
            from: Some(source),
            ..Default::default()
        }
    }

    /// Select without a `FROM` clause
    pub fn values(projection: Vec<SelectItem>) -> Self {
        Select {
            projection,
            ..Default::default()
        }
    }

    pub fn with_where(mut self, condition: Condition) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    /// Add a condition when present
    pub fn with_optional_where(self, condition: Option<Condition>) -> Self {
        match condition {
            Some(c) => self.with_where(c),
            None => self,
        }
    }

    pub fn with_group_by(mut self, group_by: Vec<Expr>) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn with_join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}

/// Schema change applied by `ALTER TABLE`
#[derive(Debug, Clone, PartialEq)]
pub enum Alteration {
    AddColumn(Field),
    ChangeDataType(Field),
    DropNotNull(String),
}

/// Logical statement
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    CreateTable {
        table: DatasetReference,
        schema: SchemaDefinition,
        if_not_exists: bool,
    },
    DropTable {
        table: DatasetReference,
        if_exists: bool,
    },
    Insert {
        table: DatasetReference,
        columns: Vec<String>,
        select: Select,
    },
    Update {
        table: DatasetReference,
        assignments: Vec<(String, Expr)>,
        where_clause: Option<Condition>,
    },
    Delete {
        table: DatasetReference,
        where_clause: Option<Condition>,
    },
    Alter {
        table: DatasetReference,
        alteration: Alteration,
    },
    Query(Select),
}

/// Ordered list of operations
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogicalPlan {
    pub operations: Vec<Operation>,
}

impl LogicalPlan {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn extend(&mut self, other: LogicalPlan) {
        self.operations.extend(other.operations);
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

impl From<Vec<Operation>> for LogicalPlan {
    fn from(operations: Vec<Operation>) -> Self {
        Self::new(operations)
    }
}
