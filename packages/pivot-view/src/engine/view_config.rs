//! View configuration and the column layout a configured view reads rows in.

use super::operators::{ComputedExpr, FilterOp};
use super::state::MasterState;
use super::symbol::Symbol;
use super::types::{DType, Scalar, Schema};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Sum,
    Count,
    Mean,
    Min,
    Max,
    DistinctCount,
    /// The shared value when every row agrees, else `None`.
    Unique,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AggSpec {
    pub column: SmolStr,
    pub func: AggFunc,
    #[serde(default)]
    pub alias: Option<SmolStr>,
}

impl AggSpec {
    pub fn new(column: &str, func: AggFunc) -> Self {
        Self {
            column: SmolStr::new(column),
            func,
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(SmolStr::new(alias));
        self
    }

    /// Output name: the alias, else the source column.
    pub fn name(&self) -> &SmolStr {
        self.alias.as_ref().unwrap_or(&self.column)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FilterSpec {
    pub column: SmolStr,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SortSpec {
    /// Column name, or aggregate alias for pivoted views.
    pub column: SmolStr,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ComputedColumn {
    pub name: SmolStr,
    pub expression: String,
}

/// Immutable configuration of one view.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct ContextConfig {
    pub row_pivots: Vec<SmolStr>,
    pub column_pivots: Vec<SmolStr>,
    pub aggregates: Vec<AggSpec>,
    pub filters: Vec<FilterSpec>,
    pub sort: Vec<SortSpec>,
    pub computed_columns: Vec<ComputedColumn>,
    pub columns: Vec<SmolStr>,
    /// Pivoted views: depth expanded on creation. `None` expands everything.
    pub expand_depth: Option<usize>,
    pub group_by_primary_key: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextKind {
    Unit,
    Flat,
    GroupedByOne,
    GroupedByTwo,
    GroupedByPrimaryKey,
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_pivot(mut self, column: &str) -> Self {
        self.row_pivots.push(SmolStr::new(column));
        self
    }

    pub fn column_pivot(mut self, column: &str) -> Self {
        self.column_pivots.push(SmolStr::new(column));
        self
    }

    pub fn aggregate(mut self, spec: AggSpec) -> Self {
        self.aggregates.push(spec);
        self
    }

    pub fn filter(mut self, column: &str, op: FilterOp, value: Value) -> Self {
        self.filters.push(FilterSpec {
            column: SmolStr::new(column),
            op,
            value,
        });
        self
    }

    pub fn sort_by(mut self, column: &str, direction: SortDirection) -> Self {
        self.sort.push(SortSpec {
            column: SmolStr::new(column),
            direction,
        });
        self
    }

    pub fn computed(mut self, name: &str, expression: &str) -> Self {
        self.computed_columns.push(ComputedColumn {
            name: SmolStr::new(name),
            expression: expression.to_string(),
        });
        self
    }

    pub fn project(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| SmolStr::new(*c)).collect();
        self
    }

    pub fn expand_to(mut self, depth: usize) -> Self {
        self.expand_depth = Some(depth);
        self
    }

    pub fn by_primary_key(mut self) -> Self {
        self.group_by_primary_key = true;
        self
    }

    pub fn kind(&self) -> ContextKind {
        if !self.column_pivots.is_empty() {
            ContextKind::GroupedByTwo
        } else if self.group_by_primary_key {
            ContextKind::GroupedByPrimaryKey
        } else if !self.row_pivots.is_empty() {
            ContextKind::GroupedByOne
        } else if self.filters.is_empty()
            && self.sort.is_empty()
            && self.computed_columns.is_empty()
            && self.columns.is_empty()
        {
            ContextKind::Unit
        } else {
            ContextKind::Flat
        }
    }
}

/// Master columns followed by the view's computed columns.
///
/// Positions `0..schema.len()` are master columns; computed columns follow in
/// configuration order. Filters, pivots, aggregates and sorts all address
/// cells through this layout.
#[derive(Clone, Debug)]
pub struct RowLayout {
    schema: Schema,
    computed: Vec<ComputedExpr>,
}

impl RowLayout {
    pub fn new(schema: &Schema, computed: &[ComputedColumn]) -> Result<Self, EngineError> {
        let mut compiled = Vec::with_capacity(computed.len());
        for c in computed {
            if schema.has_column(&c.name) || compiled.iter().any(|e: &ComputedExpr| e.name == c.name)
            {
                return Err(EngineError::Config(format!(
                    "computed column '{}' shadows an existing column",
                    c.name
                )));
            }
            compiled.push(ComputedExpr::compile(&c.name, &c.expression, schema)?);
        }
        Ok(Self {
            schema: schema.clone(),
            computed: compiled,
        })
    }

    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.schema.len() + self.computed.len()
    }

    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.schema.column_index(name).or_else(|| {
            self.computed
                .iter()
                .position(|c| c.name == name)
                .map(|i| self.schema.len() + i)
        })
    }

    pub fn name(&self, position: usize) -> Option<SmolStr> {
        match self.schema.column_name(position) {
            Some(n) => Some(n.clone()),
            None => self
                .computed
                .get(position - self.schema.len())
                .map(|c| c.name.clone()),
        }
    }

    pub fn dtype(&self, position: usize) -> DType {
        if position < self.schema.len() {
            self.schema.dtype(position)
        } else {
            self.computed
                .get(position - self.schema.len())
                .map(|c| c.expr.dtype(&self.schema))
                .unwrap_or(DType::None)
        }
    }

    /// Append computed values to a master row.
    pub fn extend(&self, mut row: Vec<Scalar>) -> Vec<Scalar> {
        if self.computed.is_empty() {
            return row;
        }
        let values: Vec<Scalar> = self.computed.iter().map(|c| c.eval(&row)).collect();
        row.extend(values);
        row
    }

    /// Read a live key's row in this layout.
    pub fn read(&self, state: &MasterState, key: Symbol) -> Option<Vec<Scalar>> {
        state.read_row(key).map(|row| self.extend(row))
    }

    /// Read one cell of a live key.
    pub fn read_cell(&self, state: &MasterState, key: Symbol, position: usize) -> Scalar {
        if position < self.schema.len() {
            state
                .read_value(key, position)
                .cloned()
                .unwrap_or_default()
        } else {
            match (
                self.computed.get(position - self.schema.len()),
                state.read_row(key),
            ) {
                (Some(c), Some(row)) => c.eval(&row),
                _ => Scalar::None,
            }
        }
    }
}
