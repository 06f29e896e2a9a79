//! Core relation metadata: schemas, relation symbols and the catalog.
//!
//! The catalog is filled once by `ProgramBuilder` and is immutable while the
//! engine runs, so a `RelId` handed out at registration stays valid for the
//! process lifetime.

use indexmap::IndexMap;

use crate::error::{RegistrationError, RegistrationResult, SchemaError};
use crate::id::{ColId, RelId};
use crate::value::{ColumnType, Value};

/// A named, typed column
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    /// A column that accepts any value
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Any)
    }
}

/// Column layout of a relation.
///
/// The first `key_arity` columns form the key. A key arity of zero means no
/// key was declared and the whole row is its own key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    pub columns: Vec<Column>,
    pub key_arity: usize,
}

impl Schema {
    /// Schema with key columns followed by value columns, mirroring the
    /// `[key cols] => [value cols]` declaration form.
    pub fn keyed(keys: Vec<Column>, values: Vec<Column>) -> Self {
        let key_arity = keys.len();
        let mut columns = keys;
        columns.extend(values);
        Self { columns, key_arity }
    }

    /// Schema with no declared key (set semantics over whole rows).
    pub fn unkeyed(columns: Vec<Column>) -> Self {
        Self {
            columns,
            key_arity: 0,
        }
    }

    /// Unkeyed schema of untyped columns, named as given.
    pub fn of_names(names: &[&str]) -> Self {
        Self::unkeyed(names.iter().map(|n| Column::any(*n)).collect())
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<ColId> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Number of columns that identify a row.
    pub fn effective_key_arity(&self) -> usize {
        if self.key_arity == 0 {
            self.arity()
        } else {
            self.key_arity
        }
    }

    /// Check a row's arity and column types.
    pub fn check(&self, relation: &str, tuple: &[Value]) -> Result<(), SchemaError> {
        if tuple.len() != self.arity() {
            return Err(SchemaError::Arity {
                relation: relation.to_string(),
                expected: self.arity(),
                got: tuple.len(),
            });
        }
        for (col, val) in self.columns.iter().zip(tuple) {
            if !col.ty.admits(val) {
                return Err(SchemaError::Type {
                    relation: relation.to_string(),
                    column: col.name.clone(),
                    expected: col.ty,
                    got: val.column_type(),
                });
            }
        }
        Ok(())
    }
}

/// Storage class of a relation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationKind {
    /// Survives across steps; grows by insertion, shrinks only by RSE
    Persistent,
    /// Recomputed every step, empty at the start of each step
    Ephemeral,
}

/// A declared relation
#[derive(Clone, Debug)]
pub struct RelationSymbol {
    pub name: String,
    pub schema: Schema,
    pub kind: RelationKind,
}

impl RelationSymbol {
    pub fn is_persistent(&self) -> bool {
        self.kind == RelationKind::Persistent
    }
}

/// Registry of relations, indexed by RelId in declaration order.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    relations: IndexMap<String, RelationSymbol>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_relation(
        &mut self,
        name: &str,
        schema: Schema,
        kind: RelationKind,
    ) -> RegistrationResult<RelId> {
        if self.relations.contains_key(name) {
            return Err(RegistrationError::DuplicateRelation(name.to_string()));
        }
        for (i, col) in schema.columns.iter().enumerate() {
            if schema.columns[..i].iter().any(|c| c.name == col.name) {
                return Err(RegistrationError::DuplicateColumn {
                    relation: name.to_string(),
                    column: col.name.clone(),
                });
            }
        }
        if schema.key_arity > schema.arity() {
            return Err(RegistrationError::KeyTooWide {
                relation: name.to_string(),
                key_arity: schema.key_arity,
                columns: schema.arity(),
            });
        }
        let (id, _) = self.relations.insert_full(
            name.to_string(),
            RelationSymbol {
                name: name.to_string(),
                schema,
                kind,
            },
        );
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<RelId> {
        self.relations.get_index_of(name)
    }

    pub fn get(&self, id: RelId) -> Option<&RelationSymbol> {
        self.relations.get_index(id).map(|(_, sym)| sym)
    }

    /// Symbol for a RelId handed out by this catalog.
    ///
    /// Panics on a foreign id; every RelId reachable from a built program
    /// was issued here.
    pub fn symbol(&self, id: RelId) -> &RelationSymbol {
        &self.relations[id]
    }

    pub fn name(&self, id: RelId) -> &str {
        &self.symbol(id).name
    }

    pub fn schema(&self, id: RelId) -> &Schema {
        &self.symbol(id).schema
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RelId, &RelationSymbol)> {
        self.relations.values().enumerate()
    }

    /// Resolve a column name of a relation, for registration-time checks.
    pub fn resolve_column(&self, rel: RelId, column: &str) -> RegistrationResult<ColId> {
        let sym = self.symbol(rel);
        sym.schema
            .column_index(column)
            .ok_or_else(|| RegistrationError::UnknownColumn {
                relation: sym.name.clone(),
                column: column.to_string(),
            })
    }
}
