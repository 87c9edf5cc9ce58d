//! Table descriptors, sync schema and sync setup.

use crate::error::{CoreError, CoreResult};
use crate::value::{PrimaryKey, Row, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Boolean values.
    Boolean,
    /// 64-bit integers.
    Integer,
    /// Floating point.
    Real,
    /// UTF-8 text.
    Text,
    /// Binary data.
    Blob,
}

impl ColumnType {
    /// Returns true if `value` may be stored in a column of this type.
    ///
    /// `Null` is checked against nullability separately.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ColumnType::Boolean, Value::Bool(_))
                | (ColumnType::Integer, Value::Integer(_))
                | (ColumnType::Real, Value::Real(_) | Value::Integer(_))
                | (ColumnType::Text, Value::Text(_))
                | (ColumnType::Blob, Value::Bytes(_))
        )
    }
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub column_type: ColumnType,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

impl ColumnDescriptor {
    /// Creates a non-null column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    /// Marks the column nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A synchronized table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name.
    pub name: String,
    /// Columns in storage order.
    pub columns: Vec<ColumnDescriptor>,
    /// Names of the primary-key columns, in key order.
    pub primary_keys: Vec<String>,
}

impl TableDescriptor {
    /// Creates a descriptor.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
        primary_keys: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_keys,
        }
    }

    /// Checks that the descriptor is well formed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` on empty names, duplicate columns, a missing
    /// primary key, or a nullable key column.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::invalid_schema("table name is empty"));
        }
        if self.primary_keys.is_empty() {
            return Err(CoreError::invalid_schema(format!(
                "table {} has no primary key",
                self.name
            )));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(CoreError::invalid_schema(format!(
                    "table {} has duplicate column {}",
                    self.name, column.name
                )));
            }
        }
        for key in &self.primary_keys {
            match self.column(key) {
                Some(column) if column.nullable => {
                    return Err(CoreError::invalid_schema(format!(
                        "primary key column {}.{} is nullable",
                        self.name, key
                    )))
                }
                Some(_) => {}
                None => {
                    return Err(CoreError::invalid_schema(format!(
                        "primary key column {}.{} does not exist",
                        self.name, key
                    )))
                }
            }
        }
        Ok(())
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Positions of the primary-key columns within a row.
    pub fn key_indices(&self) -> Vec<usize> {
        self.primary_keys
            .iter()
            .filter_map(|k| self.columns.iter().position(|c| &c.name == k))
            .collect()
    }

    /// Extracts the primary key of `row`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRow` if the row is too short.
    pub fn key_of(&self, row: &[Value]) -> CoreResult<PrimaryKey> {
        self.key_indices()
            .into_iter()
            .map(|i| {
                row.get(i)
                    .cloned()
                    .ok_or_else(|| CoreError::invalid_row(&self.name, "row shorter than key"))
            })
            .collect::<CoreResult<Vec<_>>>()
            .map(PrimaryKey)
    }

    /// Validates a full row against the column list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRow` on arity, type or nullability violations.
    pub fn check_row(&self, row: &[Value]) -> CoreResult<()> {
        if row.len() != self.columns.len() {
            return Err(CoreError::invalid_row(
                &self.name,
                format!("expected {} values, got {}", self.columns.len(), row.len()),
            ));
        }
        for (column, value) in self.columns.iter().zip(row) {
            if value.is_null() && !column.nullable {
                return Err(CoreError::invalid_row(
                    &self.name,
                    format!("column {} is not nullable", column.name),
                ));
            }
            if !column.column_type.accepts(value) {
                return Err(CoreError::invalid_row(
                    &self.name,
                    format!("column {} expects {:?}", column.name, column.column_type),
                ));
            }
        }
        Ok(())
    }

    /// Builds the row kept for a tombstone: key columns set, the rest NULL.
    pub fn tombstone_row(&self, key: &PrimaryKey) -> Row {
        let mut row = vec![Value::Null; self.columns.len()];
        for (index, value) in self.key_indices().into_iter().zip(key.values()) {
            row[index] = value.clone();
        }
        row
    }

    /// Restricts the table to `columns`, keeping key columns and order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` if a named column does not exist.
    pub fn project(&self, columns: &[String]) -> CoreResult<TableDescriptor> {
        for name in columns {
            if self.column(name).is_none() {
                return Err(CoreError::invalid_schema(format!(
                    "setup names unknown column {}.{}",
                    self.name, name
                )));
            }
        }
        let kept = self
            .columns
            .iter()
            .filter(|c| self.primary_keys.contains(&c.name) || columns.contains(&c.name))
            .cloned()
            .collect();
        Ok(TableDescriptor::new(
            self.name.clone(),
            kept,
            self.primary_keys.clone(),
        ))
    }
}

/// The set of tables two replicas agree to synchronize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSchema {
    /// Tables in dependency order (parents first).
    pub tables: Vec<TableDescriptor>,
}

impl SyncSchema {
    /// Creates a schema from tables.
    pub fn new(tables: Vec<TableDescriptor>) -> Self {
        Self { tables }
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Validates every table and rejects duplicate table names.
    ///
    /// # Errors
    ///
    /// Returns the first `InvalidSchema` found.
    pub fn validate(&self) -> CoreResult<()> {
        for (i, table) in self.tables.iter().enumerate() {
            table.validate()?;
            if self.tables[..i].iter().any(|t| t.name == table.name) {
                return Err(CoreError::invalid_schema(format!(
                    "duplicate table {}",
                    table.name
                )));
            }
        }
        Ok(())
    }

    /// Checks that `other` can exchange rows with this schema.
    ///
    /// Every table of `other` must exist here with the same columns and key.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` or `SchemaMismatch`.
    pub fn check_compatible(&self, other: &SyncSchema) -> CoreResult<()> {
        for theirs in &other.tables {
            let ours = self
                .table(&theirs.name)
                .ok_or_else(|| CoreError::schema_missing(format!("table {}", theirs.name)))?;
            if ours.primary_keys != theirs.primary_keys {
                return Err(CoreError::schema_mismatch(
                    &theirs.name,
                    "primary key columns differ",
                ));
            }
            if ours.columns != theirs.columns {
                return Err(CoreError::schema_mismatch(&theirs.name, "columns differ"));
            }
        }
        Ok(())
    }

    /// Checks that every table of `views` can be served by this schema.
    ///
    /// A view may drop non-key columns but must keep the key and must not
    /// redefine a column.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` or `SchemaMismatch`.
    pub fn check_views(&self, views: &SyncSchema) -> CoreResult<()> {
        for view in &views.tables {
            let ours = self
                .table(&view.name)
                .ok_or_else(|| CoreError::schema_missing(format!("table {}", view.name)))?;
            if ours.primary_keys != view.primary_keys {
                return Err(CoreError::schema_mismatch(
                    &view.name,
                    "primary key columns differ",
                ));
            }
            for column in &view.columns {
                if ours.column(&column.name) != Some(column) {
                    return Err(CoreError::schema_mismatch(
                        &view.name,
                        format!("column {} differs", column.name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// SHA-256 hex digest of the canonical CBOR encoding.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if encoding fails.
    pub fn fingerprint(&self) -> CoreResult<String> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| CoreError::codec(e.to_string()))?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

/// One table's participation in a setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupTable {
    /// Table name.
    pub name: String,
    /// Participating non-key columns; `None` means all columns.
    pub columns: Option<Vec<String>>,
}

/// Which tables and columns participate in a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSetup {
    /// Participating tables, in apply order.
    pub tables: Vec<SetupTable>,
}

impl SyncSetup {
    /// Creates a setup syncing every column of the named tables.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables
                .into_iter()
                .map(|name| SetupTable {
                    name: name.into(),
                    columns: None,
                })
                .collect(),
        }
    }

    /// Restricts a table to a column subset.
    #[must_use]
    pub fn with_columns<S: Into<String>>(mut self, table: &str, columns: Vec<S>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if let Some(entry) = self.tables.iter_mut().find(|t| t.name == table) {
            entry.columns = Some(columns);
        }
        self
    }

    /// Returns the participating table names.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// Resolves this setup against a full schema, producing the sync schema.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` for unknown tables and `InvalidSchema` for
    /// unknown columns.
    pub fn resolve(&self, full: &SyncSchema) -> CoreResult<SyncSchema> {
        if self.tables.is_empty() {
            return Err(CoreError::invalid_schema("setup has no tables"));
        }
        let mut tables = Vec::with_capacity(self.tables.len());
        for entry in &self.tables {
            let table = full
                .table(&entry.name)
                .ok_or_else(|| CoreError::schema_missing(format!("table {}", entry.name)))?;
            tables.push(match &entry.columns {
                Some(columns) => table.project(columns)?,
                None => table.clone(),
            });
        }
        let schema = SyncSchema::new(tables);
        schema.validate()?;
        Ok(schema)
    }
}
