//! Output column metadata for compiled views.

use flatquack_fhirpath::DuckType;
use serde::{Deserialize, Serialize};

/// Metadata for one column of a compiled view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// The column name in the output.
    pub name: String,

    /// DuckDB physical type of a single value.
    pub duck_type: DuckType,

    /// Whether the column carries a list value.
    pub is_collection: bool,
}

impl ColumnInfo {
    /// Create metadata for a scalar column.
    pub fn new(name: impl Into<String>, duck_type: DuckType) -> Self {
        Self {
            name: name.into(),
            duck_type,
            is_collection: false,
        }
    }

    /// Mark the column as carrying a collection.
    pub fn with_collection(mut self, is_collection: bool) -> Self {
        self.is_collection = is_collection;
        self
    }

    /// Render the column's full DuckDB type, including the list suffix.
    pub fn render_type(&self) -> String {
        if self.is_collection {
            format!("{}[]", self.duck_type.render())
        } else {
            self.duck_type.render()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_type() {
        let scalar = ColumnInfo::new("family", DuckType::Varchar);
        assert_eq!(scalar.render_type(), "VARCHAR");

        let list = ColumnInfo::new("given", DuckType::Varchar).with_collection(true);
        assert_eq!(list.render_type(), "VARCHAR[]");
    }
}
