use pc_types::DType;
use serde::{Deserialize, Serialize};

use crate::ColumnError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub dtype: DType,
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Ordered, uniquely named column list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Result<Self, ColumnError> {
        let mut schema = Self::default();
        for field in fields {
            schema.add_field(field)?;
        }
        Ok(schema)
    }

    pub fn add_field(&mut self, field: Field) -> Result<usize, ColumnError> {
        if self.has_column(&field.name) {
            return Err(ColumnError::DuplicateColumn { name: field.name });
        }
        self.fields.push(field);
        Ok(self.fields.len() - 1)
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn colidx(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.colidx(name).is_some()
    }

    #[must_use]
    pub fn dtype(&self, name: &str) -> Option<DType> {
        self.colidx(name).map(|idx| self.fields[idx].dtype)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    /// Schema restricted to `names`, in that order.
    pub fn project(&self, names: &[&str]) -> Result<Self, ColumnError> {
        let fields = names
            .iter()
            .map(|name| {
                self.colidx(name)
                    .map(|idx| self.fields[idx].clone())
                    .ok_or_else(|| ColumnError::UnknownColumn {
                        name: (*name).to_owned(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(fields)
    }
}
