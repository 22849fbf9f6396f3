//! The slice of the catalog contract the storage core consumes.
//!
//! The real catalog lives above this crate; during steady state these entries
//! are read-only, and at checkpoint they are the authoritative column
//! ordering.

use quiver_types::{
    ColumnId, ColumnIdList, LogicalType, TableId,
    buffer::{DecodeError, Deserializer, Serializer},
};
use smallvec::SmallVec;

/// One column of a table, as the catalog defines it.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyDefinition {
    pub name: String,
    pub data_type: LogicalType,
    pub column_id: ColumnId,
}

/// The ordered properties of a table; inline for the common few-column case.
pub type PropertyList = SmallVec<[PropertyDefinition; 4]>;

/// Catalog metadata of a node table.
#[derive(Clone, Debug, PartialEq)]
pub struct TableCatalogEntry {
    pub table_id: TableId,
    pub name: String,
    pub properties: PropertyList,
    pub primary_key: String,
}

impl TableCatalogEntry {
    pub fn column_id(&self, name: &str) -> Option<ColumnId> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.column_id)
    }

    pub fn pk_column_id(&self) -> Option<ColumnId> {
        self.column_id(&self.primary_key)
    }

    pub fn property(&self, column_id: ColumnId) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.column_id == column_id)
    }

    /// The column ids in catalog property order; the order columns are
    /// rewritten in at checkpoint and drained in at commit.
    pub fn column_ids(&self) -> ColumnIdList {
        self.properties.iter().map(|p| p.column_id).collect()
    }

    /// Hook invoked after a checkpoint has rewritten the table; dropped
    /// columns no longer occupy ids after this point.
    pub fn vacuum_column_ids(&mut self, _next_column_id: u32) {}

    pub fn serialize(&self, ser: &mut Serializer) {
        ser.write_u32(self.table_id.0);
        ser.write_string(&self.name);
        ser.write_list_len(self.properties.len());
        for property in &self.properties {
            ser.write_string(&property.name);
            property.data_type.serialize(ser);
            ser.write_u32(property.column_id.0);
        }
        ser.write_string(&self.primary_key);
    }

    pub fn deserialize(de: &mut Deserializer<'_>) -> Result<Self, DecodeError> {
        let table_id = TableId(de.read_u32()?);
        let name = de.read_string()?;
        let num_properties = de.read_list_len()?;
        let mut properties = PropertyList::with_capacity(num_properties);
        for _ in 0..num_properties {
            properties.push(PropertyDefinition {
                name: de.read_string()?,
                data_type: LogicalType::deserialize(de)?,
                column_id: ColumnId(de.read_u32()?),
            });
        }
        let primary_key = de.read_string()?;
        Ok(Self {
            table_id,
            name,
            properties,
            primary_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn person_entry() -> TableCatalogEntry {
        TableCatalogEntry {
            table_id: TableId(1),
            name: "person".into(),
            properties: vec![
                PropertyDefinition {
                    name: "id".into(),
                    data_type: LogicalType::Int64,
                    column_id: ColumnId(0),
                },
                PropertyDefinition {
                    name: "name".into(),
                    data_type: LogicalType::String,
                    column_id: ColumnId(1),
                },
            ]
            .into(),
            primary_key: "id".into(),
        }
    }

    #[test]
    fn entry_roundtrips() {
        let entry = person_entry();
        let mut ser = Serializer::new();
        entry.serialize(&mut ser);
        let bytes = ser.into_bytes();
        let mut de = Deserializer::new(&bytes);
        assert_eq!(TableCatalogEntry::deserialize(&mut de).unwrap(), entry);
    }

    #[test]
    fn pk_lookup() {
        let entry = person_entry();
        assert_eq!(entry.pk_column_id(), Some(ColumnId(0)));
        assert_eq!(entry.column_id("name"), Some(ColumnId(1)));
        assert_eq!(entry.column_id("missing"), None);
    }
}
