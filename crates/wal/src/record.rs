use quiver_types::{
    ColumnId, NodeOffset, TableId, TxnTs, Value,
    buffer::{DecodeError, Deserializer, Serializer},
};

/// Kind of table a record refers to. The storage core only materialises node
/// tables; the discriminant is kept on the wire for future table kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TableType {
    Node,
}

impl TableType {
    fn to_u8(self) -> u8 {
        match self {
            TableType::Node => 0,
        }
    }

    fn from_u8(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(TableType::Node),
            other => Err(DecodeError::InvalidTag(other)),
        }
    }
}

/// One redo record.
#[derive(Clone, Debug, PartialEq)]
pub enum WalRecord {
    /// Rows inserted into a table, row-major, self-describing values.
    TableInsertion {
        table_id: TableId,
        table_type: TableType,
        rows: Vec<Vec<Value>>,
    },
    /// An in-place column update of one node.
    NodeUpdate {
        table_id: TableId,
        column_id: ColumnId,
        node_offset: NodeOffset,
        value: Value,
    },
    /// A node deletion, keyed by offset; the primary key value is carried so
    /// recovery can drive the index delete path.
    NodeDeletion {
        table_id: TableId,
        node_offset: NodeOffset,
        pk: Value,
    },
    /// Commit marker: everything since the previous marker belongs to the
    /// transaction committing at `commit_ts`.
    Commit { commit_ts: TxnTs },
    /// Rollback marker: everything since the previous marker was undone and
    /// must not be replayed.
    Rollback,
    /// Checkpoint marker; the log is truncated up to it.
    Checkpoint,
}

pub(crate) const KIND_TABLE_INSERTION: u8 = 0;
pub(crate) const KIND_NODE_UPDATE: u8 = 1;
pub(crate) const KIND_NODE_DELETION: u8 = 2;
pub(crate) const KIND_COMMIT: u8 = 3;
pub(crate) const KIND_CHECKPOINT: u8 = 4;
pub(crate) const KIND_ROLLBACK: u8 = 5;

impl WalRecord {
    pub(crate) fn kind(&self) -> u8 {
        match self {
            WalRecord::TableInsertion { .. } => KIND_TABLE_INSERTION,
            WalRecord::NodeUpdate { .. } => KIND_NODE_UPDATE,
            WalRecord::NodeDeletion { .. } => KIND_NODE_DELETION,
            WalRecord::Commit { .. } => KIND_COMMIT,
            WalRecord::Rollback => KIND_ROLLBACK,
            WalRecord::Checkpoint => KIND_CHECKPOINT,
        }
    }

    pub(crate) fn encode_payload(&self, ser: &mut Serializer) {
        match self {
            WalRecord::TableInsertion {
                table_id,
                table_type,
                rows,
            } => {
                ser.write_u32(table_id.0);
                ser.write_u8(table_type.to_u8());
                ser.write_list_len(rows.len());
                for row in rows {
                    ser.write_list_len(row.len());
                    for value in row {
                        value.serialize(ser);
                    }
                }
            }
            WalRecord::NodeUpdate {
                table_id,
                column_id,
                node_offset,
                value,
            } => {
                ser.write_u32(table_id.0);
                ser.write_u32(column_id.0);
                ser.write_u64(*node_offset);
                value.serialize(ser);
            }
            WalRecord::NodeDeletion {
                table_id,
                node_offset,
                pk,
            } => {
                ser.write_u32(table_id.0);
                ser.write_u64(*node_offset);
                pk.serialize(ser);
            }
            WalRecord::Commit { commit_ts } => ser.write_u64(*commit_ts),
            WalRecord::Rollback | WalRecord::Checkpoint => {}
        }
    }

    pub(crate) fn decode(kind: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut de = Deserializer::new(payload);
        let record = match kind {
            KIND_TABLE_INSERTION => {
                let table_id = TableId(de.read_u32()?);
                let table_type = TableType::from_u8(de.read_u8()?)?;
                let num_rows = de.read_list_len()?;
                let mut rows = Vec::with_capacity(num_rows);
                for _ in 0..num_rows {
                    let num_values = de.read_list_len()?;
                    let mut row = Vec::with_capacity(num_values);
                    for _ in 0..num_values {
                        row.push(Value::deserialize(&mut de)?);
                    }
                    rows.push(row);
                }
                WalRecord::TableInsertion {
                    table_id,
                    table_type,
                    rows,
                }
            }
            KIND_NODE_UPDATE => WalRecord::NodeUpdate {
                table_id: TableId(de.read_u32()?),
                column_id: ColumnId(de.read_u32()?),
                node_offset: de.read_u64()?,
                value: Value::deserialize(&mut de)?,
            },
            KIND_NODE_DELETION => WalRecord::NodeDeletion {
                table_id: TableId(de.read_u32()?),
                node_offset: de.read_u64()?,
                pk: Value::deserialize(&mut de)?,
            },
            KIND_COMMIT => WalRecord::Commit {
                commit_ts: de.read_u64()?,
            },
            KIND_ROLLBACK => WalRecord::Rollback,
            KIND_CHECKPOINT => WalRecord::Checkpoint,
            other => return Err(DecodeError::InvalidTag(other)),
        };
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: WalRecord) {
        let mut ser = Serializer::new();
        record.encode_payload(&mut ser);
        let payload = ser.into_bytes();
        let decoded = WalRecord::decode(record.kind(), &payload).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn records_roundtrip() {
        roundtrip(WalRecord::TableInsertion {
            table_id: TableId(3),
            table_type: TableType::Node,
            rows: vec![
                vec![Value::Int64(1), Value::String("a".into())],
                vec![Value::Int64(2), Value::Null],
            ],
        });
        roundtrip(WalRecord::NodeUpdate {
            table_id: TableId(3),
            column_id: ColumnId(1),
            node_offset: 77,
            value: Value::String("b".into()),
        });
        roundtrip(WalRecord::NodeDeletion {
            table_id: TableId(3),
            node_offset: 77,
            pk: Value::Int64(2),
        });
        roundtrip(WalRecord::Commit { commit_ts: 42 });
        roundtrip(WalRecord::Rollback);
        roundtrip(WalRecord::Checkpoint);
    }
}
