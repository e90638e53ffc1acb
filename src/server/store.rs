//! Server-side table store
//!
//! Tables hold typed rows. Every large (text/image) cell carries a version
//! token that changes on each write; a write must present the current one.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::constants::{msg_number, Severity, VERSION_TOKEN_LEN};
use crate::error::{Error, Result};
use crate::messages::ServerMessage;
use crate::row::{DataFormat, DataType, Value};
use crate::types::Descriptor;

/// Length of an encoded location: object id, row, column
const LOCATION_LEN: usize = 4 + 4 + 2;

/// One logged large-field update
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Table name
    pub table: String,
    /// Row index
    pub row: usize,
    /// Column index
    pub column: usize,
    /// Length of the new value
    pub length: usize,
    /// Version token after the update
    pub version: Bytes,
    /// When the update was applied
    pub at: DateTime<Utc>,
}

/// A row as handed to a result set: values plus descriptors of large cells
#[derive(Debug, Clone)]
pub(crate) struct ServerRow {
    pub values: Vec<Value>,
    pub descriptors: Vec<Option<Descriptor>>,
}

impl ServerRow {
    /// A row with no descriptors (procedure output)
    pub fn plain(values: Vec<Value>) -> Self {
        let descriptors = vec![None; values.len()];
        Self {
            values,
            descriptors,
        }
    }
}

#[derive(Debug)]
struct StoredRow {
    values: Vec<Value>,
    versions: Vec<Option<Bytes>>,
}

#[derive(Debug)]
struct Table {
    name: String,
    object_id: u32,
    columns: Vec<DataFormat>,
    rows: Vec<StoredRow>,
}

/// All tables of one server
#[derive(Debug)]
pub(crate) struct Store {
    server_name: String,
    tables: HashMap<String, Table>,
    clock: u64,
    change_log: Vec<ChangeRecord>,
}

impl Store {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            tables: HashMap::new(),
            // Seeded from wall time so tokens differ across server runs
            clock: Utc::now().timestamp_micros().unsigned_abs(),
            change_log: Vec::new(),
        }
    }

    fn next_version(&mut self) -> Bytes {
        self.clock += 1;
        let token = self.clock.to_be_bytes();
        debug_assert_eq!(token.len(), VERSION_TOKEN_LEN);
        Bytes::copy_from_slice(&token)
    }

    fn error(&self, number: u32, text: impl Into<String>) -> ServerMessage {
        ServerMessage::new(number, Severity::Error, text).from_server(&self.server_name)
    }

    pub fn create_table(&mut self, name: &str, columns: Vec<DataFormat>) -> Result<()> {
        let key = name.to_ascii_lowercase();
        if self.tables.contains_key(&key) {
            return Err(Error::InvalidArgument(format!("table {} already exists", name)));
        }
        if columns.is_empty() || columns.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "table {} needs between 1 and {} columns",
                name,
                u16::MAX
            )));
        }

        let object_id = loop {
            let id: u32 = rand::random();
            if id != 0 && self.tables.values().all(|t| t.object_id != id) {
                break id;
            }
        };
        tracing::debug!(table = name, object_id, "Created table");
        self.tables.insert(
            key,
            Table {
                name: name.to_string(),
                object_id,
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn insert_row(&mut self, table: &str, values: Vec<Value>) -> Result<usize> {
        let key = table.to_ascii_lowercase();
        let columns = match self.tables.get(&key) {
            Some(t) => t.columns.clone(),
            None => return Err(Error::InvalidArgument(format!("no table {}", table))),
        };
        if values.len() != columns.len() {
            return Err(Error::InvalidArgument(format!(
                "table {} has {} columns, got {} values",
                table,
                columns.len(),
                values.len()
            )));
        }
        if let Some((format, _)) = columns
            .iter()
            .zip(&values)
            .find(|(format, value)| !value.fits(format.datatype))
        {
            return Err(Error::InvalidArgument(format!(
                "value for column {} is not {}",
                format.name,
                format.datatype.name()
            )));
        }

        let versions = columns
            .iter()
            .map(|f| f.datatype.is_large().then(|| self.next_version()))
            .collect();
        let t = self
            .tables
            .get_mut(&key)
            .ok_or_else(|| Error::Internal(format!("table {} vanished", table)))?;
        if t.rows.len() >= u32::MAX as usize {
            return Err(Error::InvalidArgument(format!("table {} is full", table)));
        }
        t.rows.push(StoredRow { values, versions });
        Ok(t.rows.len() - 1)
    }

    /// Formats and rows of `table` with a descriptor for every large cell
    pub fn select(&self, table: &str) -> Option<(Vec<DataFormat>, Vec<ServerRow>)> {
        let t = self.tables.get(&table.to_ascii_lowercase())?;
        let rows = t
            .rows
            .iter()
            .enumerate()
            .map(|(row_index, row)| {
                let descriptors = row
                    .versions
                    .iter()
                    .enumerate()
                    .map(|(column, version)| {
                        version.as_ref().map(|version| {
                            Descriptor::new(
                                encode_location(t.object_id, row_index, column),
                                version.clone(),
                                row.values[column].to_bytes().len(),
                            )
                        })
                    })
                    .collect();
                ServerRow {
                    values: row.values.clone(),
                    descriptors,
                }
            })
            .collect();
        Some((t.columns.clone(), rows))
    }

    /// Replace a large cell under optimistic concurrency; returns the new
    /// version token
    pub fn write(
        &mut self,
        descriptor: &Descriptor,
        data: Bytes,
    ) -> std::result::Result<Bytes, ServerMessage> {
        let location = descriptor.location_hex();
        let (object_id, row, column) = decode_location(descriptor.location()).ok_or_else(|| {
            self.error(
                msg_number::BAD_DESCRIPTOR,
                format!("Malformed descriptor location {}.", location),
            )
        })?;
        let key = self
            .tables
            .iter()
            .find(|(_, t)| t.object_id == object_id)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| {
                self.error(
                    msg_number::BAD_DESCRIPTOR,
                    format!("No object for descriptor location {}.", location),
                )
            })?;

        let current = {
            let t = &self.tables[&key];
            let cell = t
                .rows
                .get(row)
                .and_then(|r| r.versions.get(column).map(|v| (v.clone(), t.columns[column].datatype)));
            match cell {
                None => {
                    return Err(self.error(
                        msg_number::BAD_DESCRIPTOR,
                        format!("Descriptor location {} is out of range.", location),
                    ))
                }
                Some((None, _)) => {
                    return Err(self.error(
                        msg_number::NOT_LARGE_FIELD,
                        format!("Column {} is not a large field.", column),
                    ))
                }
                Some((Some(version), datatype)) => (version, datatype),
            }
        };
        let (version, datatype) = current;

        if version.as_ref() != descriptor.version() {
            return Err(self.error(
                msg_number::STALE_VERSION,
                format!(
                    "Version {} of the large field at {} is not current.",
                    descriptor.version_hex(),
                    location
                ),
            ));
        }
        if descriptor.total_length() != data.len() {
            return Err(self.error(
                msg_number::LENGTH_MISMATCH,
                format!(
                    "Descriptor declares {} bytes but {} were sent.",
                    descriptor.total_length(),
                    data.len()
                ),
            ));
        }

        let new_version = self.next_version();
        let length = data.len();
        let value = match datatype {
            DataType::Image => Value::Image(data),
            _ => Value::Text(data),
        };
        let t = self
            .tables
            .get_mut(&key)
            .ok_or_else(|| ServerMessage::new(msg_number::BAD_DESCRIPTOR, Severity::Error, "table vanished"))?;
        let stored = &mut t.rows[row];
        stored.values[column] = value;
        stored.versions[column] = Some(new_version.clone());
        let table = t.name.clone();

        if descriptor.log_change() {
            self.change_log.push(ChangeRecord {
                table: table.clone(),
                row,
                column,
                length,
                version: new_version.clone(),
                at: Utc::now(),
            });
        }
        tracing::debug!(
            table = %table,
            row,
            column,
            length,
            version = %hex::encode(&new_version),
            "Large field written"
        );
        Ok(new_version)
    }

    pub fn value(&self, table: &str, row: usize, column: usize) -> Option<Value> {
        self.tables
            .get(&table.to_ascii_lowercase())?
            .rows
            .get(row)?
            .values
            .get(column)
            .cloned()
    }

    pub fn version(&self, table: &str, row: usize, column: usize) -> Option<Bytes> {
        self.tables
            .get(&table.to_ascii_lowercase())?
            .rows
            .get(row)?
            .versions
            .get(column)?
            .clone()
    }

    pub fn change_log(&self) -> &[ChangeRecord] {
        &self.change_log
    }
}

fn encode_location(object_id: u32, row: usize, column: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(LOCATION_LEN);
    buf.put_u32(object_id);
    buf.put_u32(row as u32);
    buf.put_u16(column as u16);
    buf.freeze()
}

fn decode_location(location: &[u8]) -> Option<(u32, usize, usize)> {
    if location.len() != LOCATION_LEN {
        return None;
    }
    let object_id = u32::from_be_bytes(location[0..4].try_into().ok()?);
    let row = u32::from_be_bytes(location[4..8].try_into().ok()?) as usize;
    let column = u16::from_be_bytes(location[8..10].try_into().ok()?) as usize;
    Some((object_id, row, column))
}
