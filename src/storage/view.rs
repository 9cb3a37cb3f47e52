use crate::core::{SequenceNumber, TableData, Tables};

/// Consistent point-in-time copy of an instance's tables.
///
/// Cloning is cheap: the tables are persistent maps sharing structure with
/// the instance they were taken from.
#[derive(Debug, Clone, Default)]
pub struct ReadView {
    sequence: SequenceNumber,
    tables: Tables,
}

impl ReadView {
    pub fn new(sequence: SequenceNumber, tables: Tables) -> Self {
        Self { sequence, tables }
    }

    /// Sequence number the view was taken at
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn table(&self, table: &str) -> Option<&TableData> {
        self.tables.get(table)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn get(&self, table: &str, key: &str) -> Option<&[u8]> {
        self.tables
            .get(table)
            .and_then(|data| data.get(key))
            .map(|value| value.as_slice())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|data| data.len()).unwrap_or(0)
    }

    /// Iterate a table in key order. A missing table yields nothing.
    pub fn scan<'a>(&'a self, table: &'a str) -> impl Iterator<Item = (&'a str, &'a [u8])> + 'a {
        self.tables
            .get(table)
            .into_iter()
            .flat_map(|data| data.iter())
            .map(|(key, value)| (key.as_str(), value.as_slice()))
    }

    /// Iterate the keys of a table that start with `prefix`, in key order.
    pub fn scan_prefix<'a>(
        &'a self,
        table: &'a str,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a [u8])> + 'a {
        self.scan(table)
            .skip_while(move |(key, _)| *key < prefix)
            .take_while(move |(key, _)| key.starts_with(prefix))
    }
}
