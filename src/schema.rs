//! Table-name registry layered on the trie.
//!
//! The schema maps table names to 64-bit file numbers. Table entries live
//! under the reserved key prefix `@ut`; the monotonic counter of the last
//! issued number is stored under `@@@@LastFileNumber` as 8 little-endian
//! bytes. Numbering starts above [`FIRST_FILE_NUMBER`] so that table files
//! are never confused with low-numbered system files.

use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::trie::Trie;
use crate::Config;

use byteorder::{ByteOrder, LittleEndian};

use log::info;

/// Reserved key prefix for table entries.
pub const TABLE_PREFIX: &[u8] = b"@ut";

/// Key of the monotonic last-issued file number.
pub const LAST_FILE_NUMBER_KEY: &[u8] = b"@@@@LastFileNumber";

/// Seed of the file-number counter; the first table is issued
/// `FIRST_FILE_NUMBER + 1`.
pub const FIRST_FILE_NUMBER: u64 = 10_000_000;

/// Table-name registry owning a [`Trie`].
pub struct Schema<S: Storage> {
    trie: Trie<S>,
}

impl<S: Storage> Schema<S> {
    /// Wrap an already-open trie.
    pub fn new(trie: Trie<S>) -> Self {
        Self { trie }
    }

    /// Open a schema over `storage`.
    pub fn open(storage: S, config: &Config) -> Result<Self> {
        Ok(Self::new(Trie::open(storage, config)?))
    }

    /// The underlying trie.
    pub fn trie(&self) -> &Trie<S> {
        &self.trie
    }

    /// Consume the schema, returning the underlying trie.
    pub fn into_trie(self) -> Trie<S> {
        self.trie
    }

    /// The last issued file number, or the counter seed if none was issued
    /// yet.
    pub fn last_file_number(&self) -> Result<u64> {
        match self.trie.get(LAST_FILE_NUMBER_KEY)? {
            Some(value) => decode_file_number(&value),
            None => Ok(FIRST_FILE_NUMBER),
        }
    }

    /// Get the file number registered for `name`, creating a new one if the
    /// table does not exist yet. Idempotent: a second call returns the same
    /// number without touching the registry.
    pub fn file_number_or_create(&self, name: &str) -> Result<u64> {
        validate_table_name(name)?;
        let key = table_key(name);
        if let Some(value) = self.trie.get(&key)? {
            return decode_file_number(&value);
        }

        let number = self.last_file_number()? + 1;
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, number);
        self.trie.set(LAST_FILE_NUMBER_KEY, &buf)?;
        self.trie.set(&key, &buf)?;
        info!("Registered table {:?} as file {}", name, number);
        Ok(number)
    }

    /// List all table names starting with `prefix`, in ascending order.
    pub fn tables(&self, prefix: &str) -> Result<Vec<String>> {
        let mut key_prefix = TABLE_PREFIX.to_vec();
        key_prefix.extend_from_slice(prefix.as_bytes());

        let mut names = Vec::new();
        for row in self.trie.start_with(&key_prefix)? {
            let row = row?;
            names.push(String::from_utf8_lossy(&row.key[TABLE_PREFIX.len()..]).into_owned());
        }
        Ok(names)
    }

    /// Flush the underlying trie.
    pub fn flush(&self) -> Result<()> {
        self.trie.flush()
    }
}

fn table_key(name: &str) -> Vec<u8> {
    let mut key = TABLE_PREFIX.to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("Table name cannot be empty".into()));
    }
    Ok(())
}

fn decode_file_number(value: &[u8]) -> Result<u64> {
    if value.len() != 8 {
        return Err(Error::Corrupted(format!(
            "file number record of {} bytes, expected 8",
            value.len()
        )));
    }
    Ok(LittleEndian::read_u64(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn open_schema() -> Schema<MemoryStorage> {
        Schema::open(MemoryStorage::new(), &Config::default()).unwrap()
    }

    #[test]
    fn test_create_and_lookup() {
        let schema = open_schema();
        assert_eq!(schema.last_file_number().unwrap(), FIRST_FILE_NUMBER);

        let first = schema.file_number_or_create("Users").unwrap();
        assert_eq!(first, FIRST_FILE_NUMBER + 1);
        let second = schema.file_number_or_create("Orders").unwrap();
        assert_eq!(second, FIRST_FILE_NUMBER + 2);

        // Idempotent
        assert_eq!(schema.file_number_or_create("Users").unwrap(), first);
        assert_eq!(schema.last_file_number().unwrap(), second);
        assert_eq!(schema.trie().record_count(), 3);
    }

    #[test]
    fn test_invalid_table_name() {
        let schema = open_schema();
        assert!(matches!(
            schema.file_number_or_create(""),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_tables_listing() {
        let schema = open_schema();
        for name in ["Gamma", "Alpha", "AlphaBeta", "Beta"] {
            schema.file_number_or_create(name).unwrap();
        }

        assert_eq!(
            schema.tables("").unwrap(),
            vec!["Alpha", "AlphaBeta", "Beta", "Gamma"]
        );
        assert_eq!(schema.tables("Alpha").unwrap(), vec!["Alpha", "AlphaBeta"]);
        assert_eq!(schema.tables("Ze").unwrap(), Vec::<String>::new());
    }

    /// Mirror of the legacy schema fixture: 4281 tables plus the counter
    /// record, with `IndexProgress` created sixth and the `TestTa` quartet
    /// for prefix counting.
    fn build_fixture() -> Schema<MemoryStorage> {
        let schema = open_schema();
        for name in ["Accounts", "Balances", "Customers", "Deposits", "Events"] {
            schema.file_number_or_create(name).unwrap();
        }
        schema.file_number_or_create("IndexProgress").unwrap();
        for name in ["TestTa", "TestTab1", "TestTab2", "TestTab3"] {
            schema.file_number_or_create(name).unwrap();
        }
        for i in 0..4271 {
            schema
                .file_number_or_create(&format!("Bulk{:05}", i))
                .unwrap();
        }
        schema
    }

    #[test]
    fn test_fixture_counts_and_numbers() {
        let schema = build_fixture();

        assert_eq!(schema.trie().record_count(), 4282);
        assert_eq!(schema.last_file_number().unwrap(), 10_004_281);
        assert_eq!(
            schema.file_number_or_create("IndexProgress").unwrap(),
            10_000_006
        );

        // The counter row itself
        let row = schema
            .trie()
            .get_row(LAST_FILE_NUMBER_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(row.value_length, 8);
        assert!(row.value_pointer > row.pointer);
        let value = schema.trie().read_value(&row).unwrap();
        assert_eq!(LittleEndian::read_u64(&value), 10_004_281);
        assert!(schema.trie().get_row(b"notexists").unwrap().is_none());
    }

    #[test]
    fn test_fixture_prefix_enumeration() {
        let schema = build_fixture();

        let tables = schema.tables("TestTa").unwrap();
        assert_eq!(tables, vec!["TestTa", "TestTab1", "TestTab2", "TestTab3"]);
        assert_eq!(schema.tables("TestTab").unwrap().len(), 3);
        assert_eq!(schema.tables("").unwrap().len(), 4281);

        // Ascending order overall
        let all = schema.tables("").unwrap();
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
    }

    #[test]
    fn test_fixture_best_match() {
        let schema = build_fixture();
        let trie = schema.trie();

        assert!(!trie.best_match(b"POFwoinfOWu").unwrap().has_link());
        assert!(!trie.best_match(b"@utTestT").unwrap().has_link());
        assert!(trie.best_match(b"@utTestTa").unwrap().has_link());
        assert!(trie.best_match(b"@utIndexProgressss").unwrap().has_link());
    }

    #[test]
    fn test_fixture_insert_and_reload() {
        let config = Config::default();
        let schema = build_fixture();

        let number = schema.file_number_or_create("NotExists").unwrap();
        assert_eq!(number, 10_004_282);
        assert_eq!(schema.trie().record_count(), 4283);

        // A second call changes nothing
        assert_eq!(schema.file_number_or_create("NotExists").unwrap(), number);
        assert_eq!(schema.trie().record_count(), 4283);

        schema.flush().unwrap();
        let storage = schema.into_trie().into_storage();
        let schema = Schema::open(storage, &config).unwrap();
        assert_eq!(schema.file_number_or_create("NotExists").unwrap(), number);
        assert_eq!(schema.trie().record_count(), 4283);
        assert_eq!(schema.last_file_number().unwrap(), 10_004_282);
    }
}
