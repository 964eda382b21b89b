//! Durable projection of the engine's `last_seen_block`.
//!
//! `last_seen_block` is otherwise process-local, in-memory state, but a real
//! long-running process needs to resume from its last completed tick rather
//! than `genesis_block_number` on every restart. It's persisted under a
//! fixed single key rather than scanning for the highest indexed block.

use std::sync::Arc;

use rocksdb::DB;

use crate::error::{EngineError, EngineResult};
use crate::types::LastSeenBlock;

const CF_ENGINE_STATE: &str = "engine_state";
const KEY_LAST_SEEN_BLOCK: &[u8] = b"last_seen_block";

pub fn load(db: &Arc<DB>) -> EngineResult<Option<LastSeenBlock>> {
    let cf = db
        .cf_handle(CF_ENGINE_STATE)
        .ok_or_else(|| EngineError::PersistenceError(format!("{CF_ENGINE_STATE} CF not found")))?;
    match db
        .get_cf(&cf, KEY_LAST_SEEN_BLOCK)
        .map_err(|e| EngineError::PersistenceError(format!("reading last_seen_block: {e}")))?
    {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(|e| {
            EngineError::PersistenceError(format!("decoding last_seen_block: {e}"))
        })?)),
        None => Ok(None),
    }
}

pub fn store(db: &Arc<DB>, last_seen: Option<&LastSeenBlock>) -> EngineResult<()> {
    let cf = db
        .cf_handle(CF_ENGINE_STATE)
        .ok_or_else(|| EngineError::PersistenceError(format!("{CF_ENGINE_STATE} CF not found")))?;
    match last_seen {
        Some(l) => {
            let value = bincode::serialize(l)
                .map_err(|e| EngineError::PersistenceError(format!("encoding last_seen_block: {e}")))?;
            db.put_cf(&cf, KEY_LAST_SEEN_BLOCK, value)
                .map_err(|e| EngineError::PersistenceError(format!("writing last_seen_block: {e}")))
        }
        None => db
            .delete_cf(&cf, KEY_LAST_SEEN_BLOCK)
            .map_err(|e| EngineError::PersistenceError(format!("clearing last_seen_block: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::{ColumnFamilyDescriptor, Options};
    use tempfile::TempDir;

    fn open_test_db() -> (TempDir, Arc<DB>) {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = vec![ColumnFamilyDescriptor::new(CF_ENGINE_STATE, Options::default())];
        let db = DB::open_cf_descriptors(&opts, dir.path(), cfs).unwrap();
        (dir, Arc::new(db))
    }

    #[test]
    fn round_trips_through_store_and_load() {
        let (_dir, db) = open_test_db();
        assert_eq!(load(&db).unwrap(), None);
        let l = LastSeenBlock { height: 103, hash: "h103".into() };
        store(&db, Some(&l)).unwrap();
        assert_eq!(load(&db).unwrap(), Some(l));
    }

    #[test]
    fn clearing_removes_the_marker() {
        let (_dir, db) = open_test_db();
        store(&db, Some(&LastSeenBlock { height: 1, hash: "h1".into() })).unwrap();
        store(&db, None).unwrap();
        assert_eq!(load(&db).unwrap(), None);
    }
}
