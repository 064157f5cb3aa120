//! Builds the `StandbyStatusUpdate` ('r') feedback message the worker
//! sends to advance the server's notion of how much WAL this consumer
//! has safely processed.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::WorkerError;
use crate::wire::BufferWriter;

const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

fn now_as_pg_timestamp() -> i64 {
    let since_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let unix_micros = since_unix.as_secs() as i64 * 1_000_000 + since_unix.subsec_micros() as i64;
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// `write_lsn` = `flush_lsn` = `apply_lsn` = the flush point (§4.3): the
/// core has no separate notion of "written but not applied," so all
/// three fields carry the same value.
pub fn build_standby_status_update(flush_lsn: u64) -> Result<[u8; 34], WorkerError> {
    let mut buf = [0u8; 34];
    let mut writer = BufferWriter::new(&mut buf);
    writer.write_u8(b'r').map_err(|e| WorkerError::protocol(e.to_string()))?;
    writer.write_u64(flush_lsn).map_err(|e| WorkerError::protocol(e.to_string()))?;
    writer.write_u64(flush_lsn).map_err(|e| WorkerError::protocol(e.to_string()))?;
    writer.write_u64(flush_lsn).map_err(|e| WorkerError::protocol(e.to_string()))?;
    writer.write_i64(now_as_pg_timestamp()).map_err(|e| WorkerError::protocol(e.to_string()))?;
    writer.write_u8(0).map_err(|e| WorkerError::protocol(e.to_string()))?;
    Ok(buf)
}
