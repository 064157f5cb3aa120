//! Safe wrapper around libpq for a single replication connection. Ported
//! from the original one-process-one-connection client and extended with
//! the slot-occupancy check §4.3 needs.

use std::ffi::{CStr, CString};
use std::ptr;
use std::time::Duration;

use libpq_sys::*;

use crate::errors::WorkerError;

pub struct PgConnection {
    conn: *mut PGconn,
}

/// Outcome of a single `get_copy_data` poll. `WouldBlock` and `Done` must
/// stay distinct: the former means wait on the socket and retry, the
/// latter means the server ended the COPY and the worker must reconnect.
pub enum CopyData {
    Data(Vec<u8>),
    WouldBlock,
    Done,
}

impl PgConnection {
    pub fn connect(conninfo: &str) -> Result<Self, WorkerError> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(WorkerError::connection("failed to allocate connection object"));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let message = get_error_message(conn).unwrap_or_else(|| "unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(WorkerError::connection(format!("connection failed: {message}")));
        }

        Ok(Self { conn })
    }

    /// Switches the connection to nonblocking mode. Called once
    /// `START_REPLICATION` has put the connection in COPY BOTH mode, so the
    /// setup queries beforehand (slot-occupancy check, `START_REPLICATION`
    /// itself) still run as ordinary blocking `PQexec` calls.
    pub fn set_nonblocking(&self) -> Result<(), WorkerError> {
        if unsafe { PQsetnonblocking(self.conn, 1) } != 0 {
            let message = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(WorkerError::connection(format!("failed to set nonblocking mode: {message}")));
        }
        Ok(())
    }

    /// Blocks until the socket is readable or `timeout` elapses, via
    /// `select(2)` on the underlying fd (§5: "implementations may set a
    /// socket read timeout... to bound this"). Returns `true` if the
    /// socket became readable, `false` on timeout.
    pub fn wait_readable(&self, timeout: Duration) -> Result<bool, WorkerError> {
        let fd = unsafe { PQsocket(self.conn) };
        if fd < 0 {
            return Err(WorkerError::connection("connection has no valid socket"));
        }

        let mut read_fds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_fds);
            libc::FD_SET(fd, &mut read_fds);
        }
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let ready = unsafe { libc::select(fd + 1, &mut read_fds, ptr::null_mut(), ptr::null_mut(), &mut tv) };
        match ready {
            -1 => Err(WorkerError::connection("select() on replication socket failed")),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    pub fn backend_pid(&self) -> i32 {
        unsafe { PQbackendPID(self.conn) }
    }

    pub fn exec(&self, query: &str) -> Result<PgResult, WorkerError> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            let message = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(WorkerError::protocol(format!("query execution failed: {message}")));
        }

        Ok(PgResult { result })
    }

    /// Nonblocking read of one row of COPY data, per
    /// <https://www.postgresql.org/docs/current/protocol-replication.html#PROTOCOL-REPLICATION-XLOGDATA>.
    /// Distinguishes "no data yet" from "server ended the COPY" so the
    /// caller can tell a quiet stream apart from one that needs reconnecting.
    pub fn get_copy_data(&self) -> Result<CopyData, WorkerError> {
        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let len = unsafe { PQgetCopyData(self.conn, &mut buffer, 1) };

        match len {
            -2 => {
                let message = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                Err(WorkerError::protocol(message))
            }
            -1 => {
                let result = PgResult { result: unsafe { PQgetResult(self.conn) } };
                if !result.is_ok() {
                    let message = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                    return Err(WorkerError::protocol(message));
                }
                Ok(CopyData::Done)
            }
            0 => Ok(CopyData::WouldBlock),
            len => {
                if buffer.is_null() {
                    return Err(WorkerError::protocol("received null copy-data buffer"));
                }
                let data = unsafe { std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec() };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(CopyData::Data(data))
            }
        }
    }

    /// Drains pending input from the socket into libpq's internal buffers.
    /// Must be called after `wait_readable` reports the socket is readable
    /// and before the next `get_copy_data`, per libpq's async COPY protocol.
    pub fn consume_input(&self) -> Result<(), WorkerError> {
        if unsafe { PQconsumeInput(self.conn) } != 1 {
            let message = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(WorkerError::protocol(format!("failed to consume input: {message}")));
        }
        Ok(())
    }

    pub fn put_copy_data(&self, data: &[u8]) -> Result<(), WorkerError> {
        let result = unsafe { PQputCopyData(self.conn, data.as_ptr() as *const std::os::raw::c_char, data.len() as i32) };
        if result != 1 {
            let message = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(WorkerError::protocol(format!("failed to send copy data: {message}")));
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), WorkerError> {
        let result = unsafe { PQflush(self.conn) };
        if result != 0 {
            return Err(WorkerError::protocol("failed to flush connection"));
        }
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

pub struct PgResult {
    result: *mut PGresult,
}

impl PgResult {
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status(), ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK)
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        let ptr = unsafe { PQgetvalue(self.result, row, col) };
        if ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(ptr).to_string_lossy().into_owned()) }
        }
    }
}

impl Drop for PgResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}

fn get_error_message(conn: *const PGconn) -> Option<String> {
    unsafe {
        let ptr = PQerrorMessage(conn);
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    }
}
