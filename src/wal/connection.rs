//! Synchronous libpq wrapper for the replication connection.
//!
//! Logical replication's `COPY BOTH` mode isn't exposed by `tokio-postgres`,
//! so the teacher reaches for raw `libpq-sys` instead; this module is a
//! direct port of the teacher's `src/utils/connection.rs`, run on a blocking
//! task (see `wal::driver`) rather than the teacher's dedicated OS thread.

use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::ptr;

use libpq_sys::{
    PGconn, PGresult, PQclear, PQconnectdb, PQerrorMessage, PQexec, PQfinish, PQflush,
    PQgetCopyData, PQgetisnull, PQgetvalue, PQnfields, PQntuples, PQputCopyData, PQresultStatus,
    PQstatus, ConnStatusType, ExecStatusType,
};

use crate::error::{Error, Result};

pub struct PgConnection {
    conn: *mut PGconn,
}

// Safety: PGconn is only ever touched from the single task that owns this
// connection; we never share `*mut PGconn` across threads concurrently.
unsafe impl Send for PgConnection {}

impl PgConnection {
    pub fn connect(conninfo: &str) -> Result<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };
        if conn.is_null() {
            return Err(Error::connection("PQconnectdb returned a null connection"));
        }
        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let message = Self::error_message(conn);
            unsafe { PQfinish(conn) };
            return Err(Error::connection(format!(
                "failed to connect to postgres: {message}"
            )));
        }
        Ok(Self { conn })
    }

    fn error_message(conn: *mut PGconn) -> String {
        unsafe {
            let ptr = PQerrorMessage(conn);
            if ptr.is_null() {
                "unknown error".to_string()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }

    pub fn exec(&self, query: &str) -> Result<PgResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };
        if result.is_null() {
            return Err(Error::connection("PQexec returned a null result"));
        }
        Ok(PgResult { result })
    }

    /// Polls for one `CopyData` message. Returns `Ok(None)` on timeout (no
    /// data yet, non-blocking caller should retry), `Ok(Some(bytes))` on
    /// data, `Err` when the copy stream ends or fails.
    pub fn get_copy_data(&self, async_mode: bool) -> Result<Option<Vec<u8>>> {
        let mut buffer: *mut i8 = ptr::null_mut();
        let len = unsafe { PQgetCopyData(self.conn, &mut buffer, async_mode as c_int) };
        match len {
            0 => Ok(None), // no data available yet (async mode)
            -1 => Ok(None), // copy done; caller checks result status separately
            -2 => {
                let message = Self::error_message(self.conn);
                Err(Error::connection(format!("copy data error: {message}")))
            }
            n if n > 0 => {
                let slice = unsafe { std::slice::from_raw_parts(buffer as *const u8, n as usize) };
                let data = slice.to_vec();
                unsafe { libc::free(buffer as *mut libc::c_void) };
                Ok(Some(data))
            }
            _ => Ok(None),
        }
    }

    pub fn put_copy_data(&self, data: &[u8]) -> Result<()> {
        let result = unsafe {
            PQputCopyData(self.conn, data.as_ptr() as *const i8, data.len() as c_int)
        };
        if result < 0 {
            let message = Self::error_message(self.conn);
            return Err(Error::connection(format!("failed to write copy data: {message}")));
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let result = unsafe { PQflush(self.conn) };
        if result < 0 {
            let message = Self::error_message(self.conn);
            return Err(Error::connection(format!("flush failed: {message}")));
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
        matches!(
            self.status(),
            ExecStatusType::PGRES_COMMAND_OK
                | ExecStatusType::PGRES_TUPLES_OK
                | ExecStatusType::PGRES_COPY_BOTH
                | ExecStatusType::PGRES_COPY_OUT
        )
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    pub fn nfields(&self) -> i32 {
        unsafe { PQnfields(self.result) }
    }

    pub fn is_null(&self, row: i32, col: i32) -> bool {
        unsafe { PQgetisnull(self.result, row, col) != 0 }
    }

    pub fn getvalue(&self, row: i32, col: i32) -> String {
        unsafe {
            let ptr = PQgetvalue(self.result, row, col);
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
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
