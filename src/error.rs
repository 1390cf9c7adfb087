use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_int;
use std::result;

use lazy_static::lazy_static;
use lmdb_master_sys as ffi;

/// Custom result type for binding operations
pub type Result<T> = result::Result<T, Error>;

/// Failures surfaced by the binding.
///
/// The first block mirrors the engine's fixed error-code space one to one.
/// `Os` carries a plain errno reported by the engine. The remaining variants
/// are raised locally, before any native call is attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("MDB_KEYEXIST: Key/data pair already exists")]
    KeyExist,
    #[error("MDB_NOTFOUND: No matching key/data pair found")]
    NotFound,
    #[error("MDB_PAGE_NOTFOUND: Requested page not found")]
    PageNotFound,
    #[error("MDB_CORRUPTED: Located page was wrong type")]
    Corrupted,
    #[error("MDB_PANIC: Update of meta page failed or environment had fatal error")]
    Panic,
    #[error("MDB_VERSION_MISMATCH: Database environment version mismatch")]
    VersionMismatch,
    #[error("MDB_INVALID: File is not an LMDB file")]
    Invalid,
    #[error("MDB_MAP_FULL: Environment mapsize limit reached")]
    MapFull,
    #[error("MDB_DBS_FULL: Environment maxdbs limit reached")]
    DbsFull,
    #[error("MDB_READERS_FULL: Environment maxreaders limit reached")]
    ReadersFull,
    #[error("MDB_TLS_FULL: Thread-local storage keys full - too many environments open")]
    TlsFull,
    #[error("MDB_TXN_FULL: Transaction has too many dirty pages - transaction too big")]
    TxnFull,
    #[error("MDB_CURSOR_FULL: Internal error - cursor stack limit reached")]
    CursorFull,
    #[error("MDB_PAGE_FULL: Internal error - page has no more space")]
    PageFull,
    #[error("MDB_MAP_RESIZED: Database contents grew beyond environment mapsize")]
    MapResized,
    #[error("MDB_INCOMPATIBLE: Operation and DB incompatible, or DB flags changed")]
    Incompatible,
    #[error("MDB_BAD_RSLOT: Invalid reuse of reader locktable slot")]
    BadRslot,
    #[error("MDB_BAD_TXN: Transaction must abort, has a child, or is invalid")]
    BadTxn,
    #[error("MDB_BAD_VALSIZE: Unsupported size of key/DB name/data, or wrong DUPFIXED size")]
    BadValSize,
    #[error("MDB_BAD_DBI: The specified DBI handle was closed/changed unexpectedly")]
    BadDbi,
    #[error("MDB_PROBLEM: Unexpected problem - txn should abort")]
    Problem,
    /// System error code passed through by the engine
    #[error("{}", os_message(.0))]
    Os(c_int),

    /// Environment handle was closed
    #[error("environment is closed")]
    EnvClosed,
    /// Transaction was committed or aborted
    #[error("transaction already ended")]
    TxnEnded,
    /// Read-only transaction is parked by reset()
    #[error("transaction is reset and must be renewed before use")]
    TxnReset,
    /// Handle outlived the transaction it was opened under
    #[error("stale handle: owning transaction is no longer live")]
    StaleHandle,
    /// Handle was closed explicitly
    #[error("handle is closed")]
    HandleClosed,
    /// reset/renew on a write transaction or its cursors
    #[error("operation requires a read-only transaction")]
    NotReadOnly,
    /// Table was deleted with drop_table(true) earlier in this transaction
    #[error("database was dropped in this transaction")]
    DatabaseDropped,
    #[error("registry token {0:#x} is not outstanding")]
    InvalidToken(u64),
    #[error("handle registry is full")]
    RegistryFull,
    #[error("unknown property: {0}")]
    UnknownProperty(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Reader-list callback returned an error or panicked
    #[error("error in reader_list: {0}")]
    Callback(String),
}

impl Error {
    /// Numeric status code reported in the failure triple.
    pub fn code(&self) -> i32 {
        match self {
            Error::KeyExist => ffi::MDB_KEYEXIST,
            Error::NotFound => ffi::MDB_NOTFOUND,
            Error::PageNotFound => ffi::MDB_PAGE_NOTFOUND,
            Error::Corrupted => ffi::MDB_CORRUPTED,
            Error::Panic => ffi::MDB_PANIC,
            Error::VersionMismatch => ffi::MDB_VERSION_MISMATCH,
            Error::Invalid => ffi::MDB_INVALID,
            Error::MapFull => ffi::MDB_MAP_FULL,
            Error::DbsFull => ffi::MDB_DBS_FULL,
            Error::ReadersFull => ffi::MDB_READERS_FULL,
            Error::TlsFull => ffi::MDB_TLS_FULL,
            Error::TxnFull => ffi::MDB_TXN_FULL,
            Error::CursorFull => ffi::MDB_CURSOR_FULL,
            Error::PageFull => ffi::MDB_PAGE_FULL,
            Error::MapResized => ffi::MDB_MAP_RESIZED,
            Error::Incompatible => ffi::MDB_INCOMPATIBLE,
            Error::BadRslot => ffi::MDB_BAD_RSLOT,
            Error::BadTxn => ffi::MDB_BAD_TXN,
            Error::BadValSize => ffi::MDB_BAD_VALSIZE,
            Error::BadDbi => ffi::MDB_BAD_DBI,
            Error::Problem => ffi::MDB_PROBLEM,
            Error::Os(code) => *code,
            Error::TxnEnded | Error::TxnReset | Error::StaleHandle => ffi::MDB_BAD_TXN,
            Error::DatabaseDropped => ffi::MDB_BAD_DBI,
            Error::RegistryFull => libc::ENOMEM,
            Error::Callback(_) => -1,
            Error::EnvClosed
            | Error::HandleClosed
            | Error::NotReadOnly
            | Error::InvalidToken(_)
            | Error::UnknownProperty(_)
            | Error::InvalidArgument(_) => libc::EINVAL,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// True for conditions raised by the binding without reaching the engine.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::EnvClosed
                | Error::TxnEnded
                | Error::TxnReset
                | Error::StaleHandle
                | Error::HandleClosed
                | Error::NotReadOnly
                | Error::DatabaseDropped
                | Error::InvalidToken(_)
                | Error::UnknownProperty(_)
                | Error::InvalidArgument(_)
        )
    }
}

impl From<c_int> for Error {
    fn from(err: c_int) -> Error {
        match err {
            ffi::MDB_KEYEXIST => Error::KeyExist,
            ffi::MDB_NOTFOUND => Error::NotFound,
            ffi::MDB_PAGE_NOTFOUND => Error::PageNotFound,
            ffi::MDB_CORRUPTED => Error::Corrupted,
            ffi::MDB_PANIC => Error::Panic,
            ffi::MDB_VERSION_MISMATCH => Error::VersionMismatch,
            ffi::MDB_INVALID => Error::Invalid,
            ffi::MDB_MAP_FULL => Error::MapFull,
            ffi::MDB_DBS_FULL => Error::DbsFull,
            ffi::MDB_READERS_FULL => Error::ReadersFull,
            ffi::MDB_TLS_FULL => Error::TlsFull,
            ffi::MDB_TXN_FULL => Error::TxnFull,
            ffi::MDB_CURSOR_FULL => Error::CursorFull,
            ffi::MDB_PAGE_FULL => Error::PageFull,
            ffi::MDB_MAP_RESIZED => Error::MapResized,
            ffi::MDB_INCOMPATIBLE => Error::Incompatible,
            ffi::MDB_BAD_RSLOT => Error::BadRslot,
            ffi::MDB_BAD_TXN => Error::BadTxn,
            ffi::MDB_BAD_VALSIZE => Error::BadValSize,
            ffi::MDB_BAD_DBI => Error::BadDbi,
            ffi::MDB_PROBLEM => Error::Problem,
            err => Error::Os(err),
        }
    }
}

/// Helper trait for converting engine status codes to Results
pub(crate) trait IntoResult {
    fn into_result(self) -> Result<()>;
}

impl IntoResult for c_int {
    fn into_result(self) -> Result<()> {
        if self == ffi::MDB_SUCCESS {
            Ok(())
        } else {
            Err(Error::from(self))
        }
    }
}

/// Message text the engine associates with a status code.
pub fn strerror(code: i32) -> String {
    // mdb_strerror returns static storage for every input.
    unsafe { CStr::from_ptr(ffi::mdb_strerror(code)) }
        .to_string_lossy()
        .into_owned()
}

fn os_message(code: &c_int) -> String {
    strerror(*code)
}

/// Owned message/code pair of a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    pub code: i32,
}

impl From<Error> for Failure {
    fn from(err: Error) -> Failure {
        Failure {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Flattens a result into the `(value, message, code)` triple: exactly one
/// of `value` and the `message`/`code` pair is present.
pub trait FailureExt<T> {
    fn into_triple(self) -> (Option<T>, Option<String>, Option<i32>);
}

impl<T> FailureExt<T> for Result<T> {
    fn into_triple(self) -> (Option<T>, Option<String>, Option<i32>) {
        match self {
            Ok(value) => (Some(value), None, None),
            Err(err) => {
                let failure = Failure::from(err);
                (None, Some(failure.message), Some(failure.code))
            }
        }
    }
}

lazy_static! {
    static ref CODES: HashMap<&'static str, c_int> = {
        let mut codes = HashMap::new();
        codes.insert("SUCCESS", ffi::MDB_SUCCESS);
        codes.insert("KEYEXIST", ffi::MDB_KEYEXIST);
        codes.insert("NOTFOUND", ffi::MDB_NOTFOUND);
        codes.insert("PAGE_NOTFOUND", ffi::MDB_PAGE_NOTFOUND);
        codes.insert("CORRUPTED", ffi::MDB_CORRUPTED);
        codes.insert("PANIC", ffi::MDB_PANIC);
        codes.insert("VERSION_MISMATCH", ffi::MDB_VERSION_MISMATCH);
        codes.insert("INVALID", ffi::MDB_INVALID);
        codes.insert("MAP_FULL", ffi::MDB_MAP_FULL);
        codes.insert("DBS_FULL", ffi::MDB_DBS_FULL);
        codes.insert("READERS_FULL", ffi::MDB_READERS_FULL);
        codes.insert("TLS_FULL", ffi::MDB_TLS_FULL);
        codes.insert("TXN_FULL", ffi::MDB_TXN_FULL);
        codes.insert("CURSOR_FULL", ffi::MDB_CURSOR_FULL);
        codes.insert("PAGE_FULL", ffi::MDB_PAGE_FULL);
        codes.insert("MAP_RESIZED", ffi::MDB_MAP_RESIZED);
        codes.insert("INCOMPATIBLE", ffi::MDB_INCOMPATIBLE);
        codes.insert("BAD_RSLOT", ffi::MDB_BAD_RSLOT);
        codes.insert("BAD_TXN", ffi::MDB_BAD_TXN);
        codes.insert("BAD_VALSIZE", ffi::MDB_BAD_VALSIZE);
        codes.insert("BAD_DBI", ffi::MDB_BAD_DBI);
        codes.insert("PROBLEM", ffi::MDB_PROBLEM);
        codes.insert("LAST_ERRCODE", ffi::MDB_LAST_ERRCODE);
        codes
    };
}

/// Looks up an engine status code by its short name, e.g. `"NOTFOUND"`.
pub fn code_by_name(name: &str) -> Option<i32> {
    CODES.get(name).copied()
}

/// Short name of an engine status code. `LAST_ERRCODE` aliases `PROBLEM`
/// and is never returned.
pub fn code_name(code: i32) -> Option<&'static str> {
    CODES
        .iter()
        .filter(|(name, _)| **name != "LAST_ERRCODE")
        .find(|(_, value)| **value == code)
        .map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_codes_round_trip_through_variants() {
        for code in ffi::MDB_KEYEXIST..=ffi::MDB_LAST_ERRCODE {
            let err = Error::from(code);
            assert!(!matches!(err, Error::Os(_)), "code {} unmapped", code);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn engine_messages_match_strerror() {
        assert_eq!(Error::NotFound.to_string(), strerror(ffi::MDB_NOTFOUND));
        assert_eq!(Error::MapFull.to_string(), strerror(ffi::MDB_MAP_FULL));
        assert_eq!(Error::Os(libc::EINVAL).to_string(), strerror(libc::EINVAL));
    }

    #[test]
    fn misuse_codes() {
        assert_eq!(Error::StaleHandle.code(), ffi::MDB_BAD_TXN);
        assert_eq!(Error::TxnEnded.code(), ffi::MDB_BAD_TXN);
        assert_eq!(Error::DatabaseDropped.code(), ffi::MDB_BAD_DBI);
        assert_eq!(Error::RegistryFull.code(), libc::ENOMEM);
        assert_eq!(Error::EnvClosed.code(), libc::EINVAL);
        assert!(Error::StaleHandle.is_misuse());
        assert!(!Error::NotFound.is_misuse());
    }

    #[test]
    fn triple_has_exactly_one_side() {
        let ok: Result<u32> = Ok(7);
        assert_eq!(ok.into_triple(), (Some(7), None, None));

        let err: Result<u32> = Err(Error::KeyExist);
        let (value, message, code) = err.into_triple();
        assert!(value.is_none());
        assert_eq!(message.as_deref(), Some("MDB_KEYEXIST: Key/data pair already exists"));
        assert_eq!(code, Some(ffi::MDB_KEYEXIST));
    }

    #[test]
    fn code_names() {
        assert_eq!(code_by_name("NOTFOUND"), Some(-30798));
        assert_eq!(code_by_name("LAST_ERRCODE"), Some(ffi::MDB_PROBLEM));
        assert_eq!(code_by_name("nope"), None);
        assert_eq!(code_name(ffi::MDB_PROBLEM), Some("PROBLEM"));
        assert_eq!(code_name(0), Some("SUCCESS"));
    }
}
