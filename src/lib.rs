//! Safe handle layer over the LMDB key-value engine.
//!
//! Handles form a tree: an [`Environment`] begins [`Transaction`]s, a
//! transaction opens [`Database`] handles, and a database handle opens
//! [`Cursor`]s. Each child keeps its parent alive through the per-thread
//! [`registry`], and each checks the liveness of its transaction before
//! touching the engine, so a handle that outlives a commit, abort or close
//! fails with an error instead of reaching a freed native object.
//!
//! ```no_run
//! use lumobind::{DbFlags, EnvConfig, TxnFlags, WriteFlags};
//!
//! # fn main() -> lumobind::Result<()> {
//! let env = EnvConfig::new().map_size(4 << 20).open("/tmp/lumobind")?;
//! let txn = env.begin(TxnFlags::empty())?;
//! let db = txn.open_database(None, DbFlags::empty())?;
//! db.put(b"name", b"Lua User", WriteFlags::empty())?;
//! txn.commit()?;
//! env.close()?;
//! # Ok(())
//! # }
//! ```

use std::ffi::CStr;
use std::os::raw::c_int;

use lmdb_master_sys as ffi;
use once_cell::sync::Lazy;

mod constants;
mod cursor;
mod database;
mod env;
mod error;
pub mod registry;
mod transaction;
mod types;
mod value;

pub use constants::{
    CursorOp, DbFlags, EnvFlags, TxnFlags, WriteFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS,
    DEFAULT_MAX_READERS, DEFAULT_MODE,
};
pub use cursor::{Cursor, Entry, Iter};
pub use database::Database;
pub use env::{EnvConfig, Environment, ReaderLines};
pub use error::{code_by_name, code_name, strerror, Error, Failure, FailureExt, Result};
pub use transaction::{Transaction, TxnStatus};
pub use types::{EnvInfo, Property, PropertyValue, Setting, Stat, Version};

static VERSION: Lazy<Version> = Lazy::new(|| {
    let (mut major, mut minor, mut patch): (c_int, c_int, c_int) = (0, 0, 0);
    let string = unsafe {
        let raw = ffi::mdb_version(&mut major, &mut minor, &mut patch);
        CStr::from_ptr(raw).to_string_lossy().into_owned()
    };
    Version {
        string,
        major,
        minor,
        patch,
    }
});

/// Version of the linked engine library.
pub fn version() -> &'static Version {
    &VERSION
}
