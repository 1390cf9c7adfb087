use std::cell::Cell;
use std::cmp::Ordering;
use std::ffi::CString;
use std::fmt;
use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_uint};
use std::ptr::{self, NonNull};
use std::rc::Rc;

use log::{debug, warn};
use lmdb_master_sys as ffi;

use crate::constants::{DbFlags, WriteFlags};
use crate::cursor::Cursor;
use crate::error::{Error, IntoResult, Result};
use crate::registry::{self, Token};
use crate::transaction::{Transaction, TxnCell, TxnInner};
use crate::types::Stat;
use crate::value;

pub(crate) struct DbInner {
    pub(crate) dbi: ffi::MDB_dbi,
    name: Option<String>,
    /// Liveness of the transaction the table was opened under
    pub(crate) txn: Rc<TxnCell>,
    /// Retains the owning `TxnInner`; `None` once closed
    owner: Cell<Option<Token>>,
    dropped: Cell<bool>,
}

impl DbInner {
    /// Native transaction to run an operation on this table with.
    pub(crate) fn check(&self) -> Result<NonNull<ffi::MDB_txn>> {
        if self.owner.get().is_none() {
            return Err(Error::HandleClosed);
        }
        if self.dropped.get() {
            return Err(Error::DatabaseDropped);
        }
        self.txn.live_for_handle()
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.get()
    }

    pub(crate) fn flags(&self, txn: NonNull<ffi::MDB_txn>) -> Result<DbFlags> {
        let mut flags: c_uint = 0;
        unsafe { ffi::mdb_dbi_flags(txn.as_ptr(), self.dbi, &mut flags).into_result()? };
        Ok(DbFlags::from_bits_retain(flags))
    }

    fn close(&self) -> Result<()> {
        match self.owner.take() {
            Some(token) => registry::release(token),
            None => Ok(()),
        }
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        if self.owner.get().is_some() {
            debug!("database handle {} reclaimed without close()", self.dbi);
            if let Err(err) = self.close() {
                warn!("error closing dropped database handle: {}", err);
            }
        }
    }
}

/// Handle to one table, scoped to the transaction that opened it.
///
/// The table identifier itself is environment-wide, but the handle is only
/// usable while its transaction is active; afterwards every operation fails
/// with [`Error::StaleHandle`] without reaching the engine.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Rc<DbInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Database")
            .field("dbi", &self.inner.dbi)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Database {
    pub(crate) fn open(txn: &Transaction, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        let native = txn.inner.cell.live()?;
        let c_name = name
            .map(CString::new)
            .transpose()
            .map_err(|_| Error::InvalidArgument("database name contains a NUL byte"))?;

        let mut dbi: ffi::MDB_dbi = 0;
        unsafe {
            ffi::mdb_dbi_open(
                native.as_ptr(),
                c_name.as_ref().map_or(ptr::null(), |name| name.as_ptr()),
                flags.bits(),
                &mut dbi,
            )
            .into_result()?
        };

        let owner = registry::retain(txn.inner.clone())?;
        debug!("opened database {} ({:?})", dbi, name.unwrap_or("<main>"));
        Ok(Database {
            inner: Rc::new(DbInner {
                dbi,
                name: name.map(str::to_string),
                txn: txn.inner.cell.clone(),
                owner: Cell::new(Some(owner)),
                dropped: Cell::new(false),
            }),
        })
    }

    /// Engine table identifier
    pub fn dbi(&self) -> u32 {
        self.inner.dbi
    }

    /// Table name; `None` for the unnamed table
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Looks up `key`. A missing key is `Ok(None)`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.inner.check()?;
        let mut key = value::val(key);
        let mut data = value::empty();
        match unsafe { ffi::mdb_get(txn.as_ptr(), self.inner.dbi, &mut key, &mut data) }
            .into_result()
        {
            Ok(()) => Ok(Some(unsafe { value::to_vec(&data) })),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Stores `data` under `key`.
    ///
    /// With empty `flags` an existing value is overwritten (or, for a
    /// duplicate-sorted table, another duplicate is added). `RESERVE` is
    /// honoured by copying `data` into the reserved space. `MULTIPLE` is only
    /// accepted by [`Cursor::put_multiple`].
    pub fn put(&self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        if flags.contains(WriteFlags::MULTIPLE) {
            return Err(Error::InvalidArgument(
                "MULTIPLE is only supported by Cursor::put_multiple",
            ));
        }
        let txn = self.inner.check()?;
        if flags.contains(WriteFlags::RESERVE)
            && self.inner.flags(txn)?.contains(DbFlags::DUPSORT)
        {
            return Err(Error::InvalidArgument("RESERVE cannot be used on a DUPSORT table"));
        }

        let mut key = value::val(key);
        let mut reserved = value::val(data);
        unsafe {
            ffi::mdb_put(
                txn.as_ptr(),
                self.inner.dbi,
                &mut key,
                &mut reserved,
                flags.bits(),
            )
            .into_result()?;
            if flags.contains(WriteFlags::RESERVE) {
                value::fill(&reserved, data);
            }
        }
        Ok(())
    }

    /// Removes `key` with all its values. Fails with `NotFound` if absent.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let txn = self.inner.check()?;
        let mut key = value::val(key);
        unsafe {
            ffi::mdb_del(txn.as_ptr(), self.inner.dbi, &mut key, ptr::null_mut()).into_result()
        }
    }

    /// Removes a single duplicate of `key` from a duplicate-sorted table.
    pub fn delete_dup(&self, key: &[u8], data: &[u8]) -> Result<()> {
        let txn = self.inner.check()?;
        let mut key = value::val(key);
        let mut data = value::val(data);
        unsafe { ffi::mdb_del(txn.as_ptr(), self.inner.dbi, &mut key, &mut data).into_result() }
    }

    /// Orders two keys the way this table does.
    pub fn compare_keys(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        let txn = self.inner.check()?;
        let (a, b) = (value::val(a), value::val(b));
        let cmp: c_int = unsafe { ffi::mdb_cmp(txn.as_ptr(), self.inner.dbi, &a, &b) };
        Ok(cmp.cmp(&0))
    }

    /// Orders two duplicate values the way this table does. Only defined
    /// for `DUPSORT` tables.
    pub fn compare_values(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        let txn = self.inner.check()?;
        // The engine has no value comparator for other tables.
        if !self.inner.flags(txn)?.contains(DbFlags::DUPSORT) {
            return Err(Error::Incompatible);
        }
        let (a, b) = (value::val(a), value::val(b));
        let cmp: c_int = unsafe { ffi::mdb_dcmp(txn.as_ptr(), self.inner.dbi, &a, &b) };
        Ok(cmp.cmp(&0))
    }

    pub fn stat(&self) -> Result<Stat> {
        let txn = self.inner.check()?;
        let mut stat = MaybeUninit::<ffi::MDB_stat>::uninit();
        unsafe {
            ffi::mdb_stat(txn.as_ptr(), self.inner.dbi, stat.as_mut_ptr()).into_result()?;
            Ok(Stat::from(stat.assume_init()))
        }
    }

    pub fn flags(&self) -> Result<DbFlags> {
        let txn = self.inner.check()?;
        self.inner.flags(txn)
    }

    /// Empties the table, or with `delete` removes it altogether.
    ///
    /// A deleted named table cannot be used again through this handle. The
    /// unnamed table is only ever emptied.
    pub fn drop_table(&self, delete: bool) -> Result<()> {
        let txn = self.inner.check()?;
        unsafe {
            ffi::mdb_drop(txn.as_ptr(), self.inner.dbi, delete as c_int).into_result()?;
        }
        if delete && self.inner.name.is_some() {
            self.inner.dropped.set(true);
        }
        Ok(())
    }

    /// Releases the handle's hold on its transaction. Closing twice is a
    /// no-op. The engine-level table identifier stays open.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.owner.get().is_none()
    }

    pub fn open_cursor(&self) -> Result<Cursor> {
        Cursor::open(self)
    }

    /// Transaction that opened this handle.
    pub fn transaction(&self) -> Result<Transaction> {
        let token = self.inner.owner.get().ok_or(Error::HandleClosed)?;
        let inner = registry::resolve::<TxnInner>(token)?;
        Ok(Transaction { inner })
    }
}
