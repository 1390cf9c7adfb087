use std::cell::Cell;
use std::fmt;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use log::{debug, warn};
use lmdb_master_sys as ffi;

use crate::constants::{CursorOp, DbFlags, WriteFlags};
use crate::database::{Database, DbInner};
use crate::error::{Error, IntoResult, Result};
use crate::registry::{self, Token};
use crate::transaction::{Transaction, TxnCell};
use crate::value;

/// Key/data pair read through a cursor
pub type Entry = (Vec<u8>, Vec<u8>);

pub(crate) struct CursorInner {
    native: Cell<Option<NonNull<ffi::MDB_cursor>>>,
    /// Retains the owning `DbInner`
    database: Cell<Option<Token>>,
    txn: Rc<TxnCell>,
    /// Transaction generation the native cursor is bound to
    bound: Cell<u64>,
}

impl CursorInner {
    fn database(&self) -> Result<Rc<DbInner>> {
        let token = self.database.get().ok_or(Error::HandleClosed)?;
        registry::resolve::<DbInner>(token)
    }

    fn check(&self) -> Result<NonNull<ffi::MDB_cursor>> {
        let cursor = self.native.get().ok_or(Error::HandleClosed)?;
        if self.database()?.is_dropped() {
            return Err(Error::DatabaseDropped);
        }
        self.txn.live_for_handle()?;
        if self.bound.get() != self.txn.generation() {
            return Err(Error::StaleHandle);
        }
        Ok(cursor)
    }

    fn close(&self) -> Result<()> {
        if let Some(cursor) = self.native.take() {
            // The engine frees write-transaction cursors when the transaction
            // ends. Read-only cursors always belong to the caller.
            if self.txn.is_read_only() || !self.txn.is_ended() {
                unsafe { ffi::mdb_cursor_close(cursor.as_ptr()) };
            }
            debug!("closed cursor {:p}", cursor);
        }
        match self.database.take() {
            Some(token) => registry::release(token),
            None => Ok(()),
        }
    }
}

impl Drop for CursorInner {
    fn drop(&mut self) {
        if self.native.get().is_some() {
            warn!("cursor dropped without close(); closing it");
        }
        if let Err(err) = self.close() {
            warn!("error closing dropped cursor: {}", err);
        }
    }
}

/// Positioned iterator over one table within one transaction.
///
/// Running off either end of the table is not an error: positioning calls
/// return `Ok(None)`.
#[derive(Clone)]
pub struct Cursor {
    inner: Rc<CursorInner>,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("native", &self.inner.native.get())
            .finish()
    }
}

impl Cursor {
    /// Opens a cursor on `db`
    pub fn open(db: &Database) -> Result<Cursor> {
        let txn = db.inner.check()?;
        let mut cursor: *mut ffi::MDB_cursor = ptr::null_mut();
        unsafe { ffi::mdb_cursor_open(txn.as_ptr(), db.inner.dbi, &mut cursor).into_result()? };
        let native = NonNull::new(cursor).ok_or(Error::Problem)?;

        let inner = Rc::new(CursorInner {
            native: Cell::new(Some(native)),
            database: Cell::new(None),
            txn: db.inner.txn.clone(),
            bound: Cell::new(db.inner.txn.generation()),
        });
        // On failure, dropping `inner` closes the native cursor.
        inner.database.set(Some(registry::retain(db.inner.clone())?));
        debug!("opened cursor {:p} on database {}", native, db.dbi());
        Ok(Cursor { inner })
    }

    /// Runs a positioning operation that takes no input.
    ///
    /// Operations that need a key (`Set`, `SetKey`, `SetRange`, `GetBoth`,
    /// `GetBothRange`) go through [`Cursor::get_with`].
    pub fn get(&self, op: CursorOp) -> Result<Option<Entry>> {
        if op.takes_key() {
            return Err(Error::InvalidArgument("operation needs a key; use get_with"));
        }
        self.position(op, value::empty(), value::empty())
    }

    /// Runs a positioning operation with a key and, for `GetBoth` and
    /// `GetBothRange`, a value.
    pub fn get_with(&self, op: CursorOp, key: &[u8], data: Option<&[u8]>) -> Result<Option<Entry>> {
        if op.takes_value() && data.is_none() {
            return Err(Error::InvalidArgument("operation needs a value"));
        }
        self.position(op, value::val(key), data.map_or_else(value::empty, value::val))
    }

    fn position(
        &self,
        op: CursorOp,
        mut key: ffi::MDB_val,
        mut data: ffi::MDB_val,
    ) -> Result<Option<Entry>> {
        let cursor = self.inner.check()?;
        match unsafe { ffi::mdb_cursor_get(cursor.as_ptr(), &mut key, &mut data, op.raw()) }
            .into_result()
        {
            Ok(()) => Ok(Some(unsafe { (value::to_vec(&key), value::to_vec(&data)) })),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn first(&self) -> Result<Option<Entry>> {
        self.get(CursorOp::First)
    }

    pub fn last(&self) -> Result<Option<Entry>> {
        self.get(CursorOp::Last)
    }

    pub fn next(&self) -> Result<Option<Entry>> {
        self.get(CursorOp::Next)
    }

    pub fn prev(&self) -> Result<Option<Entry>> {
        self.get(CursorOp::Prev)
    }

    /// Position at `key` exactly
    pub fn set(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.get_with(CursorOp::SetKey, key, None)
    }

    /// Position at the first key greater than or equal to `key`
    pub fn set_range(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.get_with(CursorOp::SetRange, key, None)
    }

    /// Position at an exact key/data pair
    pub fn get_both(&self, key: &[u8], data: &[u8]) -> Result<Option<Entry>> {
        self.get_with(CursorOp::GetBoth, key, Some(data))
    }

    /// Stores a pair through the cursor and leaves it positioned there.
    ///
    /// `CURRENT` replaces the value at the current position. `MULTIPLE` is
    /// only accepted by [`Cursor::put_multiple`].
    pub fn put(&self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        if flags.contains(WriteFlags::MULTIPLE) {
            return Err(Error::InvalidArgument(
                "MULTIPLE is only supported by Cursor::put_multiple",
            ));
        }
        let cursor = self.inner.check()?;
        if flags.contains(WriteFlags::RESERVE) {
            let db = self.inner.database()?;
            if db.flags(db.check()?)?.contains(DbFlags::DUPSORT) {
                return Err(Error::InvalidArgument("RESERVE cannot be used on a DUPSORT table"));
            }
        }

        let mut key = value::val(key);
        let mut reserved = value::val(data);
        unsafe {
            ffi::mdb_cursor_put(cursor.as_ptr(), &mut key, &mut reserved, flags.bits())
                .into_result()?;
            if flags.contains(WriteFlags::RESERVE) {
                value::fill(&reserved, data);
            }
        }
        Ok(())
    }

    /// Stores a run of fixed-size duplicates under `key` in one call.
    ///
    /// `values` is the concatenation of equally sized elements of
    /// `element_size` bytes; the table must be `DUPFIXED`. Returns how many
    /// elements were written.
    pub fn put_multiple(
        &self,
        key: &[u8],
        values: &[u8],
        element_size: usize,
        flags: WriteFlags,
    ) -> Result<usize> {
        if element_size == 0 || values.is_empty() || values.len() % element_size != 0 {
            return Err(Error::InvalidArgument(
                "values must be a non-empty run of element_size chunks",
            ));
        }
        let cursor = self.inner.check()?;

        let mut key = value::val(key);
        let mut data = [
            ffi::MDB_val {
                mv_size: element_size,
                mv_data: values.as_ptr() as *mut _,
            },
            ffi::MDB_val {
                mv_size: values.len() / element_size,
                mv_data: ptr::null_mut(),
            },
        ];
        unsafe {
            ffi::mdb_cursor_put(
                cursor.as_ptr(),
                &mut key,
                data.as_mut_ptr(),
                (flags | WriteFlags::MULTIPLE).bits(),
            )
            .into_result()?;
        }
        Ok(data[1].mv_size)
    }

    /// Deletes the pair at the current position; `NODUPDATA` deletes all
    /// duplicates of the current key.
    pub fn delete(&self, flags: WriteFlags) -> Result<()> {
        let cursor = self.inner.check()?;
        unsafe { ffi::mdb_cursor_del(cursor.as_ptr(), flags.bits()).into_result() }
    }

    /// Number of duplicates at the current key; 1 on a table without
    /// `DUPSORT`.
    pub fn count(&self) -> Result<usize> {
        let cursor = self.inner.check()?;
        let mut count: ffi::mdb_size_t = 0;
        match unsafe { ffi::mdb_cursor_count(cursor.as_ptr(), &mut count) }.into_result() {
            Ok(()) => Ok(count),
            Err(Error::Incompatible) => match self.get(CursorOp::GetCurrent)? {
                Some(_) => Ok(1),
                None => Err(Error::NotFound),
            },
            Err(err) => Err(err),
        }
    }

    /// Rebinds the cursor to its read-only transaction after that
    /// transaction was reset and renewed.
    pub fn renew(&self) -> Result<()> {
        let cursor = self.inner.native.get().ok_or(Error::HandleClosed)?;
        if !self.inner.txn.is_read_only() {
            return Err(Error::NotReadOnly);
        }
        let txn = self.inner.txn.live_for_handle()?;
        unsafe { ffi::mdb_cursor_renew(txn.as_ptr(), cursor.as_ptr()).into_result()? };
        self.inner.bound.set(self.inner.txn.generation());
        Ok(())
    }

    /// Closes the cursor and releases its database handle. Closing twice is
    /// a no-op.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.native.get().is_none()
    }

    pub fn database(&self) -> Result<Database> {
        Ok(Database {
            inner: self.inner.database()?,
        })
    }

    pub fn transaction(&self) -> Result<Transaction> {
        self.database()?.transaction()
    }

    /// All entries in key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self, CursorOp::First, None, CursorOp::Next)
    }

    /// All entries in reverse key order.
    pub fn iter_rev(&self) -> Iter<'_> {
        Iter::new(self, CursorOp::Last, None, CursorOp::Prev)
    }

    /// Entries from the first key not less than `key` onwards.
    pub fn iter_from(&self, key: &[u8]) -> Iter<'_> {
        Iter::new(self, CursorOp::SetRange, Some(key.to_vec()), CursorOp::Next)
    }

    /// Duplicates stored under `key`.
    pub fn iter_dup_of(&self, key: &[u8]) -> Iter<'_> {
        Iter::new(self, CursorOp::SetKey, Some(key.to_vec()), CursorOp::NextDup)
    }
}

/// Iterator over cursor positions.
///
/// Ends at the first not-found position. An error is yielded once and ends
/// the iteration.
pub struct Iter<'c> {
    cursor: &'c Cursor,
    start: Option<(CursorOp, Option<Vec<u8>>)>,
    step: CursorOp,
    done: bool,
}

impl<'c> Iter<'c> {
    fn new(cursor: &'c Cursor, op: CursorOp, key: Option<Vec<u8>>, step: CursorOp) -> Self {
        Iter {
            cursor,
            start: Some((op, key)),
            step,
            done: false,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = match self.start.take() {
            Some((op, Some(key))) => self.cursor.get_with(op, &key, None),
            Some((op, None)) => self.cursor.get(op),
            None => self.cursor.get(self.step),
        };
        match result {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
