use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::rc::{Rc, Weak};

use log::{debug, warn};
use lmdb_master_sys as ffi;

use crate::constants::{DbFlags, TxnFlags};
use crate::database::Database;
use crate::env::{EnvCell, EnvInner, Environment};
use crate::error::{Error, IntoResult, Result};
use crate::registry::{self, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active(NonNull<ffi::MDB_txn>),
    /// Read-only transaction parked by `reset`; the native handle is kept
    /// for `renew`
    Reset(NonNull<ffi::MDB_txn>),
    Committed,
    Aborted,
}

/// Observable state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Reset,
    Committed,
    Aborted,
}

/// Liveness of one native transaction.
///
/// Database handles and cursors share this cell with the transaction that
/// opened them, so a commit or abort is seen by all of them without any
/// notification. The cell also owns the transaction's references to its
/// environment and parent, so whichever path ends the transaction releases
/// them.
pub(crate) struct TxnCell {
    state: Cell<TxnState>,
    read_only: bool,
    env: Rc<EnvCell>,
    parent: Option<Rc<TxnCell>>,
    /// Bumped on every reset of a read-only transaction
    generation: Cell<u64>,
    /// Retains the `EnvInner` this transaction was begun on
    env_ref: Cell<Option<Token>>,
    /// Retains the parent's `TxnInner`, for nested transactions
    parent_ref: Cell<Option<Token>>,
    /// Nested transactions begun under this one
    children: RefCell<Vec<Weak<TxnCell>>>,
}

impl TxnCell {
    /// Own state, overridden by an ended ancestor or a closed environment.
    fn effective(&self) -> TxnState {
        let own = self.state.get();
        if matches!(own, TxnState::Committed | TxnState::Aborted) {
            return own;
        }
        if let Some(parent) = &self.parent {
            let parent = parent.effective();
            if matches!(parent, TxnState::Committed | TxnState::Aborted) {
                return parent;
            }
        }
        if !self.env.is_open() {
            return TxnState::Aborted;
        }
        own
    }

    pub(crate) fn is_ended(&self) -> bool {
        matches!(
            self.effective(),
            TxnState::Committed | TxnState::Aborted
        )
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.get()
    }

    /// Native handle of an active transaction.
    pub(crate) fn live(&self) -> Result<NonNull<ffi::MDB_txn>> {
        match self.effective() {
            TxnState::Active(txn) => Ok(txn),
            TxnState::Reset(_) => Err(Error::TxnReset),
            TxnState::Committed | TxnState::Aborted => Err(Error::TxnEnded),
        }
    }

    /// Same as [`TxnCell::live`], as seen from a handle opened under this
    /// transaction.
    pub(crate) fn live_for_handle(&self) -> Result<NonNull<ffi::MDB_txn>> {
        self.live().map_err(|err| match err {
            Error::TxnEnded => Error::StaleHandle,
            err => err,
        })
    }

    /// Native handle the engine has not freed yet.
    fn unfinished(&self) -> Option<NonNull<ffi::MDB_txn>> {
        match self.effective() {
            TxnState::Active(txn) | TxnState::Reset(txn) => Some(txn),
            TxnState::Committed | TxnState::Aborted => None,
        }
    }

    fn adopt(&self, child: &Rc<TxnCell>) {
        let mut children = self.children.borrow_mut();
        children.retain(|child| child.upgrade().map_or(false, |child| !child.is_ended()));
        children.push(Rc::downgrade(child));
    }

    /// Moves to `state` unless already ended, then drops the ancestor
    /// references. Nested transactions end first, with the same outcome,
    /// since the engine ends them together with their parent.
    fn finish(&self, state: TxnState) -> Result<()> {
        let children: Vec<Rc<TxnCell>> = mem::take(&mut *self.children.borrow_mut())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        let mut result = Ok(());
        for child in children {
            result = result.and(child.finish(state));
        }

        if !matches!(self.state.get(), TxnState::Committed | TxnState::Aborted) {
            self.state.set(state);
        }
        result.and(self.release_refs())
    }

    fn release_refs(&self) -> Result<()> {
        let env = self.env_ref.take().map(registry::release).unwrap_or(Ok(()));
        let parent = self.parent_ref.take().map(registry::release).unwrap_or(Ok(()));
        env.and(parent)
    }

    /// Aborts the native transaction ahead of an environment close.
    pub(crate) fn abort_for_close(&self) -> Result<()> {
        if let Some(txn) = self.unfinished() {
            unsafe { ffi::mdb_txn_abort(txn.as_ptr()) };
        }
        self.finish(TxnState::Aborted)
    }
}

pub(crate) struct TxnInner {
    pub(crate) cell: Rc<TxnCell>,
}

impl Drop for TxnInner {
    fn drop(&mut self) {
        if let Some(txn) = self.cell.unfinished() {
            if self.cell.state.get() == TxnState::Active(txn) {
                warn!("transaction dropped while active; aborting it");
            } else {
                debug!("freeing reset transaction on drop");
            }
            unsafe { ffi::mdb_txn_abort(txn.as_ptr()) };
        }
        if let Err(err) = self.cell.finish(TxnState::Aborted) {
            warn!("error releasing transaction references: {}", err);
        }
    }
}

/// Handle to one engine transaction.
///
/// Clones refer to the same transaction. Once it commits or aborts, every
/// operation on it fails with [`Error::TxnEnded`], and every database or
/// cursor opened under it fails with [`Error::StaleHandle`]. A transaction
/// that is dropped while still running is aborted.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) inner: Rc<TxnInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("status", &self.status())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn begin(
        env: &Environment,
        parent: Option<&Transaction>,
        flags: TxnFlags,
    ) -> Result<Transaction> {
        let env_native = env.inner.cell.native()?;
        let parent_native = match parent {
            Some(parent) => {
                if !Rc::ptr_eq(&parent.inner.cell.env, &env.inner.cell) {
                    return Err(Error::InvalidArgument(
                        "parent transaction belongs to another environment",
                    ));
                }
                parent.inner.cell.live()?.as_ptr()
            }
            None => ptr::null_mut(),
        };

        let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
        unsafe {
            ffi::mdb_txn_begin(env_native.as_ptr(), parent_native, flags.bits(), &mut txn)
                .into_result()?
        };
        let native = NonNull::new(txn).ok_or(Error::Problem)?;

        let inner = Rc::new(TxnInner {
            cell: Rc::new(TxnCell {
                state: Cell::new(TxnState::Active(native)),
                read_only: flags.contains(TxnFlags::RDONLY),
                env: env.inner.cell.clone(),
                parent: parent.map(|parent| parent.inner.cell.clone()),
                generation: Cell::new(0),
                env_ref: Cell::new(None),
                parent_ref: Cell::new(None),
                children: RefCell::new(Vec::new()),
            }),
        });
        env.inner.cell.track(&inner.cell);

        // On failure below, dropping `inner` aborts the native transaction.
        let cell = &inner.cell;
        cell.env_ref.set(Some(registry::retain(env.inner.clone())?));
        if let Some(parent) = parent {
            cell.parent_ref.set(Some(registry::retain(parent.inner.clone())?));
            parent.inner.cell.adopt(cell);
        }

        let txn = Transaction { inner };
        debug!(
            "began {} transaction {}",
            if txn.is_read_only() { "read-only" } else { "write" },
            unsafe { ffi::mdb_txn_id(native.as_ptr()) }
        );
        Ok(txn)
    }

    /// Begins a transaction nested inside this one.
    ///
    /// The parent may not be used until the child commits or aborts.
    pub fn begin_child(&self, flags: TxnFlags) -> Result<Transaction> {
        let env = self.environment()?;
        Transaction::begin(&env, Some(self), flags)
    }

    fn unfinished(&self) -> Result<NonNull<ffi::MDB_txn>> {
        self.inner.cell.unfinished().ok_or(Error::TxnEnded)
    }

    /// Engine transaction id
    pub fn id(&self) -> Result<u64> {
        let txn = self.unfinished()?;
        Ok(unsafe { ffi::mdb_txn_id(txn.as_ptr()) } as u64)
    }

    /// Commits the transaction.
    ///
    /// The transaction ends whether or not the commit succeeds; on failure
    /// it is reported as aborted.
    pub fn commit(&self) -> Result<()> {
        let txn = self.unfinished()?;
        let id = unsafe { ffi::mdb_txn_id(txn.as_ptr()) };
        let result = unsafe { ffi::mdb_txn_commit(txn.as_ptr()) }.into_result();
        let state = if result.is_ok() {
            TxnState::Committed
        } else {
            TxnState::Aborted
        };
        self.inner.cell.finish(state)?;
        match &result {
            Ok(()) => debug!("committed transaction {}", id),
            Err(err) => debug!("commit of transaction {} failed: {}", id, err),
        }
        result
    }

    pub fn abort(&self) -> Result<()> {
        let txn = self.unfinished()?;
        let id = unsafe { ffi::mdb_txn_id(txn.as_ptr()) };
        unsafe { ffi::mdb_txn_abort(txn.as_ptr()) };
        self.inner.cell.finish(TxnState::Aborted)?;
        debug!("aborted transaction {}", id);
        Ok(())
    }

    /// Releases the snapshot of a read-only transaction while keeping the
    /// handle for [`Transaction::renew`]. Resetting twice is a no-op.
    pub fn reset(&self) -> Result<()> {
        if !self.inner.cell.read_only {
            return Err(Error::NotReadOnly);
        }
        match self.inner.cell.effective() {
            TxnState::Active(txn) => {
                unsafe { ffi::mdb_txn_reset(txn.as_ptr()) };
                self.inner.cell.state.set(TxnState::Reset(txn));
                let generation = &self.inner.cell.generation;
                generation.set(generation.get() + 1);
                Ok(())
            }
            TxnState::Reset(_) => Ok(()),
            TxnState::Committed | TxnState::Aborted => Err(Error::TxnEnded),
        }
    }

    /// Takes a fresh snapshot for a reset read-only transaction.
    pub fn renew(&self) -> Result<()> {
        if !self.inner.cell.read_only {
            return Err(Error::NotReadOnly);
        }
        match self.inner.cell.effective() {
            TxnState::Active(txn) | TxnState::Reset(txn) => {
                unsafe { ffi::mdb_txn_renew(txn.as_ptr()).into_result()? };
                self.inner.cell.state.set(TxnState::Active(txn));
                Ok(())
            }
            TxnState::Committed | TxnState::Aborted => Err(Error::TxnEnded),
        }
    }

    /// Opens the unnamed table (`None`) or a named one.
    pub fn open_database(&self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        Database::open(self, name, flags)
    }

    pub fn status(&self) -> TxnStatus {
        match self.inner.cell.effective() {
            TxnState::Active(_) => TxnStatus::Active,
            TxnState::Reset(_) => TxnStatus::Reset,
            TxnState::Committed => TxnStatus::Committed,
            TxnState::Aborted => TxnStatus::Aborted,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.cell.read_only
    }

    /// Environment the transaction was begun on. Fails once it has ended.
    pub fn environment(&self) -> Result<Environment> {
        let token = self.inner.cell.env_ref.get().ok_or(Error::TxnEnded)?;
        let inner = registry::resolve::<EnvInner>(token)?;
        Ok(Environment { inner })
    }

    /// Parent of a nested transaction.
    pub fn parent(&self) -> Result<Option<Transaction>> {
        if self.inner.cell.env_ref.get().is_none() {
            return Err(Error::TxnEnded);
        }
        match self.inner.cell.parent_ref.get() {
            Some(token) => {
                let inner = registry::resolve::<TxnInner>(token)?;
                Ok(Some(Transaction { inner }))
            }
            None => Ok(None),
        }
    }
}
