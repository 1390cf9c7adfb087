use std::any::Any;
use std::cell::{Cell, RefCell};
use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::mem::{self, MaybeUninit};
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::os::unix::ffi::OsStrExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::rc::{Rc, Weak};

use log::{debug, warn};
use lmdb_master_sys as ffi;

use crate::constants::{
    EnvFlags, TxnFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS, DEFAULT_MODE,
};
use crate::error::{Error, IntoResult, Result};
use crate::registry::{self, Token};
use crate::transaction::{Transaction, TxnCell};
use crate::types::{EnvInfo, Property, PropertyValue, Setting, Stat};

/// Options applied when an environment is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub flags: EnvFlags,
    /// UNIX permission bits for the data and lock files
    pub mode: u32,
    pub map_size: usize,
    pub max_readers: u32,
    /// Number of named tables; zero leaves only the unnamed one
    pub max_dbs: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            flags: EnvFlags::empty(),
            mode: DEFAULT_MODE,
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
        }
    }
}

impl EnvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    pub fn max_readers(mut self, max_readers: u32) -> Self {
        self.max_readers = max_readers;
        self
    }

    pub fn max_dbs(mut self, max_dbs: u32) -> Self {
        self.max_dbs = max_dbs;
        self
    }

    /// Opens an environment at `path` with these options.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Environment> {
        Environment::open(path, self)
    }
}

/// Liveness state of one native environment, shared with every transaction
/// begun on it.
pub(crate) struct EnvCell {
    native: Cell<Option<NonNull<ffi::MDB_env>>>,
    /// Transactions begun on this environment, oldest first
    txns: RefCell<Vec<Weak<TxnCell>>>,
}

impl EnvCell {
    pub(crate) fn native(&self) -> Result<NonNull<ffi::MDB_env>> {
        self.native.get().ok_or(Error::EnvClosed)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.native.get().is_some()
    }

    pub(crate) fn track(&self, txn: &Rc<TxnCell>) {
        let mut txns = self.txns.borrow_mut();
        txns.retain(|txn| txn.upgrade().map_or(false, |txn| !txn.is_ended()));
        txns.push(Rc::downgrade(txn));
    }

    fn live_txns(&self) -> Vec<Rc<TxnCell>> {
        self.txns
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|txn| !txn.is_ended())
            .collect()
    }
}

pub(crate) struct EnvInner {
    pub(crate) cell: Rc<EnvCell>,
}

impl EnvInner {
    fn close(&self) -> Result<()> {
        let env = match self.cell.native.get() {
            Some(env) => env,
            None => return Ok(()),
        };

        let mut result = Ok(());
        let live = self.cell.live_txns();
        if !live.is_empty() {
            warn!(
                "closing environment with {} live transaction(s); aborting them",
                live.len()
            );
            // Newest first, so children are gone before their parents.
            for txn in live.iter().rev() {
                result = result.and(txn.abort_for_close());
            }
        }
        self.cell.txns.borrow_mut().clear();

        let ctx = unsafe { ffi::mdb_env_get_userctx(env.as_ptr()) };
        if let Some(token) = Token::from_raw(ctx as usize as u64) {
            unsafe { ffi::mdb_env_set_userctx(env.as_ptr(), ptr::null_mut()) };
            result = result.and(registry::release(token));
        }

        unsafe { ffi::mdb_env_close(env.as_ptr()) };
        self.cell.native.set(None);
        debug!("closed environment {:p}", env);
        result
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        if self.cell.is_open() {
            warn!("environment dropped without close(); closing it");
            if let Err(err) = self.close() {
                warn!("error while closing dropped environment: {}", err);
            }
        }
    }
}

/// Closes a native environment whose open did not complete.
struct PartialEnv(NonNull<ffi::MDB_env>);

impl Drop for PartialEnv {
    fn drop(&mut self) {
        unsafe { ffi::mdb_env_close(self.0.as_ptr()) };
    }
}

/// Handle to one open environment.
///
/// Clones share the same native environment. The environment stays open
/// until [`Environment::close`] is called; a transaction keeps the handle
/// itself alive while it runs.
#[derive(Clone)]
pub struct Environment {
    pub(crate) inner: Rc<EnvInner>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Environment")
            .field("native", &self.inner.cell.native.get())
            .finish()
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument("path contains a NUL byte"))
}

impl Environment {
    /// Creates the native environment, applies `config`, and opens `path`.
    ///
    /// Unless `EnvFlags::NOSUBDIR` is given, `path` must be an existing
    /// directory.
    pub fn open<P: AsRef<Path>>(path: P, config: &EnvConfig) -> Result<Environment> {
        let path = path.as_ref();
        let c_path = path_to_cstring(path)?;

        let mut env: *mut ffi::MDB_env = ptr::null_mut();
        unsafe { ffi::mdb_env_create(&mut env).into_result()? };
        let guard = PartialEnv(NonNull::new(env).ok_or(Error::Os(libc::ENOMEM))?);

        unsafe {
            ffi::mdb_env_set_maxreaders(env, config.max_readers).into_result()?;
            ffi::mdb_env_set_mapsize(env, config.map_size).into_result()?;
            if config.max_dbs > 0 {
                ffi::mdb_env_set_maxdbs(env, config.max_dbs).into_result()?;
            }
            ffi::mdb_env_open(
                env,
                c_path.as_ptr(),
                config.flags.bits(),
                config.mode as ffi::mdb_mode_t,
            )
            .into_result()?;
        }

        let native = guard.0;
        mem::forget(guard);
        debug!("opened environment {:p} at {}", native, path.display());

        Ok(Environment {
            inner: Rc::new(EnvInner {
                cell: Rc::new(EnvCell {
                    native: Cell::new(Some(native)),
                    txns: RefCell::new(Vec::new()),
                }),
            }),
        })
    }

    /// Closes the environment. Closing twice is a no-op.
    ///
    /// Transactions still running are aborted first and every handle derived
    /// from them becomes stale. The user context reference, if any, is
    /// released.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.cell.is_open()
    }

    fn native(&self) -> Result<*mut ffi::MDB_env> {
        self.inner.cell.native().map(NonNull::as_ptr)
    }

    /// Begins a top-level transaction.
    pub fn begin(&self, flags: TxnFlags) -> Result<Transaction> {
        Transaction::begin(self, None, flags)
    }

    /// Begins a read-only transaction.
    pub fn begin_ro(&self) -> Result<Transaction> {
        self.begin(TxnFlags::RDONLY)
    }

    /// Begins a transaction nested under `parent`.
    pub fn begin_nested(&self, parent: &Transaction, flags: TxnFlags) -> Result<Transaction> {
        Transaction::begin(self, Some(parent), flags)
    }

    /// Copies the environment to the existing directory `path`.
    pub fn copy<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let c_path = path_to_cstring(path.as_ref())?;
        unsafe { ffi::mdb_env_copy(self.native()?, c_path.as_ptr()).into_result() }
    }

    /// Copies the environment, omitting free pages.
    pub fn copy_compact<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let c_path = path_to_cstring(path.as_ref())?;
        unsafe {
            ffi::mdb_env_copy2(self.native()?, c_path.as_ptr(), ffi::MDB_CP_COMPACT).into_result()
        }
    }

    /// Flushes buffers to disk. `force` syncs even under `NOSYNC`/`MAPASYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        unsafe { ffi::mdb_env_sync(self.native()?, force as c_int).into_result() }
    }

    pub fn stat(&self) -> Result<Stat> {
        let mut stat = MaybeUninit::<ffi::MDB_stat>::uninit();
        unsafe {
            ffi::mdb_env_stat(self.native()?, stat.as_mut_ptr()).into_result()?;
            Ok(Stat::from(stat.assume_init()))
        }
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let mut info = MaybeUninit::<ffi::MDB_envinfo>::uninit();
        unsafe {
            ffi::mdb_env_info(self.native()?, info.as_mut_ptr()).into_result()?;
            Ok(EnvInfo::from(info.assume_init()))
        }
    }

    /// Reads a property by name-independent key.
    pub fn get_property(&self, property: Property) -> Result<PropertyValue> {
        let value = match property {
            Property::Flags => PropertyValue::Flags(self.flags()?),
            Property::Path => PropertyValue::Path(self.path()?),
            Property::FileDescriptor => PropertyValue::FileDescriptor(self.fd()?),
            Property::MapSize => PropertyValue::MapSize(self.map_size()?),
            Property::MaxReaders => PropertyValue::MaxReaders(self.max_readers()?),
            Property::MaxKeySize => PropertyValue::MaxKeySize(self.max_key_size()?),
            Property::UserContext => PropertyValue::UserContext(self.user_context()?),
        };
        Ok(value)
    }

    pub fn set_property(&self, setting: Setting) -> Result<()> {
        match setting {
            Setting::Flags(flags, on) => self.set_flags(flags, on),
            Setting::MapSize(size) => self.set_map_size(size),
            Setting::MaxReaders(readers) => self.set_max_readers(readers),
            Setting::MaxDbs(dbs) => self.set_max_dbs(dbs),
            Setting::UserContext(value) => self.set_user_context_any(value),
        }
    }

    pub fn flags(&self) -> Result<EnvFlags> {
        let mut flags: c_uint = 0;
        unsafe { ffi::mdb_env_get_flags(self.native()?, &mut flags).into_result()? };
        Ok(EnvFlags::from_bits_retain(flags))
    }

    /// Switches runtime-changeable flags on or off.
    pub fn set_flags(&self, flags: EnvFlags, on: bool) -> Result<()> {
        unsafe { ffi::mdb_env_set_flags(self.native()?, flags.bits(), on as c_int).into_result() }
    }

    pub fn path(&self) -> Result<PathBuf> {
        let mut path: *const c_char = ptr::null();
        unsafe {
            ffi::mdb_env_get_path(self.native()?, &mut path).into_result()?;
            if path.is_null() {
                return Ok(PathBuf::new());
            }
            let bytes = CStr::from_ptr(path).to_bytes();
            Ok(PathBuf::from(OsStr::from_bytes(bytes)))
        }
    }

    /// File descriptor of the data file.
    pub fn fd(&self) -> Result<i64> {
        let mut fd: ffi::mdb_filehandle_t = 0;
        unsafe { ffi::mdb_env_get_fd(self.native()?, &mut fd).into_result()? };
        Ok(i64::from(fd))
    }

    pub fn map_size(&self) -> Result<usize> {
        Ok(self.info()?.map_size)
    }

    /// Resizes the memory map. Must not be called while a write transaction
    /// of this process is running.
    pub fn set_map_size(&self, size: usize) -> Result<()> {
        unsafe { ffi::mdb_env_set_mapsize(self.native()?, size).into_result() }
    }

    pub fn max_readers(&self) -> Result<u32> {
        let mut readers: c_uint = 0;
        unsafe { ffi::mdb_env_get_maxreaders(self.native()?, &mut readers).into_result()? };
        Ok(readers)
    }

    /// Only valid before open; the engine rejects it afterwards.
    pub fn set_max_readers(&self, readers: u32) -> Result<()> {
        unsafe { ffi::mdb_env_set_maxreaders(self.native()?, readers).into_result() }
    }

    /// Only valid before open; the engine rejects it afterwards.
    pub fn set_max_dbs(&self, dbs: u32) -> Result<()> {
        unsafe { ffi::mdb_env_set_maxdbs(self.native()?, dbs).into_result() }
    }

    pub fn max_key_size(&self) -> Result<u32> {
        let size = unsafe { ffi::mdb_env_get_maxkeysize(self.native()?) };
        Ok(size.max(0) as u32)
    }

    fn user_context_token(&self) -> Result<Option<Token>> {
        let ctx = unsafe { ffi::mdb_env_get_userctx(self.native()?) };
        Ok(Token::from_raw(ctx as usize as u64))
    }

    /// Value stored with [`Environment::set_user_context`], if any.
    pub fn user_context(&self) -> Result<Option<Rc<dyn Any>>> {
        match self.user_context_token()? {
            Some(token) => registry::resolve_any(token).map(Some),
            None => Ok(None),
        }
    }

    /// Attaches an arbitrary value to the environment, replacing the
    /// previous one. The value is kept alive until it is replaced or the
    /// environment is closed.
    pub fn set_user_context<T: Any>(&self, value: Rc<T>) -> Result<()> {
        self.set_user_context_any(value)
    }

    fn set_user_context_any(&self, value: Rc<dyn Any>) -> Result<()> {
        let env = self.native()?;
        let previous = self.user_context_token()?;
        let token = registry::retain_any(value)?;
        let ctx = token.into_raw() as usize as *mut c_void;
        if let Err(err) = unsafe { ffi::mdb_env_set_userctx(env, ctx).into_result() } {
            registry::release(token)?;
            return Err(err);
        }
        match previous {
            Some(previous) => registry::release(previous),
            None => Ok(()),
        }
    }

    /// Feeds each line of the reader table dump to `callback`.
    ///
    /// The scan stops at the first callback error, or panic, and that error
    /// is returned.
    pub fn reader_list<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&str) -> Result<()> + 'static,
    {
        let env = self.native()?;
        let scan = Rc::new(ReaderScan {
            callback: RefCell::new(Box::new(callback)),
            failure: RefCell::new(None),
        });
        let token = registry::retain(scan.clone())?;

        let rc = unsafe {
            ffi::mdb_reader_list(
                env,
                Some(reader_line),
                token.into_raw() as usize as *mut c_void,
            )
        };
        registry::release(token)?;

        if let Some(err) = scan.failure.borrow_mut().take() {
            return Err(err);
        }
        if rc < 0 {
            return Err(Error::Callback(format!("reader scan stopped with {}", rc)));
        }
        rc.into_result()
    }

    /// Reader table dump as a sequence of lines.
    pub fn readers(&self) -> Result<ReaderLines> {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = lines.clone();
        self.reader_list(move |line| {
            sink.borrow_mut().push(line.to_string());
            Ok(())
        })?;
        let lines = mem::take(&mut *lines.borrow_mut());
        Ok(ReaderLines {
            lines: lines.into_iter(),
        })
    }

    /// Clears reader slots left by dead processes and returns how many.
    pub fn reader_check(&self) -> Result<usize> {
        let mut dead: c_int = 0;
        unsafe { ffi::mdb_reader_check(self.native()?, &mut dead).into_result()? };
        Ok(dead.max(0) as usize)
    }
}

struct ReaderScan {
    callback: RefCell<Box<dyn FnMut(&str) -> Result<()>>>,
    failure: RefCell<Option<Error>>,
}

impl ReaderScan {
    fn feed(&self, line: &str) -> Result<()> {
        let mut callback = self
            .callback
            .try_borrow_mut()
            .map_err(|_| Error::Callback("reader callback re-entered".to_string()))?;
        let callback = &mut **callback;
        match panic::catch_unwind(AssertUnwindSafe(|| callback(line))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "callback panicked".to_string());
                Err(Error::Callback(message))
            }
        }
    }
}

unsafe extern "C" fn reader_line(msg: *const c_char, ctx: *mut c_void) -> c_int {
    let scan = match Token::from_raw(ctx as usize as u64).map(registry::resolve::<ReaderScan>) {
        Some(Ok(scan)) => scan,
        _ => return -1,
    };
    let line = if msg.is_null() {
        String::new()
    } else {
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    };
    match scan.feed(line.trim_end_matches('\n')) {
        Ok(()) => 0,
        Err(err) => {
            *scan.failure.borrow_mut() = Some(err);
            -1
        }
    }
}

/// Lines of a reader table dump, in engine order.
#[derive(Debug)]
pub struct ReaderLines {
    lines: std::vec::IntoIter<String>,
}

impl Iterator for ReaderLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.lines.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.lines.size_hint()
    }
}

impl ExactSizeIterator for ReaderLines {}
