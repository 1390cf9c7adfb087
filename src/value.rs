use std::os::raw::c_void;
use std::ptr;
use std::slice;

use lmdb_master_sys as ffi;

/// Borrowed byte span handed to the engine.
///
/// The engine never writes through input spans; the `*mut` in `MDB_val` is
/// an artefact of the C signature.
pub(crate) fn val(data: &[u8]) -> ffi::MDB_val {
    ffi::MDB_val {
        mv_size: data.len(),
        mv_data: data.as_ptr() as *mut c_void,
    }
}

/// Empty span for output parameters
pub(crate) fn empty() -> ffi::MDB_val {
    ffi::MDB_val {
        mv_size: 0,
        mv_data: ptr::null_mut(),
    }
}

/// Copies a span returned by the engine into owned memory.
///
/// # Safety
///
/// `val` must describe memory that is readable for `mv_size` bytes, or have
/// a null `mv_data`.
pub(crate) unsafe fn to_vec(val: &ffi::MDB_val) -> Vec<u8> {
    if val.mv_data.is_null() || val.mv_size == 0 {
        return Vec::new();
    }
    slice::from_raw_parts(val.mv_data as *const u8, val.mv_size).to_vec()
}

/// Writes `data` into space handed out by a `RESERVE` put.
///
/// # Safety
///
/// `reserved` must point to at least `data.len()` writable bytes.
pub(crate) unsafe fn fill(reserved: &ffi::MDB_val, data: &[u8]) {
    if !reserved.mv_data.is_null() {
        ptr::copy_nonoverlapping(data.as_ptr(), reserved.mv_data as *mut u8, data.len());
    }
}
