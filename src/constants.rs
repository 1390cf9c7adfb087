use bitflags::bitflags;
use lmdb_master_sys as ffi;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u32 {
        const FIXEDMAP = ffi::MDB_FIXEDMAP;
        const NOSUBDIR = ffi::MDB_NOSUBDIR;
        const NOSYNC = ffi::MDB_NOSYNC;
        const RDONLY = ffi::MDB_RDONLY;
        const NOMETASYNC = ffi::MDB_NOMETASYNC;
        const WRITEMAP = ffi::MDB_WRITEMAP;
        const MAPASYNC = ffi::MDB_MAPASYNC;
        const NOTLS = ffi::MDB_NOTLS;
        const NOLOCK = ffi::MDB_NOLOCK;
        const NORDAHEAD = ffi::MDB_NORDAHEAD;
        const NOMEMINIT = ffi::MDB_NOMEMINIT;
        const PREVSNAPSHOT = ffi::MDB_PREVSNAPSHOT;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = ffi::MDB_REVERSEKEY;
        const DUPSORT = ffi::MDB_DUPSORT;
        const INTEGERKEY = ffi::MDB_INTEGERKEY;
        const DUPFIXED = ffi::MDB_DUPFIXED;
        const INTEGERDUP = ffi::MDB_INTEGERDUP;
        const REVERSEDUP = ffi::MDB_REVERSEDUP;
        const CREATE = ffi::MDB_CREATE;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = ffi::MDB_NOOVERWRITE;
        const NODUPDATA = ffi::MDB_NODUPDATA;
        const CURRENT = ffi::MDB_CURRENT;
        const RESERVE = ffi::MDB_RESERVE;
        const APPEND = ffi::MDB_APPEND;
        const APPENDDUP = ffi::MDB_APPENDDUP;
        const MULTIPLE = ffi::MDB_MULTIPLE;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxnFlags: u32 {
        // Reuse environment flags
        const RDONLY = EnvFlags::RDONLY.bits();
        const NOSYNC = EnvFlags::NOSYNC.bits();
        const NOMETASYNC = EnvFlags::NOMETASYNC.bits();
    }
}

/// Cursor positioning operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorOp {
    First,
    FirstDup,
    GetBoth,
    GetBothRange,
    GetCurrent,
    GetMultiple,
    Last,
    LastDup,
    Next,
    NextDup,
    NextMultiple,
    NextNoDup,
    Prev,
    PrevDup,
    PrevNoDup,
    Set,
    SetKey,
    SetRange,
    PrevMultiple,
}

impl CursorOp {
    /// Maps an engine opcode back to an operation.
    pub fn from_raw(op: u32) -> Option<CursorOp> {
        let op = match op {
            ffi::MDB_FIRST => CursorOp::First,
            ffi::MDB_FIRST_DUP => CursorOp::FirstDup,
            ffi::MDB_GET_BOTH => CursorOp::GetBoth,
            ffi::MDB_GET_BOTH_RANGE => CursorOp::GetBothRange,
            ffi::MDB_GET_CURRENT => CursorOp::GetCurrent,
            ffi::MDB_GET_MULTIPLE => CursorOp::GetMultiple,
            ffi::MDB_LAST => CursorOp::Last,
            ffi::MDB_LAST_DUP => CursorOp::LastDup,
            ffi::MDB_NEXT => CursorOp::Next,
            ffi::MDB_NEXT_DUP => CursorOp::NextDup,
            ffi::MDB_NEXT_MULTIPLE => CursorOp::NextMultiple,
            ffi::MDB_NEXT_NODUP => CursorOp::NextNoDup,
            ffi::MDB_PREV => CursorOp::Prev,
            ffi::MDB_PREV_DUP => CursorOp::PrevDup,
            ffi::MDB_PREV_NODUP => CursorOp::PrevNoDup,
            ffi::MDB_SET => CursorOp::Set,
            ffi::MDB_SET_KEY => CursorOp::SetKey,
            ffi::MDB_SET_RANGE => CursorOp::SetRange,
            ffi::MDB_PREV_MULTIPLE => CursorOp::PrevMultiple,
            _ => return None,
        };
        Some(op)
    }

    pub fn raw(self) -> ffi::MDB_cursor_op {
        match self {
            CursorOp::First => ffi::MDB_FIRST,
            CursorOp::FirstDup => ffi::MDB_FIRST_DUP,
            CursorOp::GetBoth => ffi::MDB_GET_BOTH,
            CursorOp::GetBothRange => ffi::MDB_GET_BOTH_RANGE,
            CursorOp::GetCurrent => ffi::MDB_GET_CURRENT,
            CursorOp::GetMultiple => ffi::MDB_GET_MULTIPLE,
            CursorOp::Last => ffi::MDB_LAST,
            CursorOp::LastDup => ffi::MDB_LAST_DUP,
            CursorOp::Next => ffi::MDB_NEXT,
            CursorOp::NextDup => ffi::MDB_NEXT_DUP,
            CursorOp::NextMultiple => ffi::MDB_NEXT_MULTIPLE,
            CursorOp::NextNoDup => ffi::MDB_NEXT_NODUP,
            CursorOp::Prev => ffi::MDB_PREV,
            CursorOp::PrevDup => ffi::MDB_PREV_DUP,
            CursorOp::PrevNoDup => ffi::MDB_PREV_NODUP,
            CursorOp::Set => ffi::MDB_SET,
            CursorOp::SetKey => ffi::MDB_SET_KEY,
            CursorOp::SetRange => ffi::MDB_SET_RANGE,
            CursorOp::PrevMultiple => ffi::MDB_PREV_MULTIPLE,
        }
    }

    /// Operations that read the key argument.
    pub(crate) fn takes_key(self) -> bool {
        matches!(
            self,
            CursorOp::Set
                | CursorOp::SetKey
                | CursorOp::SetRange
                | CursorOp::GetBoth
                | CursorOp::GetBothRange
        )
    }

    /// Operations that read the value argument.
    pub(crate) fn takes_value(self) -> bool {
        matches!(self, CursorOp::GetBoth | CursorOp::GetBothRange)
    }
}

/// Default UNIX permissions for created files
pub const DEFAULT_MODE: u32 = 0o664;
/// Default memory map size, 4 MiB
pub const DEFAULT_MAP_SIZE: usize = 4 * 1024 * 1024;
/// Default number of reader slots
pub const DEFAULT_MAX_READERS: u32 = 1;
/// Default number of named databases; zero leaves only the unnamed one
pub const DEFAULT_MAX_DBS: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_ops_map_both_ways() {
        for raw in 0..=ffi::MDB_PREV_MULTIPLE {
            let op = CursorOp::from_raw(raw).expect("every engine opcode has a variant");
            assert_eq!(op.raw(), raw);
        }
        assert_eq!(CursorOp::from_raw(ffi::MDB_PREV_MULTIPLE + 1), None);
    }

    #[test]
    fn txn_flags_share_env_bits() {
        assert_eq!(TxnFlags::RDONLY.bits(), EnvFlags::RDONLY.bits());
        assert_eq!(EnvFlags::NOSUBDIR.bits(), 0x4000);
        assert_eq!(DbFlags::CREATE.bits(), 0x40000);
        assert_eq!(WriteFlags::NOOVERWRITE.bits(), 0x10);
    }
}
