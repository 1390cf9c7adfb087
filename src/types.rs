use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;

use lmdb_master_sys as ffi;

use crate::constants::EnvFlags;
use crate::error::Error;

/// B-tree statistics of an environment or a single table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub psize: u32,
    pub depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    pub entries: usize,
}

impl From<ffi::MDB_stat> for Stat {
    fn from(stat: ffi::MDB_stat) -> Stat {
        Stat {
            psize: stat.ms_psize,
            depth: stat.ms_depth,
            branch_pages: stat.ms_branch_pages,
            leaf_pages: stat.ms_leaf_pages,
            overflow_pages: stat.ms_overflow_pages,
            entries: stat.ms_entries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    pub map_size: usize,
    pub last_pgno: usize,
    pub last_txnid: usize,
    pub max_readers: u32,
    pub num_readers: u32,
}

impl From<ffi::MDB_envinfo> for EnvInfo {
    fn from(info: ffi::MDB_envinfo) -> EnvInfo {
        EnvInfo {
            map_size: info.me_mapsize,
            last_pgno: info.me_last_pgno,
            last_txnid: info.me_last_txnid,
            max_readers: info.me_maxreaders,
            num_readers: info.me_numreaders,
        }
    }
}

/// Engine library version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub string: String,
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}

/// Readable environment properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Flags,
    Path,
    FileDescriptor,
    MapSize,
    MaxReaders,
    MaxKeySize,
    UserContext,
}

impl Property {
    pub fn name(self) -> &'static str {
        match self {
            Property::Flags => "flags",
            Property::Path => "path",
            Property::FileDescriptor => "fd",
            Property::MapSize => "mapsize",
            Property::MaxReaders => "maxreaders",
            Property::MaxKeySize => "maxkeysize",
            Property::UserContext => "userctx",
        }
    }
}

impl FromStr for Property {
    type Err = Error;

    fn from_str(name: &str) -> Result<Property, Error> {
        match name {
            "flags" => Ok(Property::Flags),
            "path" => Ok(Property::Path),
            "fd" => Ok(Property::FileDescriptor),
            "mapsize" => Ok(Property::MapSize),
            "maxreaders" => Ok(Property::MaxReaders),
            "maxkeysize" => Ok(Property::MaxKeySize),
            "userctx" => Ok(Property::UserContext),
            other => Err(Error::UnknownProperty(other.to_string())),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of a property read with `Environment::get_property`.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Flags(EnvFlags),
    Path(PathBuf),
    FileDescriptor(i64),
    MapSize(usize),
    MaxReaders(u32),
    MaxKeySize(u32),
    /// `None` when no user context was set
    UserContext(Option<Rc<dyn Any>>),
}

/// Change applied with `Environment::set_property`.
#[derive(Debug, Clone)]
pub enum Setting {
    /// Switch the given flags on or off
    Flags(EnvFlags, bool),
    MapSize(usize),
    MaxReaders(u32),
    MaxDbs(u32),
    UserContext(Rc<dyn Any>),
}
