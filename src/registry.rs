//! Token-addressed table of strong references.
//!
//! A child handle never holds its parent directly. It retains the parent in
//! the registry and keeps the returned [`Token`]; the parent stays alive until
//! the token is released. Slots are recycled after release, and a generation
//! counter keeps a recycled slot from answering to an old token.
//!
//! Handles are bound to the thread that created them, so the process-wide
//! table is one registry per thread.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::num::NonZeroU64;
use std::rc::Rc;

use log::trace;

use crate::error::{Error, Result};

/// Opaque reference to a retained value
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(NonZeroU64);

impl Token {
    fn new(index: u32, generation: u32) -> Token {
        let raw = (u64::from(generation) << 32) | (u64::from(index) + 1);
        // The low half is index + 1 and index never reaches u32::MAX.
        Token(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    fn index(self) -> usize {
        ((self.0.get() & 0xffff_ffff) - 1) as usize
    }

    fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    pub fn into_raw(self) -> u64 {
        self.0.get()
    }

    pub fn from_raw(raw: u64) -> Option<Token> {
        NonZeroU64::new(raw)
            .filter(|raw| raw.get() & 0xffff_ffff != 0)
            .map(Token)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Token({}@{})", self.index(), self.generation())
    }
}

struct Slot {
    generation: u32,
    value: Option<Rc<dyn Any>>,
}

/// Indexed arena of retained values.
#[derive(Default)]
pub struct HandleRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a strong reference and returns the token naming it.
    pub fn retain(&mut self, value: Rc<dyn Any>) -> Result<Token> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len())
                    .ok()
                    .filter(|index| *index < u32::MAX)
                    .ok_or(Error::RegistryFull)?;
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.live += 1;
        Ok(Token::new(index, slot.generation))
    }

    pub fn resolve(&self, token: Token) -> Result<Rc<dyn Any>> {
        self.slots
            .get(token.index())
            .filter(|slot| slot.generation == token.generation())
            .and_then(|slot| slot.value.clone())
            .ok_or(Error::InvalidToken(token.into_raw()))
    }

    /// Takes the value out of its slot.
    ///
    /// The value is handed back rather than dropped so the caller can let it
    /// go after any borrow of the registry has ended; dropping it may run
    /// finalizers that release further tokens.
    pub fn remove(&mut self, token: Token) -> Result<Rc<dyn Any>> {
        let slot = self
            .slots
            .get_mut(token.index())
            .filter(|slot| slot.generation == token.generation() && slot.value.is_some())
            .ok_or(Error::InvalidToken(token.into_raw()))?;
        let value = slot.value.take().ok_or(Error::InvalidToken(token.into_raw()))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(token.index() as u32);
        self.live -= 1;
        Ok(value)
    }

    /// Number of outstanding tokens
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

thread_local! {
    static REGISTRY: RefCell<HandleRegistry> = RefCell::new(HandleRegistry::new());
}

/// Retains `value` in this thread's registry.
pub fn retain<T: Any>(value: Rc<T>) -> Result<Token> {
    retain_any(value)
}

pub fn retain_any(value: Rc<dyn Any>) -> Result<Token> {
    let token = REGISTRY.with(|registry| registry.borrow_mut().retain(value))?;
    trace!("retained {:?}", token);
    Ok(token)
}

pub fn resolve_any(token: Token) -> Result<Rc<dyn Any>> {
    REGISTRY.with(|registry| registry.borrow().resolve(token))
}

/// Resolves a token to the concrete type it was retained as.
pub fn resolve<T: Any>(token: Token) -> Result<Rc<T>> {
    resolve_any(token)?
        .downcast::<T>()
        .map_err(|_| Error::InvalidToken(token.into_raw()))
}

/// Drops the reference named by `token`.
///
/// Releasing during thread teardown, after the registry itself is gone, is a
/// no-op.
pub fn release(token: Token) -> Result<()> {
    let value = match REGISTRY.try_with(|registry| registry.borrow_mut().remove(token)) {
        Ok(value) => value?,
        Err(_) => return Ok(()),
    };
    trace!("released {:?}", token);
    drop(value);
    Ok(())
}

/// Number of references outstanding in this thread's registry
pub fn outstanding() -> usize {
    REGISTRY
        .try_with(|registry| registry.borrow().len())
        .unwrap_or(0)
}
