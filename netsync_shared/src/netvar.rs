//! Dirty-tracked fields.
//!
//! A `NetVar` remembers whether it was assigned since the last acknowledged
//! sync. Assigning always marks it dirty, even when the value is unchanged;
//! only `reset_dirty` clears the flag. Writing inbound bytes never touches
//! the flag.

use std::fmt;

use crate::codec::{Bytes, Codec, CodecError};

#[derive(Clone, Default)]
pub struct NetVar<T> {
    value: T,
    dirty: bool,
}

impl<T: Codec> NetVar<T> {
    /// Creates a clean field.
    pub fn new(value: T) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
        self.dirty = true;
    }

    /// Mutates the value in place and marks the field dirty.
    pub fn modify(&mut self, f: impl FnOnce(&mut T)) {
        f(&mut self.value);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn reset_dirty(&mut self) {
        self.dirty = false;
    }

    /// Serialized value.
    pub fn read(&self) -> Result<Bytes, CodecError> {
        self.value.encode(false)
    }

    /// Overwrites the value from serialized bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.value.decode_into(data)
    }
}

impl<T: fmt::Debug> fmt::Debug for NetVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetVar")
            .field("value", &self.value)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Type-erased view of a `NetVar`, used by behaviours to expose their fields.
pub trait SyncField: Send {
    fn is_dirty(&self) -> bool;
    fn reset_dirty(&mut self);
    fn read(&self) -> Result<Bytes, CodecError>;
    fn write(&mut self, data: &[u8]) -> Result<(), CodecError>;
}

impl<T: Codec + Send> SyncField for NetVar<T> {
    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn reset_dirty(&mut self) {
        self.dirty = false;
    }

    fn read(&self) -> Result<Bytes, CodecError> {
        NetVar::read(self)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), CodecError> {
        NetVar::write(self, data)
    }
}
