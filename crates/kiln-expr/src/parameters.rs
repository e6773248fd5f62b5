//! Binding table and parameter store used by bound expressions.
//!
//! Building a binding registers its name in a [`ParameterBindings`] table and
//! receives a word slot. The slot is turned into a byte offset once, and every
//! evaluation afterwards reads the [`ParameterStore`] at that fixed offset.

use bytemuck::Pod;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::value::OutputType;

/// Size in bytes of one parameter slot.
pub const WORD_SIZE: u32 = 4;

/// External table assigning slots to named parameters.
pub trait ParameterBindings {
    /// Registers `name` with the given type and returns its first word slot.
    ///
    /// Returns `None` when the name cannot be bound, e.g. it is already
    /// registered with a different type.
    fn register(&mut self, name: &str, output_type: OutputType) -> Option<u32>;

    /// Looks up a previously registered name.
    fn lookup(&self, name: &str) -> Option<(u32, OutputType)>;
}

/// Default [`ParameterBindings`] that packs parameters into consecutive words.
#[derive(Debug, Clone, Default)]
pub struct ParameterLayout {
    slots: FxHashMap<SmolStr, (u32, OutputType)>,
    next_slot: u32,
}

impl ParameterLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of words allocated so far.
    pub fn word_count(&self) -> u32 {
        self.next_slot
    }

    pub fn size_in_bytes(&self) -> usize {
        (self.next_slot * WORD_SIZE) as usize
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32, OutputType)> {
        self.slots
            .iter()
            .map(|(name, (slot, output_type))| (name.as_str(), *slot, *output_type))
    }
}

impl ParameterBindings for ParameterLayout {
    fn register(&mut self, name: &str, output_type: OutputType) -> Option<u32> {
        if let Some((slot, existing)) = self.slots.get(name) {
            return (*existing == output_type).then_some(*slot);
        }

        let slot = self.next_slot;
        self.next_slot += output_type.channels() as u32;
        self.slots.insert(SmolStr::new(name), (slot, output_type));
        Some(slot)
    }

    fn lookup(&self, name: &str) -> Option<(u32, OutputType)> {
        self.slots.get(name).copied()
    }
}

/// Read-only, offset-addressed view over parameter bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterStore<'a> {
    bytes: &'a [u8],
}

impl<'a> ParameterStore<'a> {
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub const fn empty() -> Self {
        Self { bytes: &[] }
    }

    pub fn from_words(words: &'a [u32]) -> Self {
        Self {
            bytes: bytemuck::cast_slice(words),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn read_at(&self, offset: usize, size: usize) -> Option<&'a [u8]> {
        self.bytes.get(offset..offset.checked_add(size)?)
    }

    /// Reads a `T` starting at byte `offset`; alignment is not required.
    pub fn read<T: Pod>(&self, offset: usize) -> Option<T> {
        self.read_at(offset, std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
    }
}
