//! Byte-code store (component F) and packager (component G).
//!
//! This crate holds the data model only; the global mutex that serializes
//! access to it (§5's "session") lives in `sc-engine`, which is the only
//! thing allowed to mutate a `ByteCodeStore` concurrently.

use std::collections::HashMap;

pub mod packager;

/// `(dynamic_combo_id, crc32, bytes)`. Created on successful compile,
/// destroyed when its owning `StaticCombo` is sealed.
#[derive(Debug, Clone)]
pub struct ByteCodeBlock {
    pub dynamic_combo_id: u64,
    pub crc32: u32,
    pub bytes: Vec<u8>,
}

impl ByteCodeBlock {
    pub fn new(dynamic_combo_id: u64, bytes: Vec<u8>) -> Self {
        let crc32 = crc32fast::hash(&bytes);
        ByteCodeBlock {
            dynamic_combo_id,
            crc32,
            bytes,
        }
    }
}

/// At most one of `dynamic_blocks` (non-empty) or `packed_payload` (`Some`)
/// is meaningfully "live" at a time: compiles accumulate into the block
/// list, sealing moves the packed stream in and clears the list.
#[derive(Debug, Default)]
pub struct StaticCombo {
    pub static_combo_id: u64,
    pub dynamic_blocks: Vec<ByteCodeBlock>,
    pub packed_payload: Option<Vec<u8>>,
}

pub type ShaderTable = HashMap<u64, StaticCombo>;

/// `name -> static_combo_id -> StaticCombo`. Not internally synchronized;
/// the owning session (`sc-engine`) guards every access with its single
/// mutex.
#[derive(Debug, Default)]
pub struct ByteCodeStore {
    shaders: HashMap<String, ShaderTable>,
}

impl ByteCodeStore {
    pub fn new() -> Self {
        ByteCodeStore::default()
    }

    pub fn add_dynamic_block(&mut self, name: &str, static_id: u64, block: ByteCodeBlock) {
        let table = self.shaders.entry(name.to_string()).or_default();
        let combo = table.entry(static_id).or_insert_with(|| StaticCombo {
            static_combo_id: static_id,
            dynamic_blocks: Vec::new(),
            packed_payload: None,
        });
        combo.dynamic_blocks.push(block);
    }

    /// Swaps a static combo's accumulated dynamic blocks out for packaging,
    /// leaving the combo registered (so a later `seal_static` can find it)
    /// but empty.
    pub fn take_dynamic_blocks(&mut self, name: &str, static_id: u64) -> Vec<ByteCodeBlock> {
        self.shaders
            .get_mut(name)
            .and_then(|table| table.get_mut(&static_id))
            .map(|combo| std::mem::take(&mut combo.dynamic_blocks))
            .unwrap_or_default()
    }

    /// Replaces a static combo's dynamic block list with its packed
    /// payload.
    pub fn seal_static(&mut self, name: &str, static_id: u64, packed: Vec<u8>) {
        let table = self.shaders.entry(name.to_string()).or_default();
        let combo = table.entry(static_id).or_insert_with(|| StaticCombo {
            static_combo_id: static_id,
            dynamic_blocks: Vec::new(),
            packed_payload: None,
        });
        combo.packed_payload = Some(packed);
        combo.dynamic_blocks.clear();
    }

    /// Transfers ownership of a shader's whole table out, for the output
    /// writer.
    pub fn take_shader(&mut self, name: &str) -> Option<ShaderTable> {
        self.shaders.remove(name)
    }

    pub fn static_combo_ids(&self, name: &str) -> Vec<u64> {
        self.shaders
            .get(name)
            .map(|table| table.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_sealed(&self, name: &str, static_id: u64) -> bool {
        self.shaders
            .get(name)
            .and_then(|table| table.get(&static_id))
            .map(|combo| combo.packed_payload.is_some())
            .unwrap_or(false)
    }
}
