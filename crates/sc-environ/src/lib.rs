//! Combo generator (component C) and configuration store (component D).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate shader entry name: {0}")]
    DuplicateName(String),
    #[error("define range invalid for {name}: min {min} > max {max}")]
    InvalidRange { name: String, min: i64, max: i64 },
}

/// A named integer variable with inclusive range `[min, max]` and a
/// static/dynamic classification.
#[derive(Debug, Clone)]
pub struct Define {
    pub name: String,
    pub min: i64,
    pub max: i64,
    pub is_static: bool,
}

impl Define {
    pub fn new(name: impl Into<String>, min: i64, max: i64, is_static: bool) -> Self {
        Define {
            name: name.into(),
            min,
            max,
            is_static,
        }
    }

    pub fn cardinality(&self) -> u64 {
        (self.max - self.min + 1) as u64
    }
}

/// Immutable after configuration load.
#[derive(Debug)]
pub struct ShaderEntry {
    pub name: String,
    pub source_file: PathBuf,
    /// Static defines first (in declaration order), then dynamic defines
    /// (in declaration order) — this is the order `format`/`macros` emit
    /// variables in, *not* the mixed-radix digit order (see `strides`).
    pub defines: Vec<Define>,
    pub skip_expression: String,
    pub command_prefix: String,
    pub command_suffix: String,
    pub num_static: u64,
    pub num_dynamic: u64,
    pub num_combos: u64,
    pub command_start: u64,
    pub command_end: u64,
    /// Per-define place value. Dynamic defines get the low-order strides
    /// and static defines the high-order ones, so `combo_index =
    /// dynamic_part + num_dynamic * static_part` — matching
    /// `ComboHandle::static_index`/`dynamic_index` and the engine's
    /// per-static contiguous dynamic-command range.
    strides: Vec<u64>,
    /// Indices into `defines`, ordered from least to most significant
    /// digit (dynamic defines first, then static), for `advance`'s carry
    /// loop.
    digit_order: Vec<usize>,
}

impl ShaderEntry {
    pub fn new(
        name: impl Into<String>,
        source_file: PathBuf,
        defines: Vec<Define>,
        skip_expression: impl Into<String>,
        command_prefix: impl Into<String>,
        command_suffix: impl Into<String>,
        command_start: u64,
    ) -> Result<Self, ConfigError> {
        for d in &defines {
            if d.min > d.max {
                return Err(ConfigError::InvalidRange {
                    name: d.name.clone(),
                    min: d.min,
                    max: d.max,
                });
            }
        }
        let num_static: u64 = defines
            .iter()
            .filter(|d| d.is_static)
            .map(|d| d.cardinality())
            .product();
        let num_dynamic: u64 = defines
            .iter()
            .filter(|d| !d.is_static)
            .map(|d| d.cardinality())
            .product();
        let num_combos = num_static * num_dynamic;

        let mut strides = vec![0u64; defines.len()];
        let mut digit_order = Vec::with_capacity(defines.len());
        let mut acc = 1u64;
        for (i, d) in defines.iter().enumerate() {
            if !d.is_static {
                strides[i] = acc;
                acc *= d.cardinality();
                digit_order.push(i);
            }
        }
        for (i, d) in defines.iter().enumerate() {
            if d.is_static {
                strides[i] = acc;
                acc *= d.cardinality();
                digit_order.push(i);
            }
        }

        Ok(ShaderEntry {
            name: name.into(),
            source_file,
            defines,
            skip_expression: skip_expression.into(),
            command_prefix: command_prefix.into(),
            command_suffix: command_suffix.into(),
            num_static,
            num_dynamic,
            num_combos,
            command_start,
            command_end: command_start + num_combos,
            strides,
            digit_order,
        })
    }

    pub fn num_combos_of(&self, static_only: bool) -> u64 {
        if static_only {
            self.num_static
        } else {
            self.num_dynamic
        }
    }
}

/// A mutable cursor owning the target entry, the current command number,
/// the current combo-in-entry index, and the current per-variable value
/// vector.
#[derive(Debug, Clone)]
pub struct ComboHandle {
    entry: Arc<ShaderEntry>,
    pub command_number: u64,
    pub combo_index: u64,
    values: Vec<i64>,
}

impl ComboHandle {
    pub fn entry(&self) -> &ShaderEntry {
        &self.entry
    }

    pub fn entry_arc(&self) -> Arc<ShaderEntry> {
        self.entry.clone()
    }

    pub fn value_of(&self, name: &str) -> i64 {
        self.entry
            .defines
            .iter()
            .position(|d| d.name == name)
            .map(|i| self.values[i])
            .unwrap_or(0)
    }

    pub fn static_index(&self) -> u64 {
        self.combo_index / self.entry.num_dynamic
    }

    pub fn dynamic_index(&self) -> u64 {
        self.combo_index % self.entry.num_dynamic
    }

    /// Adds `n` to the combo index without recomputing from scratch, using
    /// a digit carry loop over the mixed-radix representation. Processes
    /// digits least-significant first (`entry.digit_order`: dynamic defines,
    /// then static), so overflow out of a dynamic digit carries into static.
    pub fn advance(&mut self, n: u64) {
        let mut carry = n;
        for &i in &self.entry.digit_order {
            if carry == 0 {
                break;
            }
            let d = &self.entry.defines[i];
            let card = d.cardinality();
            let cur_digit = (self.values[i] - d.min) as u64;
            let total = cur_digit + carry;
            self.values[i] = d.min + (total % card) as i64;
            carry = total / card;
        }
        self.combo_index += n;
        self.command_number += n;
    }

    /// Writes a compiler-invocation string:
    /// `"<prefix> /DSHADERCOMBO=<hex combo index> /D<var>=<value> ... <suffix>\n"`.
    pub fn format(&self, buf: &mut String) {
        buf.push_str(&self.entry.command_prefix);
        buf.push(' ');
        let _ = write!(buf, "/DSHADERCOMBO={:x}", self.combo_index);
        for (i, d) in self.entry.defines.iter().enumerate() {
            buf.push(' ');
            let _ = write!(buf, "/D{}={}", d.name, self.values[i]);
        }
        buf.push(' ');
        buf.push_str(&self.entry.command_suffix);
        buf.push('\n');
    }

    pub fn macros(&self) -> Vec<(String, String)> {
        self.entry
            .defines
            .iter()
            .zip(&self.values)
            .map(|(d, v)| (d.name.clone(), v.to_string()))
            .collect()
    }
}

/// Positions a handle at combo-in-entry index `k` via mixed-radix
/// decomposition against `entry.strides` (dynamic defines are the
/// least-significant digits, static defines the most significant).
pub fn combo_at(entry: Arc<ShaderEntry>, k: u64) -> ComboHandle {
    let mut values = Vec::with_capacity(entry.defines.len());
    for (i, d) in entry.defines.iter().enumerate() {
        let digit = (k / entry.strides[i]) % d.cardinality();
        values.push(d.min + digit as i64);
    }
    let command_number = entry.command_start + k;
    ComboHandle {
        entry,
        command_number,
        combo_index: k,
        values,
    }
}

/// Crosses shader-entry boundaries as it steps through the global command
/// space; the primitive the work engine drives its shared cursor with.
pub struct GlobalCursor {
    entries: Vec<Arc<ShaderEntry>>,
    entry_idx: usize,
    handle: ComboHandle,
}

impl GlobalCursor {
    pub fn start(entries: Vec<Arc<ShaderEntry>>) -> Option<Self> {
        let first = entries.first()?.clone();
        Some(GlobalCursor {
            entries,
            entry_idx: 0,
            handle: combo_at(first, 0),
        })
    }

    pub fn handle(&self) -> &ComboHandle {
        &self.handle
    }

    pub fn command_number(&self) -> u64 {
        self.handle.command_number
    }

    /// Steps exactly one combo forward, crossing into the next entry when
    /// the current one is exhausted. Returns `false` once the whole
    /// command space is exhausted.
    pub fn step_one(&mut self) -> bool {
        let entry = &self.entries[self.entry_idx];
        if self.handle.combo_index + 1 < entry.num_combos {
            self.handle.advance(1);
            true
        } else if self.entry_idx + 1 < self.entries.len() {
            self.entry_idx += 1;
            let next = self.entries[self.entry_idx].clone();
            self.handle = combo_at(next, 0);
            true
        } else {
            false
        }
    }

    /// Advances by at least one step, evaluating the skip expression at
    /// each step, stopping at the next combo whose expression value is `0`
    /// (kept), or returning `false` if `limit` (an exclusive global command
    /// number bound) is reached first.
    pub fn next_not_skipped(&mut self, limit: u64) -> bool {
        loop {
            if !self.step_one() {
                return false;
            }
            if self.handle.command_number >= limit {
                return false;
            }
            let skip_expr = &self.entries[self.entry_idx].skip_expression;
            let handle = &self.handle;
            let env = |name: &str| handle.value_of(name);
            if sc_expr::evaluate(skip_expr, &env) == 0 {
                return true;
            }
        }
    }
}

/// Holds the ordered list of shader entries, the name lookup, and a
/// sparsely-sampled command-number index for O(1)-ish random access.
pub struct ConfigStore {
    entries: Vec<Arc<ShaderEntry>>,
    by_name: HashMap<String, usize>,
    samples: Vec<Vec<(u64, u64)>>,
}

impl ConfigStore {
    pub fn build(raw_entries: Vec<ShaderEntry>) -> Result<Self, ConfigError> {
        let mut entries = Vec::with_capacity(raw_entries.len());
        let mut by_name = HashMap::new();
        let mut cursor = 0u64;
        for mut e in raw_entries {
            if by_name.contains_key(&e.name) {
                return Err(ConfigError::DuplicateName(e.name));
            }
            e.command_start = cursor;
            e.command_end = cursor + e.num_combos;
            cursor = e.command_end;
            by_name.insert(e.name.clone(), entries.len());
            entries.push(Arc::new(e));
        }
        let samples = entries.iter().map(|e| build_samples(e.num_combos)).collect();
        Ok(ConfigStore {
            entries,
            by_name,
            samples,
        })
    }

    pub fn entries(&self) -> &[Arc<ShaderEntry>] {
        &self.entries
    }

    pub fn entry_by_name(&self, name: &str) -> Option<&Arc<ShaderEntry>> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    pub fn total_commands(&self) -> u64 {
        self.entries.last().map(|e| e.command_end).unwrap_or(0)
    }

    fn entry_index_for_command(&self, q: u64) -> usize {
        match self.entries.binary_search_by(|e| e.command_start.cmp(&q)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    /// Resolves a global command number to a positioned `ComboHandle` by
    /// finding the largest sampled template key at or below the query and
    /// advancing it the remaining distance.
    pub fn resolve(&self, q: u64) -> ComboHandle {
        let idx = self.entry_index_for_command(q);
        let entry = &self.entries[idx];
        let local = q - entry.command_start;
        let samples = &self.samples[idx];
        let pos = match samples.binary_search_by_key(&local, |&(k, _)| k) {
            Ok(p) => p,
            Err(0) => 0,
            Err(p) => p - 1,
        };
        let (sample_key, sample_combo) = samples[pos];
        let mut handle = combo_at(entry.clone(), sample_combo);
        handle.advance(local - sample_key);
        handle
    }

    pub fn global_cursor(&self) -> Option<GlobalCursor> {
        GlobalCursor::start(self.entries.to_vec())
    }
}

fn build_samples(num_combos: u64) -> Vec<(u64, u64)> {
    let stride = std::cmp::max(1000, num_combos / 500).max(1);
    let mut samples = Vec::new();
    let mut k = 0u64;
    loop {
        samples.push((k, k));
        if k >= num_combos.saturating_sub(1) || num_combos == 0 {
            break;
        }
        k = k.saturating_add(stride);
        if k >= num_combos {
            break;
        }
    }
    samples
}
