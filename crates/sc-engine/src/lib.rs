//! Work engine (component H): a shared job cursor consumed by a worker
//! pool, with packaging gated by an ordered-completion barrier so a static
//! combo is only ever packed after every one of its dynamic combos has
//! finished compiling.
//!
//! One mutex (`Session::inner`) guards the byte-code store, the cursor,
//! the per-worker running-command records and the diagnostic tables. The
//! compile call and LZMA compression both run outside it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sc_cache::{ByteCodeBlock, ByteCodeStore};
use sc_compiler::{CompileFlags, CompileOutcome, CompileRequest, CompilerBackend, FileCache};
use sc_container::{ContainerMeta, StaticComboInput};
use sc_environ::{ConfigStore, GlobalCursor, ShaderEntry};

/// One deduped diagnostic message: first offending command and a running
/// count, keyed externally by the exact message text.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageRecord {
    pub first_command: u64,
    pub count: u64,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    messages: HashMap<String, MessageRecord>,
    had_error: HashSet<String>,
}

impl Diagnostics {
    fn record_message(&mut self, text: String, command_number: u64) {
        self.messages
            .entry(text)
            .and_modify(|r| r.count += 1)
            .or_insert(MessageRecord {
                first_command: command_number,
                count: 1,
            });
    }

    fn mark_had_error(&mut self, name: &str) {
        self.had_error.insert(name.to_string());
    }

    pub fn had_error(&self, name: &str) -> bool {
        self.had_error.contains(name)
    }

    pub fn messages(&self) -> &HashMap<String, MessageRecord> {
        &self.messages
    }

    pub fn shaders_with_errors(&self) -> usize {
        self.had_error.len()
    }
}

struct SessionInner {
    cursor: Option<GlobalCursor>,
    end_cmd: u64,
    last_packaged: u64,
    workers: Vec<Option<u64>>,
    store: ByteCodeStore,
    diagnostics: Diagnostics,
    emitted: HashSet<String>,
}

/// Notified once per completed command, outside any lock. Used by the
/// binary crate to drive a throughput moving average and `--verbose`
/// progress lines; entirely optional for library consumers.
pub trait ProgressSink: Send + Sync {
    fn on_command_complete(&self, command_number: u64, total_commands: u64);
}

/// Everything the engine needs to drive one run: the ordered shader
/// entries, the compiler back end, the include-file cache, and the
/// output location. Immutable after construction; read without locking.
pub struct Session {
    entries: Vec<Arc<ShaderEntry>>,
    backend: Arc<dyn CompilerBackend>,
    /// Not consulted directly here: a `CompilerBackend` implementation
    /// holds its own handle to the same cache for include resolution.
    /// Kept on the session so callers can hand out one shared instance.
    #[allow(dead_code)]
    file_cache: Arc<FileCache>,
    source_root: PathBuf,
    output_dir: PathBuf,
    target_profile: String,
    flags: CompileFlags,
    progress: Option<Arc<dyn ProgressSink>>,
    inner: Mutex<SessionInner>,
}

#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    pub num_workers: usize,
}

impl RunConfig {
    pub fn default_parallelism() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        RunConfig { num_workers: n }
    }
}

/// Summary returned once every worker has exited and every fully-packaged
/// shader has been written.
pub struct RunReport {
    pub shaders_with_errors: usize,
    pub messages: HashMap<String, MessageRecord>,
}

impl Session {
    pub fn new(
        config: &ConfigStore,
        backend: Arc<dyn CompilerBackend>,
        file_cache: Arc<FileCache>,
        source_root: PathBuf,
        output_dir: PathBuf,
        target_profile: String,
        flags: CompileFlags,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Self {
        let entries: Vec<Arc<ShaderEntry>> = config.entries().to_vec();
        let end_cmd = config.total_commands();
        let mut cursor = config.global_cursor();
        if let Some(c) = cursor.as_mut() {
            if !combo_is_kept(c) && !c.next_not_skipped(end_cmd) {
                cursor = None;
            }
        }
        let num_workers = 1; // overwritten by `run`; placeholder avoids an Option in the hot path
        Session {
            entries,
            backend,
            file_cache,
            source_root,
            output_dir,
            target_profile,
            flags,
            progress,
            inner: Mutex::new(SessionInner {
                cursor,
                end_cmd,
                last_packaged: 0,
                workers: vec![None; num_workers],
                store: ByteCodeStore::new(),
                diagnostics: Diagnostics::default(),
                emitted: HashSet::new(),
            }),
        }
    }

    /// Spawns `run_config.num_workers` OS threads, each driving the shared
    /// cursor to completion, then joins them and returns the diagnostic
    /// summary.
    pub fn run(&self, run_config: RunConfig) -> RunReport {
        let num_workers = run_config.num_workers.max(1);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.workers = vec![None; num_workers];
        }

        std::thread::scope(|scope| {
            for worker_id in 0..num_workers {
                scope.spawn(move || self.worker_loop(worker_id));
            }
        });

        self.finish_remaining_shaders();

        let inner = self.inner.lock().unwrap();
        RunReport {
            shaders_with_errors: inner.diagnostics.shaders_with_errors(),
            messages: inner.diagnostics.messages().clone(),
        }
    }

    fn worker_loop(&self, worker_id: usize) {
        loop {
            let work = {
                let mut inner = self.inner.lock().unwrap();
                if inner.cursor.is_none() {
                    None
                } else {
                    let command_number = inner.cursor.as_ref().unwrap().command_number();
                    let handle = inner.cursor.as_ref().unwrap().handle().clone();
                    inner.workers[worker_id] = Some(command_number);
                    let end_cmd = inner.end_cmd;
                    let advanced = inner.cursor.as_mut().unwrap().next_not_skipped(end_cmd);
                    if !advanced {
                        inner.cursor = None;
                    }
                    Some((command_number, handle))
                }
            };

            let (command_number, handle) = match work {
                Some(w) => w,
                None => break,
            };
            let entry = handle.entry();
            let name = entry.name.clone();
            let static_id = handle.static_index();
            let dynamic_id = handle.dynamic_index();

            let source_path = self.source_root.join(&entry.source_file);
            let source = match std::fs::read(&source_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    let listing = format!("could not read source {}: {e}", source_path.display());
                    log::warn!("{listing}");
                    let to_pack =
                        self.deposit_failure(worker_id, command_number, &name, listing);
                    self.package_and_seal(to_pack);
                    if let Some(sink) = &self.progress {
                        sink.on_command_complete(command_number, self.total_commands());
                    }
                    continue;
                }
            };
            let file_name = entry
                .source_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let macros = handle.macros();
            let request = CompileRequest {
                source: &source,
                file_name_for_diagnostics: &file_name,
                macros: &macros,
                target_profile: &self.target_profile,
                flags: self.flags,
            };
            let outcome = self.backend.compile(&request);

            let to_pack = match outcome {
                CompileOutcome::Ok { bytecode, listing } => {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(text) = listing {
                        inner.diagnostics.record_message(text, command_number);
                    }
                    inner.store.add_dynamic_block(
                        &name,
                        static_id,
                        ByteCodeBlock::new(dynamic_id, bytecode),
                    );
                    inner.workers[worker_id] = None;
                    self.advance_barrier(&mut inner, command_number)
                }
                CompileOutcome::Err { listing } => {
                    self.deposit_failure(worker_id, command_number, &name, listing)
                }
            };
            self.package_and_seal(to_pack);
            if let Some(sink) = &self.progress {
                sink.on_command_complete(command_number, self.total_commands());
            }
        }
    }

    fn total_commands(&self) -> u64 {
        self.inner.lock().unwrap().end_cmd
    }

    fn deposit_failure(
        &self,
        worker_id: usize,
        command_number: u64,
        name: &str,
        listing: String,
    ) -> Vec<(String, u64, Vec<ByteCodeBlock>)> {
        log::error!("command {command_number} ({name}) failed: {listing}");
        let mut inner = self.inner.lock().unwrap();
        inner.diagnostics.record_message(listing, command_number);
        inner.diagnostics.mark_had_error(name);
        inner.workers[worker_id] = None;
        self.advance_barrier(&mut inner, command_number)
    }

    /// Advances `last_packaged` per the ordered-completion rule and, under
    /// the same critical section, swaps out (via `take_dynamic_blocks`) the
    /// dynamic blocks of every static combo newly eligible for packaging.
    /// Returns them for the caller to compress and seal outside the lock.
    fn advance_barrier(
        &self,
        inner: &mut SessionInner,
        n: u64,
    ) -> Vec<(String, u64, Vec<ByteCodeBlock>)> {
        let min_inflight = inner.workers.iter().filter_map(|w| *w).min();
        let done_up_to = match min_inflight {
            Some(m) if m < n + 1 => m,
            _ => n + 1,
        };
        if done_up_to <= inner.last_packaged {
            return Vec::new();
        }
        log::debug!("barrier advances last_packaged {} -> {done_up_to}", inner.last_packaged);
        inner.last_packaged = done_up_to;

        let mut to_pack = Vec::new();
        for entry in &self.entries {
            if entry.command_start >= inner.last_packaged || inner.emitted.contains(&entry.name) {
                continue;
            }
            for static_id in inner.store.static_combo_ids(&entry.name) {
                if inner.store.is_sealed(&entry.name, static_id) {
                    continue;
                }
                let upper = entry.command_start + (static_id + 1) * entry.num_dynamic;
                if upper <= inner.last_packaged {
                    log::debug!("static combo {}/{static_id} eligible for packaging", entry.name);
                    let blocks = inner.store.take_dynamic_blocks(&entry.name, static_id);
                    to_pack.push((entry.name.clone(), static_id, blocks));
                }
            }
        }
        to_pack
    }

    /// LZMA-compresses each eligible static combo's blocks outside any
    /// lock, then reacquires it once to seal them and check for shaders
    /// whose whole command range is now packaged.
    fn package_and_seal(&self, to_pack: Vec<(String, u64, Vec<ByteCodeBlock>)>) {
        if to_pack.is_empty() {
            return;
        }
        let packed: Vec<(String, u64, Vec<u8>)> = to_pack
            .into_iter()
            .map(|(name, id, blocks)| {
                let bytes = sc_cache::packager::pack_blocks(blocks);
                (name, id, bytes)
            })
            .collect();

        let mut inner = self.inner.lock().unwrap();
        for (name, id, bytes) in packed {
            inner.store.seal_static(&name, id, bytes);
        }
        self.emit_ready_shaders(&mut inner);
    }

    fn emit_ready_shaders(&self, inner: &mut SessionInner) {
        let mut ready = Vec::new();
        for entry in &self.entries {
            if inner.emitted.contains(&entry.name) {
                continue;
            }
            if entry.command_end <= inner.last_packaged {
                ready.push(entry.clone());
            }
        }
        for entry in ready {
            inner.emitted.insert(entry.name.clone());
            let table = inner.store.take_shader(&entry.name);
            let had_error = inner.diagnostics.had_error(&entry.name);
            self.write_or_discard(&entry, table, had_error);
        }
    }

    fn finish_remaining_shaders(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.emit_ready_shaders(&mut inner);
    }

    fn write_or_discard(
        &self,
        entry: &ShaderEntry,
        table: Option<sc_cache::ShaderTable>,
        had_error: bool,
    ) {
        let path = self.output_dir.join(format!("{}.vcs", entry.name));
        if had_error {
            log::error!("shader {} had at least one failed combo; discarding output", entry.name);
            let _ = std::fs::remove_file(&path);
            return;
        }
        let table = match table {
            Some(t) => t,
            None => return,
        };
        let combos: Vec<StaticComboInput> = table
            .into_values()
            .filter_map(|c| {
                c.packed_payload.map(|payload| StaticComboInput {
                    static_combo_id: c.static_combo_id,
                    payload,
                })
            })
            .collect();
        if combos.is_empty() {
            return;
        }
        let source_crc32 = match sc_hash::hash_source(&self.source_root.join(&entry.source_file)) {
            Ok(crc) => crc,
            Err(e) => {
                log::warn!("could not hash source for {}: {e}", entry.name);
                0
            }
        };
        log::info!("shader {} complete ({} static combos)", entry.name, combos.len());
        let meta = ContainerMeta {
            total_combos: entry.num_combos as u32,
            dynamic_combos: entry.num_dynamic as u32,
            flags: self.flags.bits(),
            centroid_mask: 0,
            source_crc32,
        };
        if let Err(e) = sc_container::write_vcs(&path, meta, combos) {
            log::warn!("could not write {}: {e}", path.display());
        }
    }
}

fn combo_is_kept(cursor: &GlobalCursor) -> bool {
    let handle = cursor.handle();
    let skip_expr = &handle.entry().skip_expression;
    let env = |name: &str| handle.value_of(name);
    sc_expr::evaluate(skip_expr, &env) == 0
}
