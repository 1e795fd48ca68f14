//! Root crate: the configuration-manifest parser (§6.2), the external
//! compiler back end adapter, and the small UX helpers the binary wires
//! together. The component libraries (`sc-*`) hold the actual engine; this
//! crate only assembles them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use sc_compiler::{CompileFlags, CompileOutcome, CompileRequest, CompilerBackend};
use sc_environ::{ConfigError, Define, ShaderEntry};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected {expected}, found {found:?}")]
    UnexpectedLine {
        path: PathBuf,
        line: usize,
        expected: &'static str,
        found: String,
    },
    #[error("{path}:{line}: malformed define line {found:?}")]
    MalformedDefine {
        path: PathBuf,
        line: usize,
        found: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Parses the `#BEGIN .. #END` configuration-manifest format described in
/// §6.2. Re-entry with a name already seen is silently skipped: the
/// `#BEGIN` line is consumed but its body is never handed to the section
/// parser, so the outer scan just keeps looking for the next `#BEGIN` —
/// matching `cfgprocessor.cpp`'s `ProcessConfiguration`/`WaitFor` behavior
/// for duplicate entry names.
pub fn parse_manifest(path: &Path) -> Result<Vec<ShaderEntry>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let lines: Vec<&str> = text.lines().collect();

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let (idx, trimmed) = match next_nonblank(&lines, i) {
            Some(v) => v,
            None => break,
        };
        i = idx + 1;
        let name = match trimmed.strip_prefix("#BEGIN") {
            Some(rest) => rest.trim().to_string(),
            None => continue,
        };
        if name.is_empty() || !seen.insert(name.clone()) {
            continue;
        }
        let (entry, next_i) = parse_section(path, &lines, i, name)?;
        entries.push(entry);
        i = next_i;
    }
    Ok(entries)
}

fn next_nonblank<'a>(lines: &[&'a str], mut i: usize) -> Option<(usize, &'a str)> {
    while i < lines.len() {
        let t = lines[i].trim();
        if !t.is_empty() {
            return Some((i, t));
        }
        i += 1;
    }
    None
}

fn expect_line<'a>(
    path: &Path,
    lines: &'a [&str],
    i: usize,
    expected: &'static str,
) -> Result<(usize, &'a str), ManifestError> {
    match next_nonblank(lines, i) {
        Some(v) => Ok(v),
        None => Err(ManifestError::UnexpectedLine {
            path: path.to_path_buf(),
            line: lines.len(),
            expected,
            found: "end of file".to_string(),
        }),
    }
}

fn expect_marker(
    path: &Path,
    lines: &[&str],
    i: usize,
    marker: &'static str,
) -> Result<usize, ManifestError> {
    let (idx, trimmed) = expect_line(path, lines, i, marker)?;
    if trimmed != marker {
        return Err(ManifestError::UnexpectedLine {
            path: path.to_path_buf(),
            line: idx + 1,
            expected: marker,
            found: trimmed.to_string(),
        });
    }
    Ok(idx + 1)
}

fn parse_define_block(
    path: &Path,
    lines: &[&str],
    mut i: usize,
    is_static: bool,
) -> Result<(Vec<Define>, usize), ManifestError> {
    let mut defines = Vec::new();
    loop {
        let (idx, trimmed) = match next_nonblank(lines, i) {
            Some(v) => v,
            None => break,
        };
        if trimmed.starts_with('#') {
            break;
        }
        i = idx + 1;
        defines.push(parse_define_line(path, idx, trimmed, is_static)?);
    }
    Ok((defines, i))
}

/// `<var> = <min> .. <max>`
fn parse_define_line(
    path: &Path,
    line_idx: usize,
    line: &str,
    is_static: bool,
) -> Result<Define, ManifestError> {
    let malformed = || ManifestError::MalformedDefine {
        path: path.to_path_buf(),
        line: line_idx + 1,
        found: line.to_string(),
    };
    let (name, rest) = line.split_once('=').ok_or_else(malformed)?;
    let (min_str, max_str) = rest.split_once("..").ok_or_else(malformed)?;
    let min: i64 = min_str.trim().parse().map_err(|_| malformed())?;
    let max: i64 = max_str.trim().parse().map_err(|_| malformed())?;
    Ok(Define::new(name.trim(), min, max, is_static))
}

fn parse_section(
    path: &Path,
    lines: &[&str],
    i: usize,
    name: String,
) -> Result<(ShaderEntry, usize), ManifestError> {
    let (idx, source_line) = expect_line(path, lines, i, "source file path")?;
    let source_file = PathBuf::from(source_line.trim());
    let mut i = idx + 1;

    i = expect_marker(path, lines, i, "#DEFINES-S")?;
    let (static_defines, next_i) = parse_define_block(path, lines, i, true)?;
    i = next_i;

    i = expect_marker(path, lines, i, "#DEFINES-D")?;
    let (dynamic_defines, next_i) = parse_define_block(path, lines, i, false)?;
    i = next_i;

    i = expect_marker(path, lines, i, "#SKIP")?;
    let (idx, skip_line) = expect_line(path, lines, i, "skip expression")?;
    let skip_expression = skip_line.to_string();
    i = idx + 1;

    i = expect_marker(path, lines, i, "#COMMAND")?;
    let (idx, prefix_line) = expect_line(path, lines, i, "command prefix")?;
    let command_prefix = prefix_line.to_string();
    i = idx + 1;
    let (idx, suffix_line) = expect_line(path, lines, i, "command suffix")?;
    let command_suffix = suffix_line.to_string();
    i = idx + 1;

    i = expect_marker(path, lines, i, "#END")?;

    let mut defines = static_defines;
    defines.extend(dynamic_defines);
    let entry = ShaderEntry::new(
        name,
        source_file,
        defines,
        skip_expression,
        command_prefix,
        command_suffix,
        0,
    )?;
    Ok((entry, i))
}

/// Reads the sibling `uniquefilestocopy.txt` include-manifest: one relative
/// path per non-blank line.
pub fn parse_include_manifest(path: &Path) -> Result<Vec<PathBuf>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect())
}

/// Delegates compilation to an external process, one invocation per combo.
/// `cfgprocessor`'s original back end (`CompilerHost`) is an out-of-process
/// COM/ICE service talking over shared memory; this is the same shape
/// (compilation happens in a collaborator process, not in this binary)
/// expressed with `std::process::Command` instead of Windows IPC.
pub struct ProcessBackend {
    executable: PathBuf,
}

impl ProcessBackend {
    pub fn new(executable: PathBuf) -> Self {
        ProcessBackend { executable }
    }
}

impl CompilerBackend for ProcessBackend {
    fn compile(&self, request: &CompileRequest<'_>) -> CompileOutcome {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("--profile").arg(request.target_profile);
        cmd.arg("--file").arg(request.file_name_for_diagnostics);
        cmd.arg("--flags").arg(request.flags.bits().to_string());
        for (name, value) in request.macros {
            cmd.arg("-D").arg(format!("{name}={value}"));
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return CompileOutcome::Err {
                    listing: format!("failed to launch compiler backend: {e}"),
                }
            }
        };
        {
            use std::io::Write;
            if let Some(stdin) = child.stdin.as_mut() {
                let _ = stdin.write_all(request.source);
            }
        }
        let output = match child.wait_with_output() {
            Ok(o) => o,
            Err(e) => {
                return CompileOutcome::Err {
                    listing: format!("compiler backend did not exit cleanly: {e}"),
                }
            }
        };
        if output.status.success() {
            let listing = if output.stderr.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(&output.stderr).into_owned())
            };
            CompileOutcome::Ok {
                bytecode: output.stdout,
                listing,
            }
        } else {
            let text = if output.stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).into_owned()
            } else {
                String::from_utf8_lossy(&output.stderr).into_owned()
            };
            CompileOutcome::Err { listing: text }
        }
    }
}

/// Fixed-size ring-buffer moving average of compiles-per-second, grounded
/// in `original_source/ShaderCompile/movingaverage.hpp`'s
/// `CUtlMovingAverage`.
pub struct MovingAverage {
    samples: Vec<f64>,
    next: usize,
    filled: usize,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        MovingAverage {
            samples: vec![0.0; capacity.max(1)],
            next: 0,
            filled: 0,
        }
    }

    pub fn push_value(&mut self, value: f64) {
        self.samples[self.next] = value;
        self.next = (self.next + 1) % self.samples.len();
        self.filled = (self.filled + 1).min(self.samples.len());
    }

    pub fn get_average(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.samples[..self.filled].iter().sum::<f64>() / self.filled as f64
    }

    pub fn reset(&mut self) {
        self.next = 0;
        self.filled = 0;
    }
}

/// Builds the CLI's compile flag bits from the individual negative/positive
/// switches documented in §6.3.
#[allow(clippy::too_many_arguments)]
pub fn flags_from_switches(
    partial_precision: bool,
    no_validation: bool,
    disable_preshader: bool,
    no_flow_control: bool,
    prefer_flow_control: bool,
    disable_optimization: bool,
) -> CompileFlags {
    let mut flags = CompileFlags::empty();
    flags.set(CompileFlags::PARTIAL_PRECISION, partial_precision);
    flags.set(CompileFlags::SKIP_VALIDATION, no_validation);
    flags.set(CompileFlags::NO_PRESHADER, disable_preshader);
    flags.set(CompileFlags::AVOID_FLOW_CONTROL, no_flow_control);
    flags.set(CompileFlags::PREFER_FLOW_CONTROL, prefer_flow_control);
    flags.set(CompileFlags::SKIP_OPTIMIZATION, disable_optimization);
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_one_section() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write(
            dir.path(),
            "shaders.txt",
            "#BEGIN my_shader\n\
             my_shader.fxc\n\
             #DEFINES-S\n\
             MODE = 0 .. 1\n\
             #DEFINES-D\n\
             QUALITY = 0 .. 2\n\
             #SKIP\n\
             0\n\
             #COMMAND\n\
             fxc.exe\n\
             -o out\n\
             #END\n",
        );
        let entries = parse_manifest(&manifest).unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.name, "my_shader");
        assert_eq!(e.source_file, PathBuf::from("my_shader.fxc"));
        assert_eq!(e.num_static, 2);
        assert_eq!(e.num_dynamic, 3);
        assert_eq!(e.command_prefix, "fxc.exe");
        assert_eq!(e.command_suffix, "-o out");
    }

    #[test]
    fn blank_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write(
            dir.path(),
            "shaders.txt",
            "\n#BEGIN a\n\na.fxc\n\n#DEFINES-S\n\nA = 0 .. 0\n\n#DEFINES-D\n\n#SKIP\n\n0\n\n#COMMAND\n\np\ns\n\n#END\n\n",
        );
        let entries = parse_manifest(&manifest).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].num_static, 1);
        assert_eq!(entries[0].num_dynamic, 1);
    }

    #[test]
    fn duplicate_begin_name_is_silently_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write(
            dir.path(),
            "shaders.txt",
            "#BEGIN a\n\
             a.fxc\n\
             #DEFINES-S\n\
             X = 0 .. 0\n\
             #DEFINES-D\n\
             #SKIP\n\
             0\n\
             #COMMAND\n\
             p\n\
             s\n\
             #END\n\
             #BEGIN a\n\
             second.fxc\n\
             #DEFINES-S\n\
             #DEFINES-D\n\
             #SKIP\n\
             0\n\
             #COMMAND\n\
             p2\n\
             s2\n\
             #END\n\
             #BEGIN b\n\
             b.fxc\n\
             #DEFINES-S\n\
             #DEFINES-D\n\
             #SKIP\n\
             0\n\
             #COMMAND\n\
             p3\n\
             s3\n\
             #END\n",
        );
        let entries = parse_manifest(&manifest).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(entries[0].source_file, PathBuf::from("a.fxc"));
    }

    #[test]
    fn include_manifest_parses_one_path_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write(dir.path(), "uniquefilestocopy.txt", "a.h\n\nb.h\n");
        let paths = parse_include_manifest(&manifest).unwrap();
        assert_eq!(paths, vec![PathBuf::from("a.h"), PathBuf::from("b.h")]);
    }

    #[test]
    fn moving_average_tracks_recent_samples() {
        let mut avg = MovingAverage::new(3);
        avg.push_value(10.0);
        avg.push_value(20.0);
        avg.push_value(30.0);
        assert_eq!(avg.get_average(), 20.0);
        avg.push_value(60.0);
        // oldest sample (10.0) rolled off
        assert_eq!(avg.get_average(), (20.0 + 30.0 + 60.0) / 3.0);
    }

    #[test]
    fn flags_from_switches_sets_independent_bits() {
        let flags = flags_from_switches(true, false, false, true, false, false);
        assert!(flags.contains(CompileFlags::PARTIAL_PRECISION));
        assert!(flags.contains(CompileFlags::AVOID_FLOW_CONTROL));
        assert!(!flags.contains(CompileFlags::SKIP_VALIDATION));
    }
}
