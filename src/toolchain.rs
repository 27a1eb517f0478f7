//! External C toolchain driver
//!
//! Hands the emitted C file to the configured C compiler and reports the
//! produced artifact. The generated C carries a one-line hash of
//! (source, compiler signature, flags) in its header; when an existing
//! output matches that hash the artifact is reused instead of re-invoking
//! the toolchain.

use crate::config::{Config, LinkKind};
use crate::errors::{CompileError, CompileResult};
use std::path::{Path, PathBuf};
use std::process::Command;

/// The produced output of a toolchain invocation
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub path: PathBuf,
    pub executable: bool,
}

/// FNV-1a hash of the inputs that affect the produced binary
pub fn cache_hash(source: &str, compiler_signature: &str, flags: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for part in [source, "\0", compiler_signature, "\0", flags] {
        for byte in part.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
    }
    format!("{:016x}", hash)
}

/// Identify the configured compiler (first line of `--version`, falling
/// back to the command name)
pub fn compiler_signature(cc: &str) -> String {
    Command::new(cc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| {
            let text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.lines().next().map(str::to_string)
        })
        .unwrap_or_else(|| cc.to_string())
}

/// Whether a previously generated C file carries the same cache hash
pub fn cache_valid(cfile: &Path, hash: &str) -> bool {
    match std::fs::read_to_string(cfile) {
        Ok(text) => text
            .lines()
            .next()
            .map_or(false, |line| line.contains(&format!("cache:{}", hash))),
        Err(_) => false,
    }
}

/// Invoke the external C compiler on a generated C file
pub fn compile(config: &Config, c_path: &Path, out_path: &Path) -> CompileResult<BuildArtifact> {
    let mut cmd = Command::new(&config.cc);
    match config.link {
        LinkKind::Executable => {}
        LinkKind::Shared => {
            cmd.arg("-shared").arg("-fPIC");
        }
        LinkKind::Static => {
            cmd.arg("-c");
        }
    }
    cmd.arg(c_path);
    for flag in config.cflags.split_whitespace() {
        cmd.arg(flag);
    }
    cmd.arg("-o").arg(out_path);

    if config.verbose {
        eprintln!("toolchain: {:?}", cmd);
    }

    let output = cmd
        .output()
        .map_err(|e| CompileError::toolchain(format!("failed to run `{}`: {}", config.cc, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CompileError::toolchain(format!(
            "`{}` exited with {}:\n{}",
            config.cc,
            output.status,
            stderr.trim_end()
        )));
    }
    Ok(BuildArtifact {
        path: out_path.to_path_buf(),
        executable: config.link == LinkKind::Executable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hash_is_stable_and_sensitive() {
        let a = cache_hash("return 1", "cc 1.0", "-O2");
        let b = cache_hash("return 1", "cc 1.0", "-O2");
        assert_eq!(a, b);
        assert_ne!(a, cache_hash("return 2", "cc 1.0", "-O2"));
        assert_ne!(a, cache_hash("return 1", "cc 2.0", "-O2"));
        assert_ne!(a, cache_hash("return 1", "cc 1.0", "-O3"));
    }

    #[test]
    fn test_cache_valid_reads_header() {
        let dir = std::env::temp_dir().join("nelua_toolchain_test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("cached.c");
        std::fs::write(&path, "/* generated by nelua 0.1.0 cache:abc123 */\n").unwrap();
        assert!(cache_valid(&path, "abc123"));
        assert!(!cache_valid(&path, "ffffff"));
        assert!(!cache_valid(&dir.join("missing.c"), "abc123"));
    }
}
