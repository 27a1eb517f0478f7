//! Build configuration
//!
//! Settings feeding the external C toolchain. Precedence, strongest first:
//! command-line flags, then the `CC`/`CFLAGS` environment, then the
//! project's `nelua.toml`, then built-in defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Well-known configuration file name at the project root
pub const CONFIG_FILE: &str = "nelua.toml";

/// Contents of `nelua.toml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub cc: Option<String>,
    pub cflags: Option<String>,
    pub cache_dir: Option<String>,
}

impl FileConfig {
    /// Load the config file from a project root, if present
    pub fn load(project_root: &Path) -> Self {
        let path = project_root.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }
}

/// Optimization profile selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Debug,
    Release,
    MaximumPerformance,
}

impl Profile {
    pub fn cflags(self) -> &'static str {
        match self {
            Profile::Debug => "-O0 -g",
            Profile::Release => "-O2",
            Profile::MaximumPerformance => "-O3 -ffast-math -march=native",
        }
    }
}

/// Output kind requested on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkKind {
    #[default]
    Executable,
    Shared,
    Static,
}

/// Fully resolved build configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub cc: String,
    pub cflags: String,
    pub cache_dir: PathBuf,
    pub profile: Profile,
    pub link: LinkKind,
    pub no_cache: bool,
    pub verbose: bool,
}

impl Config {
    /// Resolve the configuration for one compilation
    pub fn resolve(
        project_root: &Path,
        cli_cc: Option<String>,
        cli_cflags: Option<String>,
        profile: Profile,
        link: LinkKind,
        no_cache: bool,
        verbose: bool,
    ) -> Self {
        let file = FileConfig::load(project_root);
        let cc = cli_cc
            .or_else(|| std::env::var("CC").ok().filter(|s| !s.is_empty()))
            .or(file.cc)
            .unwrap_or_else(|| "cc".to_string());
        let mut cflags = cli_cflags
            .or_else(|| std::env::var("CFLAGS").ok().filter(|s| !s.is_empty()))
            .or(file.cflags)
            .unwrap_or_default();
        if !cflags.is_empty() {
            cflags.push(' ');
        }
        cflags.push_str(profile.cflags());
        let cache_dir = file
            .cache_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| project_root.join(".nelua_cache"));
        Self {
            cc,
            cflags,
            cache_dir,
            profile,
            link,
            no_cache,
            verbose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let dir = std::env::temp_dir().join("nelua_cfg_test_none");
        let _ = std::fs::create_dir_all(&dir);
        std::env::remove_var("CC");
        std::env::remove_var("CFLAGS");
        let cfg = Config::resolve(&dir, None, None, Profile::Debug, LinkKind::Executable, false, false);
        assert_eq!(cfg.cc, "cc");
        assert!(cfg.cflags.contains("-O0"));
    }

    #[test]
    fn test_flags_beat_file_and_env() {
        let dir = std::env::temp_dir().join("nelua_cfg_test_prec");
        let _ = std::fs::create_dir_all(&dir);
        std::fs::write(dir.join(CONFIG_FILE), "cc = \"file-cc\"\n").unwrap();
        let cfg = Config::resolve(
            &dir,
            Some("flag-cc".to_string()),
            None,
            Profile::Release,
            LinkKind::Executable,
            false,
            false,
        );
        assert_eq!(cfg.cc, "flag-cc");
        assert!(cfg.cflags.contains("-O2"));
    }

    #[test]
    fn test_file_config_parsed() {
        let dir = std::env::temp_dir().join("nelua_cfg_test_file");
        let _ = std::fs::create_dir_all(&dir);
        std::fs::write(
            dir.join(CONFIG_FILE),
            "cc = \"clang\"\ncflags = \"-Wall\"\n",
        )
        .unwrap();
        let file = FileConfig::load(&dir);
        assert_eq!(file.cc.as_deref(), Some("clang"));
        assert_eq!(file.cflags.as_deref(), Some("-Wall"));
    }
}
