//! Kernel spec discovery.
//!
//! A spec is a `kernel.json` under `<dir>/kernels/<name>/`. Directories are
//! searched in order: configured `kernel_dirs`, each entry of `JUPYTER_PATH`,
//! `~/.local/share/jupyter`, `/usr/local/share/jupyter`, `/usr/share/jupyter`.
//!
//! `spyder-kernel` always resolves: when no file defines it, it is derived
//! from the `python3` spec (or a bare `python -m ipykernel_launcher` command)
//! by swapping the `ipykernel_launcher` module for `spyder_kernels.console`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const SPYDER_KERNEL_NAME: &str = "spyder-kernel";
const IPYKERNEL_MODULE: &str = "ipykernel_launcher";
const SPYDER_KERNEL_MODULE: &str = "spyder_kernels.console";

/// Parsed `kernel.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub argv: Vec<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Directory the spec was loaded from; absent for derived specs.
    #[serde(skip)]
    pub resource_dir: Option<PathBuf>,
}

impl KernelSpec {
    /// Expand `{connection_file}` and `{resource_dir}` placeholders.
    pub fn command(&self, connection_file: &Path) -> Vec<String> {
        let conn = connection_file.to_string_lossy();
        let res = self
            .resource_dir
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.argv
            .iter()
            .map(|a| a.replace("{connection_file}", &conn).replace("{resource_dir}", &res))
            .collect()
    }

    fn ipykernel(python: &str) -> Self {
        Self {
            argv: [python, "-m", IPYKERNEL_MODULE, "-f", "{connection_file}"]
                .map(String::from)
                .to_vec(),
            display_name: "Python 3".to_string(),
            language: "python".to_string(),
            env: HashMap::new(),
            resource_dir: None,
        }
    }

    /// The Spyder kernel derived from an ipykernel spec. Arguments other than
    /// the launcher module are kept as they are.
    pub fn to_spyder(&self) -> Self {
        let argv = self
            .argv
            .iter()
            .map(|a| {
                if a == IPYKERNEL_MODULE {
                    SPYDER_KERNEL_MODULE.to_string()
                } else {
                    a.clone()
                }
            })
            .collect();
        Self {
            argv,
            display_name: "Spyder kernel".to_string(),
            ..self.clone()
        }
    }
}

/// Where to look for kernel specs.
#[derive(Debug, Clone)]
pub struct SpecSearch {
    pub dirs: Vec<PathBuf>,
    pub python: String,
}

impl SpecSearch {
    /// Standard search path with `extra` directories first.
    pub fn new(extra: &[String], python: &str) -> Self {
        let mut dirs: Vec<PathBuf> = extra.iter().map(PathBuf::from).collect();
        if let Ok(jp) = std::env::var("JUPYTER_PATH") {
            dirs.extend(jp.split(':').filter(|s| !s.is_empty()).map(PathBuf::from));
        }
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(Path::new(&home).join(".local/share/jupyter"));
        }
        dirs.push(PathBuf::from("/usr/local/share/jupyter"));
        dirs.push(PathBuf::from("/usr/share/jupyter"));
        Self {
            dirs,
            python: python.to_string(),
        }
    }

    /// Find a spec by name. `None` means the name is unknown.
    pub fn find(&self, name: &str) -> Option<KernelSpec> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return None;
        }
        if let Some(spec) = self.load_from_dirs(name) {
            return Some(spec);
        }
        if name == SPYDER_KERNEL_NAME {
            let base = self
                .load_from_dirs("python3")
                .unwrap_or_else(|| KernelSpec::ipykernel(&self.python));
            return Some(base.to_spyder());
        }
        None
    }

    /// All resolvable specs by name, including the built-in Spyder kernel.
    pub fn list(&self) -> BTreeMap<String, KernelSpec> {
        let mut out = BTreeMap::new();
        for dir in &self.dirs {
            let Ok(entries) = std::fs::read_dir(dir.join("kernels")) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if out.contains_key(&name) {
                    continue;
                }
                if let Some(spec) = load_spec(&entry.path()) {
                    out.insert(name, spec);
                }
            }
        }
        if !out.contains_key(SPYDER_KERNEL_NAME) {
            if let Some(spec) = self.find(SPYDER_KERNEL_NAME) {
                out.insert(SPYDER_KERNEL_NAME.to_string(), spec);
            }
        }
        out
    }

    fn load_from_dirs(&self, name: &str) -> Option<KernelSpec> {
        self.dirs
            .iter()
            .find_map(|d| load_spec(&d.join("kernels").join(name)))
    }
}

fn load_spec(dir: &Path) -> Option<KernelSpec> {
    let raw = std::fs::read(dir.join("kernel.json")).ok()?;
    match serde_json::from_slice::<KernelSpec>(&raw) {
        Ok(mut spec) if !spec.argv.is_empty() => {
            spec.resource_dir = Some(dir.to_path_buf());
            Some(spec)
        }
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Ignoring invalid kernel spec {}: {e}", dir.display());
            None
        }
    }
}
