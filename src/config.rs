//! Service descriptors.
//!
//! Every managed service is described by a `devwatch.yaml` file in its root
//! directory. The file is parsed once at startup into an immutable
//! [`Descriptor`] that is shared by reference across all states of the
//! service's supervisor.
//!
//! ```yaml
//! dependencies:
//!   - members
//! run: ["./scripts/dev.sh"]
//! env:
//!   PORT: "4000"
//! protos:
//!   - members.proto
//! status_port: 4001
//! ```

use crate::error::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name of the per-service configuration file.
pub const CONFIG_FILE: &str = "devwatch.yaml";

/// Directory (under the service root) that generated protobuf code lands in.
pub const PROTO_OUTPUT_DIR: &str = "pb";

/// Directory (under the backend root) holding shared protobuf definitions.
pub const PROTOS_DIR: &str = "protos";

/// Directories that are never watched or walked for discovery.
const NOISE_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    ".devwatch",
    PROTO_OUTPUT_DIR,
];

/// On-disk shape of `devwatch.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    dependencies: Vec<String>,

    /// Explicit run command (argv). When absent the service is installed
    /// with `install` and the produced binary is run instead.
    #[serde(default)]
    run: Option<Vec<String>>,

    /// Install/build command (argv). Defaults to a cargo install into the
    /// service-local `.devwatch` root.
    #[serde(default)]
    install: Option<Vec<String>>,

    #[serde(default)]
    env: HashMap<String, String>,

    /// Protobuf files (relative to the shared protos directory) this service
    /// generates code from.
    #[serde(default)]
    protos: Vec<String>,

    /// Command (argv) that regenerates the service's schema artifacts.
    #[serde(default)]
    schema_command: Option<Vec<String>>,

    /// Local port the service's `/readiness` and `/liveness` endpoints
    /// listen on.
    status_port: u16,
}

/// The static, per-service record. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Unique service name, the name of its root folder.
    pub name: String,
    /// Root directory of the backend tree.
    pub root: PathBuf,
    /// This service's directory.
    pub dir: PathBuf,
    /// Folders to watch. Watches are non-recursive, so every nested folder
    /// is enumerated here explicitly (noise directories skipped).
    pub folders: Vec<PathBuf>,
    /// Names of services this one depends on, resolved lazily against the
    /// registry.
    pub dependencies: Vec<String>,
    /// Explicit run command, if any.
    pub run: Option<Vec<String>>,
    /// Install command used when no run command is configured.
    pub install: Vec<String>,
    /// Environment variable overrides for the managed process.
    pub env: HashMap<String, String>,
    /// Generation-input proto files, relative to the shared protos dir.
    pub protos: Vec<String>,
    /// Optional schema regeneration command.
    pub schema_command: Option<Vec<String>>,
    /// Port of the readiness/liveness endpoints.
    pub status_port: u16,
}

impl Descriptor {
    /// Load the descriptor for the service rooted at `dir`.
    ///
    /// Returns `Ok(None)` when the directory has no `devwatch.yaml`: the
    /// directory simply is not a service.
    pub fn load(root: &Path, dir: &Path) -> Result<Option<Descriptor>> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.is_file() {
            return Ok(None);
        }

        let raw: RawConfig = serde_yaml::from_str(&std::fs::read_to_string(&config_path)?)?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let install = raw.install.unwrap_or_else(|| {
            vec![
                "cargo".into(),
                "install".into(),
                "--path".into(),
                ".".into(),
                "--root".into(),
                ".devwatch".into(),
            ]
        });

        Ok(Some(Descriptor {
            name,
            root: root.to_path_buf(),
            dir: dir.to_path_buf(),
            folders: collect_folders(dir),
            dependencies: raw.dependencies,
            run: raw.run,
            install,
            env: raw.env,
            protos: raw.protos,
            schema_command: raw.schema_command,
            status_port: raw.status_port,
        }))
    }

    pub fn has_run_command(&self) -> bool {
        self.run.is_some()
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// The command actually executed in the Running state: the explicit run
    /// command, or the binary produced by the install step.
    pub fn run_command(&self) -> Vec<String> {
        match &self.run {
            Some(argv) => argv.clone(),
            None => vec![self
                .dir
                .join(".devwatch")
                .join("bin")
                .join(&self.name)
                .to_string_lossy()
                .into_owned()],
        }
    }

    /// Shared protos directory under the backend root.
    pub fn protos_dir(&self) -> PathBuf {
        self.root.join(PROTOS_DIR)
    }

    /// Absolute paths of the generation-input proto files.
    pub fn proto_inputs(&self) -> Vec<PathBuf> {
        let dir = self.protos_dir();
        self.protos.iter().map(|p| dir.join(p)).collect()
    }

    /// Directory generated protobuf code is written to.
    pub fn proto_output_dir(&self) -> PathBuf {
        self.dir.join(PROTO_OUTPUT_DIR)
    }
}

/// True for directories that never contain watchable sources.
pub fn is_noise_dir(name: &str) -> bool {
    NOISE_DIRS.contains(&name)
}

/// Enumerate `dir` and all nested folders, skipping noise directories.
///
/// Watch subscriptions are non-recursive, so the full folder list has to be
/// produced up front.
pub fn collect_folders(dir: &Path) -> Vec<PathBuf> {
    let mut folders = Vec::new();
    walk_folders(dir, &mut folders);
    folders
}

fn walk_folders(dir: &Path, out: &mut Vec<PathBuf>) {
    out.push(dir.to_path_buf());

    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if is_noise_dir(&name.to_string_lossy()) {
            continue;
        }
        walk_folders(&path, out);
    }
}
