//! Process-wide filesystem layout.
//!
//! Every fixed path the pipeline touches lives here and is passed down
//! explicitly, so tests can re-root the whole tree under a temp directory
//! instead of hitting the device paths.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RuntimeEnvironment {
    /// Toolkit install root; holds the bundle copy and the sentinel
    /// `environment` descriptor.
    pub toolkit_root: PathBuf,
    /// Toolkit scratch root; `core` and the extracted `bin/` live here.
    pub toolkit_tmp: PathBuf,
    /// Root-writable scratch for feature runtime, jobs and module staging.
    pub scratch: PathBuf,
    /// Persistent storage for the user and updated feature tiers.
    pub storage: PathBuf,
    /// App-private cache for staging files and generated modules.
    pub cache: PathBuf,
    /// Bundled assets: toolkit bundle, builtin features, module template.
    pub assets: PathBuf,
}

impl RuntimeEnvironment {
    pub fn device(assets: Option<PathBuf>) -> Self {
        Self {
            toolkit_root: "/data/local/di".into(),
            toolkit_tmp: "/data/tmp/di".into(),
            scratch: "/data/local/tmp/jarforge".into(),
            storage: "/data/adb/jarforge/storage".into(),
            cache: "/data/adb/jarforge/cache".into(),
            assets: assets.unwrap_or_else(|| "/data/adb/jarforge/assets".into()),
        }
    }

    /// Re-roots every location under `base`. Used by tests.
    pub fn rooted(base: &Path) -> Self {
        Self {
            toolkit_root: base.join("di"),
            toolkit_tmp: base.join("di_tmp"),
            scratch: base.join("scratch"),
            storage: base.join("storage"),
            cache: base.join("cache"),
            assets: base.join("assets"),
        }
    }

    pub fn toolkit_bin(&self) -> PathBuf {
        self.toolkit_tmp.join("bin")
    }

    pub fn toolkit_bundle(&self) -> PathBuf {
        self.toolkit_root.join("META-INF/zbin")
    }

    pub fn toolkit_bash(&self) -> PathBuf {
        self.toolkit_bin().join("bash")
    }

    pub fn toolkit_core(&self) -> PathBuf {
        self.toolkit_tmp.join("core")
    }

    /// Shell-sourceable descriptor recording the resolved toolkit paths.
    /// Doubles as the installation sentinel.
    pub fn environment_file(&self) -> PathBuf {
        self.toolkit_root.join("environment")
    }

    pub fn features_runtime(&self) -> PathBuf {
        self.scratch.join("features")
    }

    pub fn builtin_runtime(&self) -> PathBuf {
        self.features_runtime().join("builtin")
    }

    pub fn user_runtime(&self) -> PathBuf {
        self.features_runtime().join("user")
    }

    pub fn jobs_root(&self) -> PathBuf {
        self.scratch.join("jobs")
    }

    pub fn builtin_features(&self) -> PathBuf {
        self.assets.join("features")
    }

    pub fn updated_features(&self) -> PathBuf {
        self.storage.join("features_updated")
    }

    pub fn user_features(&self) -> PathBuf {
        self.storage.join("features_user")
    }

    pub fn module_template(&self) -> PathBuf {
        self.assets.join("module_template")
    }
}
