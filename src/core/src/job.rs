//! Isolated patching runs.

pub mod executor;
pub mod script;

use crate::runtime::RuntimeEnvironment;
use crate::shell::RootShell;
use anyhow::{Result, bail};
use jarforge_utils::ext::ResultExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub const RUN_SCRIPT: &str = "run.sh";
pub const EXTRAS_MANIFEST: &str = "module_extras.conf";

/// Logical role name -> absolute path of the staged input copy.
pub type InputFileSet = BTreeMap<String, PathBuf>;

/// One isolated execution of the patching pipeline, identified by its
/// creation timestamp. Never reused; deleted best-effort when the run ends.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub dir: PathBuf,
}

impl Job {
    pub async fn create(shell: &RootShell, env: &RuntimeEnvironment) -> Result<Self> {
        let id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis().to_string())
            .unwrap_or_else(|_| "0".into());
        let dir = env.jobs_root().join(&id);

        let res = shell
            .exec(&format!(
                "mkdir -p \"{dir}/input\" \"{dir}/work\" \"{dir}/output\" && chmod -R 755 \"{dir}\"",
                dir = dir.display()
            ))
            .await?;
        if !res.success() {
            bail!("failed to create job directory: {}", res.err_joined());
        }

        Ok(Self { id, dir })
    }

    pub fn input_dir(&self) -> PathBuf {
        self.dir.join("input")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.join("work")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.join("output")
    }

    pub fn run_script(&self) -> PathBuf {
        self.dir.join(RUN_SCRIPT)
    }

    pub fn extras_manifest(&self) -> PathBuf {
        self.output_dir().join(EXTRAS_MANIFEST)
    }

    pub async fn cleanup(&self, shell: &RootShell) {
        shell
            .rm_rf(&self.dir)
            .await
            .log_if_error("failed to remove job directory");
    }
}
