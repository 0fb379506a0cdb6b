//! The local patching pipeline, end to end.
//!
//! Install toolkit, deploy features, stage inputs into a fresh job,
//! generate and execute run.sh, collect the patched jars, assemble the
//! flashable module. Job and feature runtime directories are removed on
//! every exit path; the generated module is the only artifact that
//! survives a run.

use crate::android::inspect::{self, RECOGNIZED_ROLES};
use crate::features::FeatureRegistry;
use crate::job::{InputFileSet, Job, executor, script};
use crate::module::{Assembler, GeneratedModule, ModuleInfo};
use crate::runtime::RuntimeEnvironment;
use crate::shell::RootShell;
use crate::state::{LogTag, PatchingState, ProgressSink};
use crate::toolkit::Installer;
use anyhow::{Context, Result, anyhow, bail};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// No usable input files for the selected features. Distinguished so the
/// frontend can tell the user what to provide instead of showing a
/// pipeline failure.
#[derive(Debug)]
pub struct MissingInputs(pub Vec<String>);

impl fmt::Display for MissingInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "missing input files: {}", self.0.join(", "))
    }
}

impl std::error::Error for MissingInputs {}

pub struct Orchestrator<'a> {
    shell: &'a RootShell,
    env: &'a RuntimeEnvironment,
}

impl<'a> Orchestrator<'a> {
    pub fn new(shell: &'a RootShell, env: &'a RuntimeEnvironment) -> Self {
        Self { shell, env }
    }

    /// Maps each requested role to its jar on the live system. Roles whose
    /// jar cannot be found are reported through [`MissingInputs`].
    pub async fn resolve_system_inputs(&self, roles: &[String]) -> Result<InputFileSet> {
        let mut inputs = InputFileSet::new();
        let mut missing = Vec::new();

        for role in roles {
            match inspect::system_path_for_role(self.shell, role).await {
                Some(path) if self.shell.file_exists(Path::new(&path)).await => {
                    inputs.insert(role.clone(), path.into());
                }
                _ => missing.push(role.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(anyhow!(MissingInputs(missing)));
        }
        Ok(inputs)
    }

    pub async fn run_local_patch(
        &self,
        inputs: &InputFileSet,
        enabled: &[String],
        sink: &Arc<dyn ProgressSink>,
    ) -> Result<GeneratedModule> {
        let result = self.run_inner(inputs, enabled, sink).await;

        if let Err(err) = &result {
            sink.line(LogTag::Error, &format!("{err:#}"));
            sink.state(PatchingState::Failed);
        }
        result
    }

    async fn run_inner(
        &self,
        inputs: &InputFileSet,
        enabled: &[String],
        sink: &Arc<dyn ProgressSink>,
    ) -> Result<GeneratedModule> {
        if inputs.is_empty() {
            return Err(anyhow!(MissingInputs(
                enabled.iter().map(|id| format!("inputs for {id}")).collect()
            )));
        }

        sink.state(PatchingState::InstallingToolkit);
        let installer = Installer::new(self.shell, self.env);
        if !installer
            .install_if_needed(&|msg| sink.line(LogTag::Setup, msg))
            .await?
        {
            bail!("toolkit installation failed");
        }

        let info = inspect::device_info(self.shell).await;

        sink.state(PatchingState::PreparingFeatures);
        let registry = FeatureRegistry::new(self.shell, self.env);
        let features = registry.enabled_scripts(enabled).await?;
        if features.is_empty() {
            registry.cleanup().await;
            bail!("no features matched: {}", enabled.join(", "));
        }
        for feature in &features {
            sink.line(LogTag::Setup, &format!("feature ready: {}", feature.name));
        }

        sink.state(PatchingState::PreparingFiles);
        let job = Job::create(self.shell, self.env)
            .await
            .context("failed to create job")?;

        let run = self.run_job(&job, inputs, &features, &info, sink).await;

        job.cleanup(self.shell).await;
        registry.cleanup().await;

        let module = run?;
        sink.state(PatchingState::Completed);
        Ok(module)
    }

    async fn run_job(
        &self,
        job: &Job,
        inputs: &InputFileSet,
        features: &[crate::features::PatchFeature],
        info: &inspect::DeviceInfo,
        sink: &Arc<dyn ProgressSink>,
    ) -> Result<GeneratedModule> {
        let mut staged = InputFileSet::new();
        for (role, source) in inputs {
            let dest = job.input_dir().join(role);
            sink.line(LogTag::Setup, &format!("staging {role}"));
            self.shell
                .copy(source, &dest)
                .await
                .with_context(|| format!("failed to stage {role}"))?;
            self.shell.chmod("644", &dest).await?;
            staged.insert(role.clone(), dest);
        }

        sink.state(PatchingState::GeneratingScript);
        let params = script::ScriptParams {
            job,
            inputs: &staged,
            features,
            api_level: info.api_level,
            device_codename: &info.device_codename,
        };
        script::generate(self.shell, self.env, &params)
            .await
            .context("failed to generate run script")?;

        sink.state(PatchingState::Patching);
        let stream = Arc::clone(sink);
        let code = executor::run(
            self.shell,
            self.env,
            job,
            Arc::new(move |line| stream.line(LogTag::Patch, line)),
        )
        .await?;
        if code != 0 {
            bail!("patch script failed with exit code {code}");
        }

        sink.state(PatchingState::CollectingOutput);
        let mut patched = InputFileSet::new();
        for role in RECOGNIZED_ROLES {
            if !staged.contains_key(role) {
                continue;
            }
            let output = job.output_dir().join(role);
            if self.shell.file_exists(&output).await {
                sink.line(LogTag::Patch, &format!("collected {role}"));
                patched.insert(role.to_owned(), output);
            } else if let Some(staged_copy) = staged.get(role) {
                // the script copies every tracked jar out, so this only
                // happens when it died early
                sink.line(
                    LogTag::Patch,
                    &format!("no output for {role}, using staged input copy"),
                );
                patched.insert(role.to_owned(), staged_copy.clone());
            }
        }
        if patched.is_empty() {
            bail!("patching produced no output files");
        }

        sink.state(PatchingState::CreatingModule);
        let manifest = job.extras_manifest();
        let manifest = self
            .shell
            .file_exists(&manifest)
            .await
            .then_some(manifest);

        let assembler = Assembler::new(self.shell, self.env);
        assembler
            .generate(&patched, &module_info(info), manifest.as_deref(), &|msg| {
                sink.line(LogTag::Module, msg)
            })
            .await
    }
}

fn module_info(info: &inspect::DeviceInfo) -> ModuleInfo {
    ModuleInfo {
        device_codename: info.device_codename.clone(),
        android_version: info.android_version.clone(),
        api_level: info.api_level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RecordingSink;
    use std::fs;
    use std::io::Read;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_executable(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn prepare_workspace(env: &RuntimeEnvironment, shell: &RootShell) {
        // toolkit bundle with a stub busybox so the installer succeeds
        let arch_dir = env.assets.join("toolkit/META-INF/zbin/arch/arm64-v8a");
        write_executable(&arch_dir.join("busybox"), "#!/bin/sh\nexit 0\n");
        fs::write(env.assets.join("toolkit/META-INF/zbin/core"), "# core\n").unwrap();

        let installer = Installer::new(shell, env);
        assert!(installer.install_if_needed(&|_msg: &str| {}).await.unwrap());

        // the stub bundle carries no real interpreter; stand one in
        write_executable(&env.toolkit_bash(), "#!/bin/sh\nexec /bin/sh \"$@\"\n");

        // minimal module template
        let template = env.module_template();
        fs::create_dir_all(&template).unwrap();
        fs::write(template.join("module.prop"), "id=placeholder\n").unwrap();
        fs::write(template.join("system.prop"), "").unwrap();
        fs::write(template.join("customize.sh"), "#!/system/bin/sh\n").unwrap();
    }

    #[tokio::test]
    async fn full_pipeline_produces_a_flashable_module() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let shell = RootShell::direct();
        prepare_workspace(&env, &shell).await;

        fs::create_dir_all(env.builtin_features()).unwrap();
        fs::write(
            env.builtin_features().join("append_marker.sh"),
            "#!/bin/sh\n\
             #@name Append Marker\n\
             #@requires framework.jar\n\
             echo PATCHED >> \"$FRAMEWORK_JAR\"\n",
        )
        .unwrap();

        let input_jar = base.path().join("framework.jar");
        fs::write(&input_jar, "original-jar-bytes\n").unwrap();

        let mut inputs = InputFileSet::new();
        inputs.insert("framework.jar".into(), input_jar);

        let sink = Arc::new(RecordingSink::default());
        let progress: Arc<dyn ProgressSink> = Arc::clone(&sink) as _;
        let orchestrator = Orchestrator::new(&shell, &env);
        let module = orchestrator
            .run_local_patch(&inputs, &["append_marker".to_owned()], &progress)
            .await
            .unwrap();

        assert!(module.path.exists());
        assert_eq!(module.module_id, "jarforge_patched");

        let file = fs::File::open(&module.path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();

        let mut prop = String::new();
        archive
            .by_name("module.prop")
            .unwrap()
            .read_to_string(&mut prop)
            .unwrap();
        assert!(prop.contains("id=jarforge_patched"));
        assert!(prop.contains("requireReboot=true"));

        let mut jar = Vec::new();
        archive
            .by_name("system/framework/framework.jar")
            .unwrap()
            .read_to_end(&mut jar)
            .unwrap();
        let jar = String::from_utf8(jar).unwrap();
        assert!(jar.contains("original-jar-bytes"));
        assert!(jar.contains("PATCHED"), "feature edit must reach the module");

        // no OEM-variant role was supplied, so no system_ext entries
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_owned())
            .collect();
        assert!(!names.iter().any(|name| name.starts_with("system/system_ext/")));

        let states = sink.states.lock().unwrap();
        assert_eq!(states.last(), Some(&PatchingState::Completed));
        assert!(states.contains(&PatchingState::Patching));

        // per-job state is gone, only the module remains
        assert!(!env.jobs_root().exists() || fs::read_dir(env.jobs_root()).unwrap().next().is_none());
        assert!(!env.features_runtime().exists());
    }

    #[tokio::test]
    async fn unmatched_feature_selection_fails_cleanly() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let shell = RootShell::direct();
        prepare_workspace(&env, &shell).await;

        let input_jar = base.path().join("framework.jar");
        fs::write(&input_jar, "bytes\n").unwrap();
        let mut inputs = InputFileSet::new();
        inputs.insert("framework.jar".into(), input_jar);

        let sink = Arc::new(RecordingSink::default());
        let progress: Arc<dyn ProgressSink> = Arc::clone(&sink) as _;
        let orchestrator = Orchestrator::new(&shell, &env);
        let err = orchestrator
            .run_local_patch(&inputs, &["does_not_exist".to_owned()], &progress)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("no features matched"));
        assert_eq!(
            sink.states.lock().unwrap().last(),
            Some(&PatchingState::Failed)
        );
        assert!(!env.features_runtime().exists());
    }

    #[tokio::test]
    async fn empty_input_set_is_reported_as_missing_inputs() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let shell = RootShell::direct();

        let sink = Arc::new(RecordingSink::default());
        let progress: Arc<dyn ProgressSink> = Arc::clone(&sink) as _;
        let orchestrator = Orchestrator::new(&shell, &env);
        let err = orchestrator
            .run_local_patch(&InputFileSet::new(), &["anything".to_owned()], &progress)
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<MissingInputs>().is_some());
    }
}
