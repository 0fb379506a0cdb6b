//! Flashable module assembly.
//!
//! Builds the Magisk/KernelSU/APatch directory layout in a root-owned work
//! directory, applies the extras manifest emitted by feature scripts, then
//! archives the tree: root-privileged `zip` when the device has one, an
//! in-process writer otherwise.

use crate::android::inspect::OEM_SERVICES_JAR;
use crate::runtime::RuntimeEnvironment;
use crate::shell::RootShell;
use anyhow::{Context, Result, bail};
use scopeguard::defer;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

pub const MODULE_ID: &str = "jarforge_patched";

/// One well-formed extras manifest record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleExtraEntry {
    pub kind: String,
    pub source: String,
    pub dest: String,
}

/// `type|source|dest`. Fewer than three fields is a malformed record; the
/// caller logs and skips it. Extra `|` separators end up in the dest field
/// being cut short, matching the line format's no-escaping rule.
pub fn parse_extra_line(line: &str) -> Option<ModuleExtraEntry> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 3 {
        return None;
    }
    Some(ModuleExtraEntry {
        kind: parts[0].to_owned(),
        source: parts[1].to_owned(),
        dest: parts[2].to_owned(),
    })
}

fn mode_for_kind(kind: &str) -> &'static str {
    match kind {
        "lib" => "755",
        _ => "644", // apk, xml, file and anything unknown
    }
}

/// Destinations always resolve under the module work directory: a leading
/// `/` is re-rooted there and parent traversal is rejected outright. The
/// manifest is written by root-trusted scripts, but a stray absolute dest
/// must not direct the root shell at the live system.
fn sanitize_extra_dest(dest: &str) -> Option<PathBuf> {
    let trimmed = dest.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }

    let path = Path::new(trimmed);
    if path
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }
    Some(path.to_owned())
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub device_codename: String,
    pub android_version: String,
    pub api_level: i32,
}

/// The produced archive. Immutable once written; the orchestrator may
/// relocate it afterwards.
#[derive(Debug, Clone)]
pub struct GeneratedModule {
    pub path: PathBuf,
    pub size: u64,
    pub device_codename: String,
    pub timestamp: String,
    pub module_id: &'static str,
}

pub struct Assembler<'a> {
    shell: &'a RootShell,
    env: &'a RuntimeEnvironment,
}

impl<'a> Assembler<'a> {
    pub fn new(shell: &'a RootShell, env: &'a RuntimeEnvironment) -> Self {
        Self { shell, env }
    }

    pub async fn generate(
        &self,
        patched_jars: &BTreeMap<String, PathBuf>,
        info: &ModuleInfo,
        extras_manifest: Option<&Path>,
        log: &(dyn Fn(&str) + Sync),
    ) -> Result<GeneratedModule> {
        let timestamp = self.timestamp().await;
        let module_name = format!("JarForge_{}_{timestamp}", info.device_codename);
        let work_dir = self.env.scratch.join(format!("module_{timestamp}"));
        let output_zip = self.env.cache.join(format!("{module_name}.zip"));
        fs::create_dir_all(&self.env.cache)?;

        let result = self
            .build(
                patched_jars,
                info,
                extras_manifest,
                &timestamp,
                &work_dir,
                &output_zip,
                log,
            )
            .await;

        // work dir removal happens on every exit path
        let _ = self.shell.rm_rf(&work_dir).await;

        result?;

        let size = fs::metadata(&output_zip).map(|meta| meta.len()).unwrap_or(0);
        if size == 0 {
            bail!("module archive was not created properly");
        }
        log(&format!("module created: {module_name}.zip ({} KB)", size / 1024));

        Ok(GeneratedModule {
            path: output_zip,
            size,
            device_codename: info.device_codename.clone(),
            timestamp,
            module_id: MODULE_ID,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn build(
        &self,
        patched_jars: &BTreeMap<String, PathBuf>,
        info: &ModuleInfo,
        extras_manifest: Option<&Path>,
        timestamp: &str,
        work_dir: &Path,
        output_zip: &Path,
        log: &(dyn Fn(&str) + Sync),
    ) -> Result<()> {
        log("creating module directory...");
        self.shell.rm_rf(work_dir).await?;
        self.shell.mkdir_p(work_dir).await?;

        log("copying template files...");
        self.copy_template(work_dir).await?;

        log("updating module.prop...");
        self.shell
            .write_via_shell(
                &render_module_prop(info, timestamp),
                &work_dir.join("module.prop"),
                "644",
            )
            .await?;

        log("placing patched files...");
        let framework_dir = work_dir.join("system/framework");
        self.shell.mkdir_p(&framework_dir).await?;

        for (role, jar) in patched_jars {
            let dest = if role == OEM_SERVICES_JAR {
                let ext_dir = work_dir.join("system/system_ext/framework");
                self.shell.mkdir_p(&ext_dir).await?;
                ext_dir.join(role)
            } else {
                framework_dir.join(role)
            };

            log(&format!("adding {role} to module..."));
            self.shell
                .copy(jar, &dest)
                .await
                .with_context(|| format!("failed to copy {role}"))?;
            self.shell.chmod("644", &dest).await?;
        }

        if let Some(manifest) = extras_manifest {
            // existence checked through the shell, the manifest lives in a
            // root-owned job directory
            if self.shell.file_exists(manifest).await {
                log("processing module extras...");
                self.apply_extras(manifest, work_dir, log).await;
            }
        }

        log("creating module archive...");
        self.archive(work_dir, output_zip, log).await
    }

    /// Copies the bundled template tree, skipping version-control entries,
    /// then normalizes permissions.
    async fn copy_template(&self, work_dir: &Path) -> Result<()> {
        let template = self.env.module_template();

        for entry in WalkDir::new(&template).min_depth(1) {
            let entry = entry?;
            let rel = entry.path().strip_prefix(&template)?;
            if rel
                .components()
                .any(|component| component.as_os_str().to_string_lossy().starts_with(".git"))
            {
                continue;
            }

            let dest = work_dir.join(rel);
            if entry.file_type().is_dir() {
                self.shell.mkdir_p(&dest).await?;
            } else {
                self.shell.copy(entry.path(), &dest).await?;
            }
        }

        let res = self
            .shell
            .exec(&format!(
                "chmod -R 755 \"{work}\" && chmod 644 \"{work}/module.prop\" \"{work}/system.prop\"",
                work = work_dir.display()
            ))
            .await?;
        if !res.success() {
            log::warn!("template permission normalization failed: {}", res.err_joined());
        }
        Ok(())
    }

    /// Applies the extras manifest. Malformed lines and failed copies are
    /// logged and skipped; they never abort assembly.
    pub(crate) async fn apply_extras(
        &self,
        manifest: &Path,
        work_dir: &Path,
        log: &(dyn Fn(&str) + Sync),
    ) {
        let Ok(content) = self.shell.read_to_string(manifest).await else {
            log("could not read module extras manifest");
            return;
        };

        let lines: Vec<&str> = content.lines().filter(|line| !line.trim().is_empty()).collect();
        if lines.is_empty() {
            log("no module extras to process");
            return;
        }
        log(&format!("found {} module extra(s)", lines.len()));

        for line in lines {
            let Some(entry) = parse_extra_line(line) else {
                log(&format!("invalid extras line: {line}"));
                continue;
            };

            // props are appended to the install-time property file, never
            // copied into the tree
            if entry.kind == "props" {
                let system_prop = work_dir.join("system.prop");
                let res = self
                    .shell
                    .exec(&format!(
                        "cat \"{}\" >> \"{}\"",
                        entry.source,
                        system_prop.display()
                    ))
                    .await;
                match res {
                    Ok(res) if res.success() => log("appended props to system.prop"),
                    Ok(res) => log(&format!("failed to append props: {}", res.err_joined())),
                    Err(err) => log(&format!("failed to append props: {err}")),
                }
                continue;
            }

            let Some(relative_dest) = sanitize_extra_dest(&entry.dest) else {
                log(&format!("unsafe extras destination, skipped: {}", entry.dest));
                continue;
            };

            let dest = work_dir.join(relative_dest);
            let copy = async {
                if let Some(parent) = dest.parent() {
                    self.shell.mkdir_p(parent).await?;
                }
                self.shell.copy(Path::new(&entry.source), &dest).await?;
                self.shell.chmod(mode_for_kind(&entry.kind), &dest).await
            }
            .await;

            match copy {
                Ok(()) => log(&format!("added {}: {}", entry.kind, entry.dest)),
                Err(err) => log(&format!("failed to add {}: {err}", entry.dest)),
            }
        }
    }

    async fn archive(
        &self,
        work_dir: &Path,
        output_zip: &Path,
        log: &(dyn Fn(&str) + Sync),
    ) -> Result<()> {
        let staging_zip = self.env.scratch.join(
            output_zip
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "module.zip".into()),
        );
        self.shell.mkdir_p(&self.env.scratch).await?;
        let _ = self
            .shell
            .exec(&format!("rm -f \"{}\"", staging_zip.display()))
            .await;

        let which = self.shell.exec("which zip").await?;
        let zip_bin = which
            .out
            .first()
            .map(|line| line.trim().to_owned())
            .filter(|line| !line.is_empty());

        if let Some(zip_bin) = zip_bin {
            log(&format!("found zip at: {zip_bin}"));
            let res = self
                .shell
                .exec(&format!(
                    "cd \"{}\" && \"{zip_bin}\" -r \"{}\" .",
                    work_dir.display(),
                    staging_zip.display()
                ))
                .await?;

            if res.success() {
                let copied = self.shell.copy(&staging_zip, output_zip).await;
                let _ = self
                    .shell
                    .exec(&format!("rm -f \"{}\"", staging_zip.display()))
                    .await;

                if copied.is_ok()
                    && fs::metadata(output_zip).map(|meta| meta.len() > 0).unwrap_or(false)
                {
                    log("archive created with shell zip");
                    return Ok(());
                }
            }
            log("shell zip failed, using built-in writer...");
        } else {
            log("no zip binary found, using built-in writer...");
        }

        // stage the root-owned tree somewhere the process can read
        let staging = self.env.cache.join("module_work");
        let _ = fs::remove_dir_all(&staging);
        fs::create_dir_all(&staging)?;
        defer! {
            let _ = fs::remove_dir_all(&staging);
        }

        let res = self
            .shell
            .exec(&format!(
                "cp -r \"{work}/.\" \"{staging}/\" && chmod -R a+rX,u+w \"{staging}\"",
                work = work_dir.display(),
                staging = staging.display()
            ))
            .await?;
        if !res.success() {
            bail!("failed to stage module tree: {}", res.err_joined());
        }

        write_zip(&staging, output_zip)?;
        log("archive created with built-in writer");
        Ok(())
    }

    async fn timestamp(&self) -> String {
        if let Ok(res) = self.shell.exec("date +%Y%m%d_%H%M%S").await
            && res.success()
            && let Some(ts) = res.out.first()
            && !ts.trim().is_empty()
        {
            return ts.trim().to_owned();
        }

        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs().to_string())
            .unwrap_or_else(|_| "0".into())
    }
}

/// Builds the archive entry-by-entry, entry names relative to `root`.
pub fn write_zip(root: &Path, output: &Path) -> Result<()> {
    let file = File::create(output)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .strip_prefix(root)?
            .to_string_lossy()
            .into_owned();

        writer.start_file(name, options)?;
        let mut source = File::open(entry.path())?;
        io::copy(&mut source, &mut writer)?;
    }

    writer.finish()?;
    Ok(())
}

fn render_module_prop(info: &ModuleInfo, timestamp: &str) -> String {
    let version_code = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    format!(
        "id={MODULE_ID}\n\
         name=JarForge Patched Framework\n\
         version=v1.0_{timestamp}\n\
         versionCode={version_code}\n\
         author=JarForge\n\
         description=Patched framework for {codename} (Android {version})\n\
         minMagisk=20400\n\
         ksu=1\n\
         minKsu=10904\n\
         sufs=1\n\
         minSufs=10000\n\
         minApi={api}\n\
         maxApi={api}\n\
         requireReboot=true\n",
        codename = info.device_codename,
        version = info.android_version,
        api = info.api_level,
    )
}
