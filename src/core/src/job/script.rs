//! run.sh synthesis.
//!
//! Feature scripts are *sourced*, not executed, so they can call the
//! toolkit's functions and the helpers defined here, and so later features
//! see earlier features' environment mutations. The exported variable
//! names (DI_BIN, DI_TMP, TMP, `l`, ...) are a compatibility contract with
//! the existing third-party script ecosystem and must not change.

use crate::features::PatchFeature;
use crate::job::{EXTRAS_MANIFEST, InputFileSet, Job};
use crate::runtime::RuntimeEnvironment;
use crate::shell::RootShell;
use anyhow::Result;
use std::fmt::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed environment variable per recognized input role. Roles outside
/// this table are silently dropped from the generated environment.
pub const ROLE_ENV_VARS: [(&str, &str); 3] = [
    ("framework.jar", "FRAMEWORK_JAR"),
    ("services.jar", "SERVICES_JAR"),
    ("miui-services.jar", "MIUI_SERVICES_JAR"),
];

pub fn role_env_var(role: &str) -> Option<&'static str> {
    ROLE_ENV_VARS
        .iter()
        .find(|(name, _)| *name == role)
        .map(|(_, var)| *var)
}

pub struct ScriptParams<'a> {
    pub job: &'a Job,
    pub inputs: &'a InputFileSet,
    pub features: &'a [PatchFeature],
    pub api_level: i32,
    pub device_codename: &'a str,
}

/// Renders the run.sh content. Pure text assembly; writing it into the
/// root-owned job directory is [`generate`]'s job.
pub fn render(env: &RuntimeEnvironment, params: &ScriptParams) -> String {
    let mut out = String::new();
    let job_dir = params.job.dir.display();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();

    let _ = writeln!(out, "#!{}", env.toolkit_bash().display());
    let _ = writeln!(out, "# jarforge patch job {}", params.job.id);
    let _ = writeln!(out, "# generated: {now}");
    out.push('\n');

    // One failing feature must not abort the whole job.
    out.push_str("set +e\n\n");

    let _ = writeln!(out, "export API_LEVEL={}", params.api_level);
    let _ = writeln!(
        out,
        "export DEVICE_CODENAME=\"{}\"",
        dq_escape(params.device_codename)
    );
    let _ = writeln!(out, "export JOB_DIR=\"{}\"", dq_escape(&job_dir.to_string()));
    out.push_str("export WORK_DIR=\"$JOB_DIR/work\"\n");
    out.push_str("export OUTPUT_DIR=\"$JOB_DIR/output\"\n");

    for (role, path) in params.inputs {
        if let Some(var) = role_env_var(role) {
            let _ = writeln!(
                out,
                "export {var}=\"{}\"",
                dq_escape(&path.display().to_string())
            );
        }
    }
    out.push('\n');

    out.push_str("mkdir -p \"$WORK_DIR\" \"$OUTPUT_DIR\"\n\n");

    let _ = writeln!(out, "export MODULE_EXTRAS=\"$OUTPUT_DIR/{EXTRAS_MANIFEST}\"");
    out.push_str(": > \"$MODULE_EXTRAS\"\n\n");

    out.push_str(HELPER_FUNCTIONS);
    out.push('\n');

    let _ = writeln!(
        out,
        "export DI_ROOT=\"{}\"",
        dq_escape(&env.toolkit_bundle().display().to_string())
    );
    let _ = writeln!(
        out,
        "export DI_TMP=\"{}\"",
        dq_escape(&env.toolkit_tmp.display().to_string())
    );
    let _ = writeln!(
        out,
        "export DI_BIN=\"{}\"",
        dq_escape(&env.toolkit_bin().display().to_string())
    );
    let _ = writeln!(
        out,
        "export TMP=\"{}\"",
        dq_escape(&env.toolkit_tmp.display().to_string())
    );
    let _ = writeln!(
        out,
        "export TMPDIR=\"{}\"",
        dq_escape(&env.toolkit_tmp.display().to_string())
    );
    out.push_str("export PATH=\"$DI_BIN:$PATH\"\n");
    out.push_str("export l=\"$DI_BIN\"\n\n");

    out.push_str(
        "if [ -f \"$DI_TMP/core\" ]; then\n\
         \x20   . \"$DI_TMP/core\"\n\
         \x20   echo '[*] toolkit core loaded'\n\
         else\n\
         \x20   echo '[!] WARNING: toolkit core not found, some features may not work'\n\
         fi\n\n",
    );

    let _ = writeln!(out, "echo '[*] starting patch job {}'", params.job.id);
    let _ = writeln!(
        out,
        "echo '[*] device: {} (API {})'",
        sh_escape(params.device_codename),
        params.api_level
    );
    let _ = writeln!(out, "echo '[*] features: {}'", params.features.len());
    out.push('\n');

    let tracked: Vec<(&str, &str, &PathBuf)> = params
        .inputs
        .iter()
        .filter_map(|(role, path)| role_env_var(role).map(|var| (role.as_str(), var, path)))
        .collect();

    for (_, var, _) in &tracked {
        let _ = writeln!(out, "PRE_{var}=$(md5sum \"${var}\" | cut -d' ' -f1)");
    }
    out.push('\n');

    let total = params.features.len();
    for (index, feature) in params.features.iter().enumerate() {
        let name = sh_escape(&feature.name);
        let _ = writeln!(out, "# feature {}/{total}: {name}", index + 1);
        let _ = writeln!(out, "echo '[*] [{}/{total}] applying: {name}'", index + 1);
        let _ = writeln!(
            out,
            ". \"{}\" \"$FRAMEWORK_JAR\" \"$API_LEVEL\" \"$DEVICE_CODENAME\"",
            dq_escape(&feature.runtime_path.display().to_string())
        );
        let _ = writeln!(out, "echo '[*] {name} - done'");
        out.push('\n');
    }

    for (role, var, _) in &tracked {
        let _ = writeln!(out, "POST_{var}=$(md5sum \"${var}\" | cut -d' ' -f1)");
        let _ = writeln!(out, "if [ \"$PRE_{var}\" != \"$POST_{var}\" ]; then");
        let _ = writeln!(out, "    echo '[SUCCESS] {role} modified'");
        out.push_str("else\n");
        let _ = writeln!(out, "    echo '[WARNING] {role} unchanged'");
        out.push_str("fi\n");
        let _ = writeln!(out, "cp \"${var}\" \"$OUTPUT_DIR/{role}\"");
        out.push('\n');
    }

    out.push_str("echo '[*] job finished'\n");
    out.push_str("exit 0\n");

    out
}

/// Writes the rendered script into the job directory (root-owned) and
/// marks it executable.
pub async fn generate(
    shell: &RootShell,
    env: &RuntimeEnvironment,
    params: &ScriptParams<'_>,
) -> Result<PathBuf> {
    let dest = params.job.run_script();
    shell
        .write_via_shell(&render(env, params), &dest, "755")
        .await?;
    Ok(dest)
}

// Helpers available to every sourced feature script. module_extra appends
// one `type|src|dest` record; extract_apk_libs pulls native libraries out
// of an APK and registers each one, remapping Android ABI directories to
// the module's lib directories.
const HELPER_FUNCTIONS: &str = r#"module_extra() {
    if [ -z "$1" ] || [ -z "$2" ] || [ -z "$3" ]; then
        echo '[!] module_extra: expected <type> <source> <dest>'
        return 1
    fi
    if [ ! -e "$2" ]; then
        echo "[!] module_extra: source not found: $2"
        return 1
    fi
    echo "$1|$2|$3" >> "$MODULE_EXTRAS"
}

extract_apk_libs() {
    apk="$1"
    if [ ! -f "$apk" ]; then
        echo "[!] extract_apk_libs: no such apk: $apk"
        return 1
    fi
    staging="$WORK_DIR/apk_libs_$$"
    mkdir -p "$staging"
    unzip -qo "$apk" 'lib/*' -d "$staging" 2>/dev/null
    for abi_dir in "$staging"/lib/*; do
        [ -d "$abi_dir" ] || continue
        abi=$(basename "$abi_dir")
        case "$abi" in
            arm64-v8a|x86_64) lib_dir="system/lib64" ;;
            armeabi-v7a|x86) lib_dir="system/lib" ;;
            *) echo "[!] extract_apk_libs: skipping unknown abi $abi"; continue ;;
        esac
        for lib in "$abi_dir"/*.so; do
            [ -f "$lib" ] || continue
            module_extra lib "$lib" "$lib_dir/$(basename "$lib")"
        done
    done
}
"#;

fn sh_escape(text: &str) -> String {
    text.replace('\'', r"'\''")
}

/// Escapes a value for interpolation between double quotes.
fn dq_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '"' | '$' | '`' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_job(base: &std::path::Path) -> Job {
        Job {
            id: "1700000000000".into(),
            dir: base.join("jobs/1700000000000"),
        }
    }

    fn fake_feature(id: &str, path: &std::path::Path) -> PatchFeature {
        PatchFeature {
            id: id.into(),
            name: id.replace('_', " "),
            description: String::new(),
            runtime_path: path.join(format!("{id}.sh")),
            is_user_feature: false,
        }
    }

    #[test]
    fn recognized_roles_map_to_fixed_variables() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let job = fake_job(base.path());

        let mut inputs = InputFileSet::new();
        inputs.insert("framework.jar".into(), "/tmp/fw.jar".into());
        inputs.insert("services.jar".into(), "/tmp/sv.jar".into());
        inputs.insert("extra.jar".into(), "/tmp/extra.jar".into());

        let script = render(
            &env,
            &ScriptParams {
                job: &job,
                inputs: &inputs,
                features: &[],
                api_level: 34,
                device_codename: "ingres",
            },
        );

        assert!(script.contains("export FRAMEWORK_JAR=\"/tmp/fw.jar\""));
        assert!(script.contains("export SERVICES_JAR=\"/tmp/sv.jar\""));
        // unrecognized roles get no variable and no checksum
        assert!(!script.contains("extra.jar"));
        assert!(script.contains("PRE_FRAMEWORK_JAR=$(md5sum"));
        assert!(script.contains("PRE_SERVICES_JAR=$(md5sum"));
        assert!(!script.contains("MIUI_SERVICES_JAR"));

        // changed files report success, unchanged ones only warn, and the
        // jar is copied out either way
        assert!(script.contains("echo '[SUCCESS] framework.jar modified'"));
        assert!(script.contains("echo '[WARNING] framework.jar unchanged'"));
        assert!(script.contains("cp \"$FRAMEWORK_JAR\" \"$OUTPUT_DIR/framework.jar\""));
    }

    #[test]
    fn features_are_sourced_in_caller_order() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let job = fake_job(base.path());
        let runtime = base.path().join("features/builtin");

        let mut inputs = InputFileSet::new();
        inputs.insert("framework.jar".into(), "/tmp/fw.jar".into());

        let features = vec![
            fake_feature("second_patch", &runtime),
            fake_feature("first_patch", &runtime),
        ];

        let script = render(
            &env,
            &ScriptParams {
                job: &job,
                inputs: &inputs,
                features: &features,
                api_level: 34,
                device_codename: "ingres",
            },
        );

        let second = script.find("second_patch.sh").unwrap();
        let first = script.find("first_patch.sh").unwrap();
        assert!(second < first, "caller order must be preserved");

        // sourced, never executed as a subprocess
        assert!(script.contains(&format!(". \"{}\"", features[0].runtime_path.display())));
    }

    #[test]
    fn script_skeleton_holds_the_execution_contract() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let job = fake_job(base.path());
        let inputs = InputFileSet::new();

        let script = render(
            &env,
            &ScriptParams {
                job: &job,
                inputs: &inputs,
                features: &[],
                api_level: 33,
                device_codename: "alioth",
            },
        );

        assert!(script.starts_with(&format!("#!{}", env.toolkit_bash().display())));
        assert!(script.contains("set +e"));
        assert!(script.contains(": > \"$MODULE_EXTRAS\""));
        assert!(script.contains("module_extra()"));
        assert!(script.contains("extract_apk_libs()"));
        assert!(script.contains("export l=\"$DI_BIN\""));
        assert!(script.contains(". \"$DI_TMP/core\""));
        assert!(script.trim_end().ends_with("exit 0"));
    }

    #[test]
    fn shell_metacharacters_in_values_are_escaped() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let job = fake_job(base.path());

        let mut inputs = InputFileSet::new();
        inputs.insert("framework.jar".into(), "/tmp/we\"ird$dir/fw.jar".into());

        let script = render(
            &env,
            &ScriptParams {
                job: &job,
                inputs: &inputs,
                features: &[],
                api_level: 34,
                device_codename: "odd`name",
            },
        );

        assert!(script.contains(r#"export FRAMEWORK_JAR="/tmp/we\"ird\$dir/fw.jar""#));
        assert!(script.contains(r#"export DEVICE_CODENAME="odd\`name""#));
        assert!(!script.contains("export FRAMEWORK_JAR=\"/tmp/we\"ird$dir"));
    }
}
