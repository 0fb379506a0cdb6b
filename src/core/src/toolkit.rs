//! DynamicInstaller provisioning.
//!
//! The toolkit's own `setup` script is written for interactive use and
//! drops into a bash prompt, which hangs here, so installation is driven
//! manually: copy the bundle, pick the device architecture, unpack busybox
//! and the static tool archives, and write the `environment` descriptor
//! that every job script sources.

use crate::android::inspect;
use crate::runtime::RuntimeEnvironment;
use crate::shell::RootShell;
use anyhow::Result;

pub fn map_abi(abi: &str) -> &'static str {
    if abi.starts_with("arm64") {
        "arm64-v8a"
    } else if abi.starts_with("armeabi") || abi.starts_with("arm") {
        "armeabi-v7a"
    } else if abi.starts_with("x86_64") {
        "x86_64"
    } else if abi.starts_with("x86") {
        "x86"
    } else {
        "arm64-v8a"
    }
}

pub struct Installer<'a> {
    shell: &'a RootShell,
    env: &'a RuntimeEnvironment,
}

impl<'a> Installer<'a> {
    pub fn new(shell: &'a RootShell, env: &'a RuntimeEnvironment) -> Self {
        Self { shell, env }
    }

    /// Idempotent: a present `environment` descriptor short-circuits to
    /// success. An actual install is destructive, wiping both toolkit
    /// directories first. Individual extraction failures are diagnostics
    /// only; success is gated on the descriptor plus a working busybox.
    pub async fn install_if_needed(&self, log: &(dyn Fn(&str) + Sync)) -> Result<bool> {
        let sentinel = self.env.environment_file();
        if self.shell.file_exists(&sentinel).await {
            log("toolkit already installed");
            return Ok(true);
        }

        log("installing toolkit...");

        let root = self.env.toolkit_root.display().to_string();
        let tmp = self.env.toolkit_tmp.display().to_string();
        let bin = self.env.toolkit_bin().display().to_string();

        // clean slate
        let res = self
            .shell
            .exec(&format!(
                "rm -rf \"{root}\" \"{tmp}\" && mkdir -p \"{root}\" \"{tmp}\" \"{bin}\""
            ))
            .await?;
        if !res.success() {
            log(&format!("failed to prepare toolkit directories: {}", res.err_joined()));
            return Ok(false);
        }

        let bundle_src = self.env.assets.join("toolkit/META-INF");
        let res = self
            .shell
            .exec(&format!(
                "cp -r \"{}\" \"{root}/META-INF\"",
                bundle_src.display()
            ))
            .await?;
        if !res.success() {
            log(&format!("failed to copy toolkit bundle: {}", res.err_joined()));
        }

        // the workspace library sits at the bundle root, not inside META-INF
        let workspace_src = self.env.assets.join("toolkit/smali_workspace.sh");
        let _ = self
            .shell
            .exec(&format!(
                "cp \"{}\" \"{root}/smali_workspace.sh\" 2>/dev/null",
                workspace_src.display()
            ))
            .await;
        log("copied toolkit assets");

        let _ = self.shell.exec(&format!("chmod -R 755 \"{root}\"")).await;

        let abi = inspect::getprop(self.shell, "ro.product.cpu.abi")
            .await
            .unwrap_or_default();
        let arch = map_abi(&abi);
        log(&format!("architecture: {arch}"));

        let extract = self.shell.exec(&self.extraction_script(arch)).await?;
        for line in &extract.out {
            log(&format!("[extract] {line}"));
        }

        self.shell
            .write_via_shell(&self.environment_descriptor(), &sentinel, "755")
            .await?;

        if !self.shell.file_exists(&sentinel).await {
            log("failed to create environment file");
            return Ok(false);
        }

        let busybox = self
            .shell
            .exec(&format!("\"{bin}/busybox\" --help >/dev/null 2>&1 && echo OK"))
            .await?;
        if !busybox.out.iter().any(|line| line.contains("OK")) {
            log("busybox is not working, install failed");
            return Ok(false);
        }
        log("busybox verified");

        log("toolkit installed successfully");
        Ok(true)
    }

    /// The extraction steps, run as one root script so the bundle never
    /// has to cross into app-readable storage. Every step reports a
    /// `[DIAG]` line instead of failing the install.
    fn extraction_script(&self, arch: &str) -> String {
        let zbin = self.env.toolkit_bundle().display().to_string();
        let root = self.env.toolkit_root.display().to_string();
        let tmp = self.env.toolkit_tmp.display().to_string();
        let bin = self.env.toolkit_bin().display().to_string();

        format!(
            r#"cd "{zbin}" || exit 1
echo "[DIAG] zbin contents:"
ls

ARCH="{arch}"

if [ -d "arch/$ARCH" ]; then
    cp -f "arch/$ARCH/busybox" "{bin}/busybox"
    chmod 755 "{bin}/busybox"
    cd "{bin}"
    ./busybox --install -s . 2>/dev/null || {{
        for applet in $(./busybox --list 2>/dev/null); do
            ln -sf busybox "$applet" 2>/dev/null || true
        done
    }}
    cd "{zbin}"
    echo "[DIAG] busybox installed"
else
    echo "[DIAG] no arch dir for $ARCH"
fi

if [ -f static ]; then
    if [ -x "{bin}/unzip" ]; then
        "{bin}/unzip" -qo static -d "{bin}" 2>/dev/null && echo "[DIAG] static extracted" || echo "[DIAG] static extraction failed"
    else
        unzip -qo static -d "{bin}" 2>/dev/null && echo "[DIAG] static extracted (system unzip)" || echo "[DIAG] static extraction failed"
    fi
fi

if [ -f "arch/$ARCH/bin" ]; then
    if [ -x "{bin}/unzip" ]; then
        "{bin}/unzip" -qo "arch/$ARCH/bin" -d "{bin}" 2>/dev/null && echo "[DIAG] arch bin extracted" || echo "[DIAG] arch bin extraction failed"
    else
        unzip -qo "arch/$ARCH/bin" -d "{bin}" 2>/dev/null && echo "[DIAG] arch bin extracted (system unzip)" || echo "[DIAG] arch bin extraction failed"
    fi
fi

chmod -R 755 "{bin}"

cp -f core "{tmp}/" 2>/dev/null || true
cp -f configs/* "{bin}/" 2>/dev/null || true

if [ -f "{root}/smali_workspace.sh" ]; then
    cp -f "{root}/smali_workspace.sh" "{tmp}/"
    chmod 755 "{tmp}/smali_workspace.sh"
    echo "[DIAG] workspace library copied"
else
    echo "[DIAG] WARNING: smali_workspace.sh missing"
fi

if [ -f baksmali.jar ]; then
    cp -f baksmali.jar "{bin}/"
    echo "[DIAG] baksmali.jar copied"
fi

if [ -x "{bin}/bash" ]; then
    echo "[DIAG] bash found"
else
    echo "[DIAG] bash NOT found, extraction may have failed"
fi
if [ -f "{bin}/apktool.jar" ]; then
    echo "[DIAG] apktool.jar found"
else
    echo "[DIAG] apktool.jar NOT found"
fi
"#
        )
    }

    fn environment_descriptor(&self) -> String {
        format!(
            "#!/system/bin/sh\n\
             # toolkit environment\n\
             export DI_ROOT=\"{zbin}\"\n\
             export DI_TMP=\"{tmp}\"\n\
             export DI_BIN=\"{bin}\"\n\
             export PATH=\"{bin}:$PATH\"\n\
             export TMPDIR=\"{tmp}\"\n",
            zbin = self.env.toolkit_bundle().display(),
            tmp = self.env.toolkit_tmp.display(),
            bin = self.env.toolkit_bin().display(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn abi_mapping_defaults_to_arm64() {
        assert_eq!(map_abi("arm64-v8a"), "arm64-v8a");
        assert_eq!(map_abi("armeabi-v7a"), "armeabi-v7a");
        assert_eq!(map_abi("x86_64"), "x86_64");
        assert_eq!(map_abi("x86"), "x86");
        assert_eq!(map_abi(""), "arm64-v8a");
        assert_eq!(map_abi("riscv64"), "arm64-v8a");
    }

    fn seed_bundle(env: &RuntimeEnvironment) {
        // a bundle whose "busybox" is a stub that exits 0 for any flag
        let arch_dir = env.assets.join("toolkit/META-INF/zbin/arch/arm64-v8a");
        fs::create_dir_all(&arch_dir).unwrap();
        let busybox = arch_dir.join("busybox");
        fs::write(&busybox, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&busybox, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(env.assets.join("toolkit/META-INF/zbin/core"), "# core\n").unwrap();
    }

    #[tokio::test]
    async fn second_install_is_a_no_op() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let shell = RootShell::direct();
        seed_bundle(&env);

        let installer = Installer::new(&shell, &env);
        assert!(installer.install_if_needed(&|_msg: &str| {}).await.unwrap());
        assert!(env.environment_file().exists());

        // a marker inside the install root survives the second call only
        // if the destructive path is skipped
        let marker = env.toolkit_root.join("marker");
        fs::write(&marker, "x").unwrap();

        assert!(installer.install_if_needed(&|_msg: &str| {}).await.unwrap());
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn descriptor_records_resolved_paths() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let shell = RootShell::direct();
        seed_bundle(&env);

        let installer = Installer::new(&shell, &env);
        assert!(installer.install_if_needed(&|_msg: &str| {}).await.unwrap());

        let descriptor = fs::read_to_string(env.environment_file()).unwrap();
        assert!(descriptor.contains(&format!("export DI_BIN=\"{}\"", env.toolkit_bin().display())));
        assert!(descriptor.contains(&format!("export TMPDIR=\"{}\"", env.toolkit_tmp.display())));

        // the stub busybox was installed and passed its gate
        assert!(env.toolkit_bin().join("busybox").exists());
    }
}
