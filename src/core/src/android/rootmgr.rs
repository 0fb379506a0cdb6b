//! Root manager detection and module installation.
//!
//! Supports Magisk, KernelSU (including Next) and APatch; falls back to a
//! manual unpack into the manager's modules directory when the managers'
//! own installers are unavailable.

use crate::shell::{CommandOutput, RootShell};
use anyhow::{Result, bail};
use jarforge_utils::ext::ResultExt;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use std::path::{Path, PathBuf};
use strum_macros::Display;

static MODULE_ID_SANITIZER: Lazy<Regex> = Lazy::new(|| Regex::new("[^a-zA-Z0-9_-]").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RootManagerType {
    Magisk,
    KernelSu,
    APatch,
    Unknown,
}

pub async fn detect(shell: &RootShell) -> RootManagerType {
    let probe = |cmd: &str| {
        let shell = shell.clone();
        let cmd = cmd.to_owned();
        async move {
            shell
                .exec(&cmd)
                .await
                .map(|res| res.success() && !res.out.is_empty())
                .unwrap_or(false)
        }
    };

    if probe("which ksud || which ksu || [ -f /data/adb/ksu/bin/busybox ] && echo yes").await
        || probe("[ -d /data/adb/ksu/modules ] && echo yes").await
    {
        return RootManagerType::KernelSu;
    }

    if probe("which apd || [ -f /data/adb/apatch/config ] && echo yes").await {
        return RootManagerType::APatch;
    }

    if probe("which magisk").await {
        return RootManagerType::Magisk;
    }

    RootManagerType::Unknown
}

pub async fn version_string(shell: &RootShell, manager: RootManagerType) -> Option<String> {
    let cmd = match manager {
        RootManagerType::KernelSu => {
            "ksud --version 2>/dev/null || cat /data/adb/ksu/.version 2>/dev/null"
        }
        RootManagerType::APatch => "apd --version 2>/dev/null",
        RootManagerType::Magisk | RootManagerType::Unknown => "magisk -v",
    };

    let res = shell.exec(cmd).await.ok_or_warn()?;
    if res.success() && !res.out.is_empty() {
        Some(format!("{manager} {}", res.out[0].trim()))
    } else {
        Some(manager.to_string())
    }
}

pub async fn install_module(
    shell: &RootShell,
    manager: RootManagerType,
    zip_path: &Path,
) -> Result<()> {
    let zip = zip_path.display();

    let result = match manager {
        RootManagerType::KernelSu => {
            let ksud = shell.exec(&format!("ksud module install \"{zip}\"")).await?;
            if ksud.success() {
                ksud
            } else {
                let ksu = shell.exec(&format!("ksu module install \"{zip}\"")).await?;
                if ksu.success() {
                    ksu
                } else {
                    install_manually(shell, zip_path, "/data/adb/ksu/modules").await?
                }
            }
        }
        RootManagerType::APatch => {
            let apd = shell.exec(&format!("apd module install \"{zip}\"")).await?;
            if apd.success() {
                apd
            } else {
                install_manually(shell, zip_path, "/data/adb/apatch/modules").await?
            }
        }
        RootManagerType::Magisk => {
            shell
                .exec(&format!("magisk --install-module \"{zip}\""))
                .await?
        }
        RootManagerType::Unknown => {
            let magisk = shell
                .exec(&format!("magisk --install-module \"{zip}\""))
                .await?;
            if magisk.success() {
                magisk
            } else {
                let ksu = install_manually(shell, zip_path, "/data/adb/ksu/modules").await?;
                if ksu.success() {
                    ksu
                } else {
                    install_manually(shell, zip_path, "/data/adb/modules").await?
                }
            }
        }
    };

    if !result.success() {
        bail!("module installation failed: {}", result.err_joined());
    }
    Ok(())
}

async fn install_manually(
    shell: &RootShell,
    zip_path: &Path,
    modules_dir: &str,
) -> Result<CommandOutput> {
    let module_id = sanitize_module_id(
        zip_path
            .file_stem()
            .map(|stem| stem.to_string_lossy())
            .unwrap_or_default()
            .as_ref(),
    );
    let module_dir = format!("{modules_dir}/{module_id}");

    shell
        .exec(&format!(
            "mkdir -p \"{module_dir}\" && \
             unzip -o \"{}\" -d \"{module_dir}\" && \
             chmod -R 755 \"{module_dir}\" && \
             touch \"{modules_dir}/update\"",
            zip_path.display()
        ))
        .await
}

fn sanitize_module_id(stem: &str) -> String {
    let sanitized = MODULE_ID_SANITIZER.replace_all(stem, "_");
    sanitized.chars().take(50).collect()
}

pub async fn reboot(shell: &RootShell) -> Result<()> {
    let res = shell.exec("reboot").await?;
    if !res.success() {
        bail!("reboot failed: {}", res.err_joined());
    }
    Ok(())
}

/// Relocates a generated module into the public Downloads directory.
pub async fn move_to_downloads(shell: &RootShell, file: &Path) -> Result<PathBuf> {
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module.zip".into());
    let dest = PathBuf::from("/sdcard/Download").join(&name);

    let res = shell
        .exec(&format!(
            "mkdir -p /sdcard/Download && cp \"{}\" \"{}\" && chmod 644 \"{}\"",
            file.display(),
            dest.display(),
            dest.display()
        ))
        .await?;

    if !res.success() {
        bail!("failed to move module to Downloads: {}", res.err_joined());
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_id_is_sanitized_and_bounded() {
        assert_eq!(sanitize_module_id("My Module (v2)"), "My_Module__v2_");

        let long = "x".repeat(80);
        assert_eq!(sanitize_module_id(&long).len(), 50);
    }
}
