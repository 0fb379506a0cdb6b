//! Device properties and framework file discovery.

use crate::android::sysprop;
use crate::shell::RootShell;
use std::path::Path;

pub const FRAMEWORK_JAR: &str = "framework.jar";
pub const SERVICES_JAR: &str = "services.jar";
pub const OEM_SERVICES_JAR: &str = "miui-services.jar";

/// The recognized input-file roles, in deterministic order. Anything else
/// handed to a job is carried in the input set but never mapped to an
/// environment variable or checksummed.
pub const RECOGNIZED_ROLES: [&str; 3] = [FRAMEWORK_JAR, SERVICES_JAR, OEM_SERVICES_JAR];

pub const FRAMEWORK_JAR_PATH: &str = "/system/framework/framework.jar";
pub const SERVICES_JAR_PATH: &str = "/system/framework/services.jar";

/// OEM ROMs ship the jar in different partitions depending on the release.
pub const OEM_SERVICES_PATHS: [&str; 3] = [
    "/system/system_ext/framework/miui-services.jar",
    "/system_ext/framework/miui-services.jar",
    "/system/framework/miui-services.jar",
];

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub api_level: i32,
    pub android_version: String,
    pub device_codename: String,
    pub device_name: String,
    pub version_name: String,
    pub has_framework_jar: bool,
    pub has_services_jar: bool,
    pub has_oem_services_jar: bool,
}

pub async fn device_info(shell: &RootShell) -> DeviceInfo {
    let api_level = getprop(shell, "ro.build.version.sdk")
        .await
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let android_version = getprop(shell, "ro.build.version.release")
        .await
        .unwrap_or_else(|| "Unknown".into());
    let device_codename = getprop(shell, "ro.product.device")
        .await
        .unwrap_or_else(|| "unknown".into());
    let device_name = getprop(shell, "ro.product.model")
        .await
        .unwrap_or_else(|| "Unknown Device".into());

    let mut version_name = None;
    for prop in [
        "ro.system.build.version.incremental",
        "ro.build.display.id",
        "ro.build.id",
    ] {
        version_name = getprop(shell, prop).await;
        if version_name.is_some() {
            break;
        }
    }

    DeviceInfo {
        api_level,
        android_version,
        device_codename,
        device_name,
        version_name: version_name.unwrap_or_else(|| "unknown".into()),
        has_framework_jar: shell.file_exists(Path::new(FRAMEWORK_JAR_PATH)).await,
        has_services_jar: shell.file_exists(Path::new(SERVICES_JAR_PATH)).await,
        has_oem_services_jar: oem_services_path(shell).await.is_some(),
    }
}

pub async fn getprop(shell: &RootShell, name: &str) -> Option<String> {
    if let Ok(res) = shell.exec(&format!("getprop {name}")).await
        && res.success()
        && let Some(value) = res.out.first()
        && !value.trim().is_empty()
    {
        return Some(value.trim().to_owned());
    }

    sysprop::get(name).filter(|value| !value.is_empty())
}

pub async fn oem_services_path(shell: &RootShell) -> Option<&'static str> {
    for path in OEM_SERVICES_PATHS {
        if shell.file_exists(Path::new(path)).await {
            return Some(path);
        }
    }
    None
}

/// Source path for a recognized role on the live system, if known.
pub async fn system_path_for_role(shell: &RootShell, role: &str) -> Option<String> {
    match role {
        FRAMEWORK_JAR => Some(FRAMEWORK_JAR_PATH.to_owned()),
        SERVICES_JAR => Some(SERVICES_JAR_PATH.to_owned()),
        OEM_SERVICES_JAR => oem_services_path(shell).await.map(str::to_owned),
        _ => None,
    }
}
