//! Feature script discovery, metadata parsing and runtime deployment.
//!
//! Three source tiers feed the registry: bundled scripts shipped with the
//! assets, remotely updated copies, and user imports. Updated scripts
//! shadow bundled ones with the same id; user scripts are a separate
//! namespace and always additive. Before a job runs, the selected scripts
//! are copied into a world-readable runtime directory (the job's shell
//! sources them from there, which would fail from app-private storage).

use crate::android::inspect::FRAMEWORK_JAR;
use crate::runtime::RuntimeEnvironment;
use crate::shell::RootShell;
use anyhow::{Context, Result};
use jarforge_utils::ext::ResultExt;
use log::warn;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use strum_macros::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureMetadata {
    pub name: String,
    pub description: String,
    pub required_inputs: Vec<String>,
}

/// A deployed feature script. The runtime path is only valid for the
/// duration of one job run.
#[derive(Debug, Clone)]
pub struct PatchFeature {
    pub id: String,
    pub name: String,
    pub description: String,
    pub runtime_path: PathBuf,
    pub is_user_feature: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FeatureTier {
    Bundled,
    Updated,
    User,
}

/// A discoverable script, parsed but not yet deployed.
#[derive(Debug, Clone)]
pub struct FeatureListing {
    pub id: String,
    pub metadata: FeatureMetadata,
    pub tier: FeatureTier,
    pub source: PathBuf,
}

/// Parses the `#@name` / `#@description` / `#@requires` comment directives.
/// Tolerant by design: unknown directives and absent headers fall back to
/// filename-derived defaults, requires defaults to framework.jar.
pub fn parse_metadata(fallback_id: &str, content: &str) -> FeatureMetadata {
    let mut name = fallback_id.replace('_', " ");
    let mut description = "No description".to_owned();
    let mut required_inputs = Vec::new();

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("#@name") {
            name = rest.trim().to_owned();
        } else if let Some(rest) = line.strip_prefix("#@description") {
            description = rest.trim().to_owned();
        } else if let Some(rest) = line.strip_prefix("#@requires") {
            required_inputs.extend(
                rest.split(',')
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .map(str::to_owned),
            );
        }
    }

    if required_inputs.is_empty() {
        required_inputs.push(FRAMEWORK_JAR.to_owned());
    }

    FeatureMetadata {
        name,
        description,
        required_inputs,
    }
}

pub fn fuzzy_match(feature_id: &str, feature_name: &str, wanted: &str) -> bool {
    let wanted = wanted.to_lowercase();
    feature_id.to_lowercase().contains(&wanted)
        || feature_name.replace(' ', "_").to_lowercase().contains(&wanted)
}

pub struct FeatureRegistry<'a> {
    shell: &'a RootShell,
    env: &'a RuntimeEnvironment,
}

impl<'a> FeatureRegistry<'a> {
    pub fn new(shell: &'a RootShell, env: &'a RuntimeEnvironment) -> Self {
        Self { shell, env }
    }

    /// Every discoverable feature with its metadata, no deployment.
    /// Builtin tier first (updated copies shadowing bundled ids), then the
    /// user tier.
    pub fn list_available(&self) -> Result<Vec<FeatureListing>> {
        let mut builtin: BTreeMap<String, FeatureListing> = BTreeMap::new();

        for (id, source) in scan_scripts(&self.env.builtin_features()) {
            if let Some(listing) = read_listing(&id, &source, FeatureTier::Bundled) {
                builtin.insert(id, listing);
            }
        }
        for (id, source) in scan_scripts(&self.env.updated_features()) {
            if let Some(listing) = read_listing(&id, &source, FeatureTier::Updated) {
                builtin.insert(id, listing);
            }
        }

        let mut listings: Vec<FeatureListing> = builtin.into_values().collect();

        for (id, source) in scan_scripts(&self.env.user_features()) {
            if let Some(listing) = read_listing(&id, &source, FeatureTier::User) {
                listings.push(listing);
            }
        }

        Ok(listings)
    }

    /// Materializes runtime copies of every discoverable feature. Not
    /// read-only: recreates the runtime subdirectories and chmods each
    /// deployed script executable.
    pub async fn deploy(&self) -> Result<Vec<PatchFeature>> {
        let runtime = self.env.features_runtime();
        let res = self
            .shell
            .exec(&format!(
                "mkdir -p \"{}\" \"{}\" && chmod -R 755 \"{}\"",
                self.env.builtin_runtime().display(),
                self.env.user_runtime().display(),
                runtime.display()
            ))
            .await?;
        if !res.success() {
            anyhow::bail!(
                "failed to create feature runtime directory: {}",
                res.err_joined()
            );
        }

        let mut deployed = Vec::new();
        for listing in self.list_available()? {
            let runtime_dir = match listing.tier {
                FeatureTier::User => self.env.user_runtime(),
                _ => self.env.builtin_runtime(),
            };
            let runtime_path = runtime_dir.join(format!("{}.sh", listing.id));

            let copy = self
                .shell
                .exec(&format!(
                    "cp \"{}\" \"{}\" && chmod 755 \"{}\"",
                    listing.source.display(),
                    runtime_path.display(),
                    runtime_path.display()
                ))
                .await?;
            if !copy.success() {
                warn!(
                    "skipping {}: deployment failed: {}",
                    listing.id,
                    copy.err_joined()
                );
                continue;
            }

            deployed.push(PatchFeature {
                id: listing.id,
                name: listing.metadata.name,
                description: listing.metadata.description,
                runtime_path,
                is_user_feature: listing.tier == FeatureTier::User,
            });
        }

        Ok(deployed)
    }

    /// Deploys everything (side effect), then keeps the features whose id
    /// or underscore-normalized name contains one of the requested ids.
    pub async fn enabled_scripts(&self, enabled_ids: &[String]) -> Result<Vec<PatchFeature>> {
        let all = self.deploy().await?;
        Ok(all
            .into_iter()
            .filter(|feature| {
                enabled_ids
                    .iter()
                    .any(|id| fuzzy_match(&feature.id, &feature.name, id))
            })
            .collect())
    }

    pub async fn cleanup(&self) {
        self.shell
            .rm_rf(&self.env.features_runtime())
            .await
            .log_if_error("failed to remove feature runtime");
    }

    /// Copies a user-supplied script into the user store and marks it
    /// executable.
    pub fn import_user_feature(&self, source: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .context("script path has no file name")?;
        let dir = self.env.user_features();
        fs::create_dir_all(&dir)?;

        let dest = dir.join(name);
        fs::copy(source, &dest)
            .with_context(|| format!("failed to import {}", source.display()))?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
        Ok(dest)
    }

    pub fn delete_user_feature(&self, id: &str) -> Result<bool> {
        let file = self.env.user_features().join(format!("{id}.sh"));
        if file.exists() {
            fs::remove_file(&file)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

fn scan_scripts(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut scripts: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            let id = name.strip_suffix(".sh")?;
            Some((id.to_owned(), path.clone()))
        })
        .collect();

    scripts.sort();
    scripts
}

fn read_listing(id: &str, source: &Path, tier: FeatureTier) -> Option<FeatureListing> {
    let content = fs::read_to_string(source)
        .inspect_err(|err| warn!("unreadable feature script {}: {err}", source.display()))
        .ok()?;

    Some(FeatureListing {
        id: id.to_owned(),
        metadata: parse_metadata(id, &content),
        tier,
        source: source.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn metadata_directives_override_defaults() {
        let content = "#!/bin/sh\n\
                       #@name Disable Signature Verification\n\
                       #@description Allows modified apps\n\
                       #@requires framework.jar,services.jar\n\
                       echo patch\n";
        let meta = parse_metadata("disable_signature_verification", content);

        assert_eq!(meta.name, "Disable Signature Verification");
        assert_eq!(meta.description, "Allows modified apps");
        assert_eq!(meta.required_inputs, ["framework.jar", "services.jar"]);
    }

    #[test]
    fn metadata_defaults_from_filename() {
        let meta = parse_metadata("cn_notification_fix", "#!/bin/sh\necho hi\n");

        assert_eq!(meta.name, "cn notification fix");
        assert_eq!(meta.description, "No description");
        assert_eq!(meta.required_inputs, ["framework.jar"]);
    }

    #[test]
    fn malformed_requires_drops_empty_tokens() {
        let meta = parse_metadata("x", "#@requires ,, framework.jar ,\n");
        assert_eq!(meta.required_inputs, ["framework.jar"]);
    }

    #[test]
    fn fuzzy_match_is_substring_and_case_insensitive() {
        assert!(fuzzy_match(
            "disable_signature_verification",
            "Disable Signature Verification",
            "sig"
        ));
        assert!(fuzzy_match("x", "Secure Flag Patch", "secure_flag"));
        assert!(!fuzzy_match("cn_notification_fix", "CN Notification Fix", "toolbox"));
    }

    fn write_script(dir: &Path, id: &str, name: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join(format!("{id}.sh")),
            format!("#!/bin/sh\n#@name {name}\necho {id}\n"),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn updated_tier_shadows_bundled_id() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let shell = RootShell::direct();

        write_script(&env.builtin_features(), "foo", "Bundled Foo");
        write_script(&env.updated_features(), "foo", "Updated Foo");

        let registry = FeatureRegistry::new(&shell, &env);
        let deployed = registry.deploy().await.unwrap();

        let foos: Vec<_> = deployed.iter().filter(|f| f.id == "foo").collect();
        assert_eq!(foos.len(), 1);
        assert_eq!(foos[0].name, "Updated Foo");
    }

    #[tokio::test]
    async fn user_tier_is_additive() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let shell = RootShell::direct();

        write_script(&env.builtin_features(), "foo", "Bundled Foo");
        write_script(&env.user_features(), "foo", "User Foo");

        let registry = FeatureRegistry::new(&shell, &env);
        let deployed = registry.deploy().await.unwrap();

        assert_eq!(deployed.iter().filter(|f| f.id == "foo").count(), 2);
        assert!(deployed.iter().any(|f| f.is_user_feature));
        assert!(
            deployed
                .iter()
                .all(|f| f.runtime_path.starts_with(env.features_runtime()))
        );
    }

    #[tokio::test]
    async fn enabled_scripts_fuzzy_filters_deployed_set() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let shell = RootShell::direct();

        write_script(
            &env.builtin_features(),
            "disable_signature_verification",
            "Disable Signature Verification",
        );
        write_script(&env.builtin_features(), "cn_notification_fix", "CN Notification Fix");

        let registry = FeatureRegistry::new(&shell, &env);
        let enabled = registry.enabled_scripts(&["sig".to_owned()]).await.unwrap();

        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "disable_signature_verification");
        assert!(enabled[0].runtime_path.exists());
    }
}
