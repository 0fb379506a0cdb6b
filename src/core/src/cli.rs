use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "Patch system framework jars and package them as flashable modules")]
pub struct Args {
    /// Directory holding the bundled assets (toolkit, features, module template)
    #[arg(long, global = true)]
    pub assets: Option<PathBuf>,

    /// Run commands through the current shell instead of su (testing only)
    #[arg(long, global = true)]
    pub no_su: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the patching pipeline and build a module
    Patch {
        /// Feature to apply, matched loosely against id and name (repeatable)
        #[arg(short, long = "feature", value_name = "ID", required = true)]
        features: Vec<String>,

        /// Explicit input file as role=path, e.g. framework.jar=/sdcard/framework.jar
        #[arg(short, long = "input", value_name = "ROLE=PATH", value_parser = parse_input)]
        inputs: Vec<(String, PathBuf)>,

        /// Pull this role's jar from the live system instead (repeatable)
        #[arg(short, long = "system", value_name = "ROLE")]
        system_roles: Vec<String>,

        /// Install the generated module through the detected root manager
        #[arg(long)]
        install: bool,

        /// Copy the generated module to the Downloads directory
        #[arg(long)]
        to_downloads: bool,

        /// Reboot once the module is installed
        #[arg(long, requires = "install")]
        reboot: bool,
    },

    /// Manage feature scripts
    Features {
        #[command(subcommand)]
        command: FeaturesCommand,
    },

    /// Provision the on-device toolkit
    Install,

    /// Show device and root manager information
    Info,

    /// Remove scratch state and generated modules
    Cleanup,
}

#[derive(Debug, Subcommand)]
pub enum FeaturesCommand {
    /// List every available feature with its tier and required inputs
    List,

    /// Import a script into the user feature store
    Import { path: PathBuf },

    /// Delete a script from the user feature store
    Delete { id: String },
}

fn parse_input(value: &str) -> Result<(String, PathBuf), String> {
    let (role, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ROLE=PATH, got: {value}"))?;
    if role.is_empty() || path.is_empty() {
        return Err(format!("expected ROLE=PATH, got: {value}"));
    }
    Ok((role.to_owned(), PathBuf::from(path)))
}

pub fn parse_args() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_pairs_split_on_first_equals() {
        let (role, path) = parse_input("framework.jar=/sdcard/framework.jar").unwrap();
        assert_eq!(role, "framework.jar");
        assert_eq!(path, PathBuf::from("/sdcard/framework.jar"));

        assert!(parse_input("framework.jar").is_err());
        assert!(parse_input("=path").is_err());
    }

    #[test]
    fn patch_requires_at_least_one_feature() {
        let err = Args::try_parse_from(["jarforge", "patch"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let args = Args::try_parse_from([
            "jarforge",
            "patch",
            "-f",
            "sig",
            "-i",
            "framework.jar=/tmp/fw.jar",
            "--install",
            "--reboot",
        ])
        .unwrap();
        match args.command {
            Command::Patch {
                features,
                inputs,
                install,
                reboot,
                ..
            } => {
                assert_eq!(features, ["sig"]);
                assert_eq!(inputs.len(), 1);
                assert!(install && reboot);
            }
            _ => panic!("expected patch subcommand"),
        }
    }
}
