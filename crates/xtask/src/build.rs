use crate::constants::PACKAGES;
use anyhow::{Context, Result};
use std::process::Command;

pub fn test_all(features: Option<&str>, release: bool) -> Result<()> {
    let mut cargo_test = Command::new("cargo");
    cargo_test.arg("test");
    for package in PACKAGES {
        cargo_test.args(["--package", package]);
    }

    if release {
        cargo_test.arg("--release");
    }

    if let Some(features) = features {
        cargo_test.args(["--features", features]);
    }

    run(cargo_test, "tests")
}

pub fn build_no_std(
    target: &str,
    features: Option<&str>,
    release: bool,
) -> Result<()> {
    for package in PACKAGES {
        println!("Building {} for {}...", package, target);
        let mut cargo_build = Command::new("cargo");
        cargo_build
            .arg("build")
            .arg("--no-default-features")
            .args(["--package", package])
            .args(["--target", target]);

        if release {
            cargo_build.arg("--release");
        }

        if let Some(features) = features {
            cargo_build.args(["--features", features]);
        }

        run(cargo_build, package)?;
    }

    Ok(())
}

fn run(mut command: Command, what: &str) -> Result<()> {
    let status = command
        .status()
        .with_context(|| format!("Failed to run cargo for {}", what))?;

    if !status.success() {
        anyhow::bail!("cargo failed for {}", what);
    }

    Ok(())
}
