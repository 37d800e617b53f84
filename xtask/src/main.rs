#![deny(unused_must_use)]

use std::{env, path::PathBuf};

use xshell::cmd;

fn main() -> Result<(), anyhow::Error> {
    let args = env::args().skip(1).collect::<Vec<_>>();
    let args = args.iter().map(|s| &**s).collect::<Vec<_>>();

    match &args[..] {
        ["ci"] => test_ci(),
        ["test"] => test_mesh(),
        ["update"] => update(),
        _ => {
            println!("USAGE cargo xtask [ci|test|update]");
            Ok(())
        }
    }
}

fn update() -> Result<(), anyhow::Error> {
    let _p = xshell::pushd(root_dir())?;
    cmd!("cargo update").run()?;
    Ok(())
}

fn test_ci() -> Result<(), anyhow::Error> {
    let _e = xshell::pushenv("CI", "true");
    check_format()?;
    clippy()?;
    test_mesh()?;
    Ok(())
}

fn check_format() -> Result<(), anyhow::Error> {
    let _p = xshell::pushd(root_dir())?;
    cmd!("cargo fmt --all -- --check").run()?;
    Ok(())
}

fn clippy() -> Result<(), anyhow::Error> {
    let _p = xshell::pushd(mesh_dir())?;
    cmd!("cargo clippy --all-targets -- -D warnings").run()?;
    Ok(())
}

fn test_mesh() -> Result<(), anyhow::Error> {
    let _p = xshell::pushd(mesh_dir())?;

    cmd!("cargo test").run()?;
    // Logging macros must still consume their arguments with every backend off.
    cmd!("cargo test --no-default-features").run()?;
    Ok(())
}

fn mesh_dir() -> PathBuf {
    let mut mesh = root_dir();
    mesh.push("mesh");
    mesh
}

fn root_dir() -> PathBuf {
    let mut xtask_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    xtask_dir.pop();
    xtask_dir
}
