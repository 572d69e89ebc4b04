// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use amivm_runtime::{library::LIB_PATH_ENV, supervisor};
use amivm_tlcache::TranslationCache;

/// Runs AmigaOS executables in Hunk format by translating their 680x0
/// code to x86-64 on the fly.
#[derive(Parser)]
#[command(name = "amivm", version)]
struct Args {
    /// The program image to execute.
    program: PathBuf,

    /// Directory containing the native libraries (lib*.so).
    /// Equivalent to setting AMIVM_LIB_PATH.
    #[arg(long)]
    lib_dir: Option<PathBuf>,
}

fn run(args: Args) -> anyhow::Result<()> {
    if let Some(dir) = &args.lib_dir {
        env::set_var(LIB_PATH_ENV, dir);
    }

    info!("loading program...");
    let program =
        amivm_loader::load_program(&args.program).context("loading program failed")?;

    info!("translating code...");
    let cache = TranslationCache::new().context("initializing translation cache failed")?;
    amivm_translator::init(cache);
    let entry =
        amivm_translator::setup_tu(program.code_address).context("translating code failed")?;
    // translate the entry unit eagerly so an untranslatable program
    // aborts before a guest process exists; branch targets stay lazy
    amivm_translator::translate_tu(program.code_address).context("translating code failed")?;

    supervisor::install_system_library().context("loading Exec library failed")?;

    info!("executing program...");
    // the guest's exit status is reported by the supervisor but not
    // propagated into our own
    supervisor::run_guest(entry).context("executing program failed")?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        error!("{:#}", err);
        process::exit(1);
    }
}
