// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    anyhow::{anyhow, Context, Result},
    clap::{Arg, ArgMatches, Command},
    glob::Pattern,
    log::{info, warn},
    std::path::PathBuf,
};

use crate::{
    audit::analyze_wheel,
    elf::{ElfFile, Libc},
    error::AuditError,
    logging,
    patcher::{ElfPatcher, NoopPatcher, Patchelf},
    policy::{default_musl_policy, PolicySet},
    repair::{execute_repair, plan_repair, RepairOptions},
    resolver::Resolver,
    show,
    wheel::UnpackedWheel,
};

const ABOUT: &str = "\
# About

`lwa` audits Linux wheels containing pre-compiled native extensions
for conformance with a platform ABI policy (the manylinux and
musllinux tags), and repairs wheels that reach beyond a policy by
grafting the offending shared libraries into the archive and rewriting
the binaries to load the bundled copies.
";

pub fn run() -> Result<i32> {
    let app = Command::new("linux-wheel-auditor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Audit and repair Linux wheels for platform ABI conformance")
        .long_about(ABOUT)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .multiple_occurrences(true)
                .global(true)
                .help("Increase logging verbosity"),
        );

    let app = app.subcommand(
        Command::new("show")
            .about("Audit a wheel for external shared library dependencies")
            .arg(
                Arg::new("wheel_file")
                    .required(true)
                    .takes_value(true)
                    .help("Path to wheel file"),
            )
            .arg(
                Arg::new("exclude")
                    .long("exclude")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Exclude sonames matching this glob pattern from the analysis"),
            )
            .arg(
                Arg::new("no_rpath_chain")
                    .long("no-rpath-chain")
                    .help("Do not search parent DT_RPATH entries when resolving libraries"),
            )
            .arg(
                Arg::new("policy_file")
                    .long("policy-file")
                    .takes_value(true)
                    .help("Path to an alternate policy table (JSON)"),
            ),
    );

    let app = app.subcommand(
        Command::new("repair")
            .about("Vendor external shared libraries into a wheel")
            .arg(
                Arg::new("wheel_file")
                    .required(true)
                    .takes_value(true)
                    .help("Path to wheel file"),
            )
            .arg(
                Arg::new("plat")
                    .long("plat")
                    .takes_value(true)
                    .env("AUDITWHEEL_PLAT")
                    .help("Platform policy to repair the wheel to"),
            )
            .arg(
                Arg::new("wheel_dir")
                    .short('w')
                    .long("wheel-dir")
                    .takes_value(true)
                    .default_value("wheelhouse")
                    .help("Directory to write the repaired wheel into"),
            )
            .arg(
                Arg::new("lib_sdir")
                    .short('L')
                    .long("lib-sdir")
                    .takes_value(true)
                    .default_value(".libs")
                    .help("Suffix of the vendored library directory"),
            )
            .arg(
                Arg::new("exclude")
                    .long("exclude")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Exclude sonames matching this glob pattern from grafting"),
            )
            .arg(
                Arg::new("only_plat")
                    .long("only-plat")
                    .help("Tag with the target policy only, omitting legacy aliases"),
            )
            .arg(
                Arg::new("strip")
                    .long("strip")
                    .help("Strip debug symbols from grafted libraries"),
            )
            .arg(
                Arg::new("no_update_tags")
                    .long("no-update-tags")
                    .help("Leave the wheel file name and WHEEL metadata tags unchanged"),
            )
            .arg(
                Arg::new("no_rpath_chain")
                    .long("no-rpath-chain")
                    .help("Do not search parent DT_RPATH entries when resolving libraries"),
            )
            .arg(
                Arg::new("policy_file")
                    .long("policy-file")
                    .takes_value(true)
                    .help("Path to an alternate policy table (JSON)"),
            ),
    );

    let matches = app.get_matches();
    logging::install(matches.occurrences_of("verbose"));

    match matches.subcommand() {
        Some(("show", args)) => command_show(args),
        Some(("repair", args)) => command_repair(args),
        _ => Err(anyhow!("invalid subcommand")),
    }
}

fn parse_excludes(args: &ArgMatches) -> Result<Vec<Pattern>> {
    args.values_of("exclude")
        .into_iter()
        .flatten()
        .map(|raw| Pattern::new(raw).with_context(|| format!("invalid exclude pattern {}", raw)))
        .collect()
}

fn build_resolver(args: &ArgMatches) -> Resolver {
    Resolver::host()
        .with_rpath_chain(!args.is_present("no_rpath_chain"))
        .with_ld_library_path(std::env::var("LD_LIBRARY_PATH").ok())
}

/// Probe the wheel's binaries for the architecture and libc flavor the
/// policy table must match. `None` means no parseable ELF was found.
fn wheel_platform(
    wheel: &UnpackedWheel,
) -> Result<Option<(crate::arch::Architecture, Option<Libc>)>> {
    for rel in wheel.elf_files()? {
        match ElfFile::open(&wheel.root().join(&rel)) {
            Ok(elf) => match elf.arch() {
                Ok(arch) => return Ok(Some((arch, elf.libc))),
                Err(e) => return Err(e.into()),
            },
            Err(e) => warn!("skipping {}: {}", rel.display(), e),
        }
    }

    Ok(None)
}

fn load_policies(
    args: &ArgMatches,
    wheel: &UnpackedWheel,
    resolver: &Resolver,
) -> Result<Option<(PolicySet, Option<Libc>)>> {
    let (arch, libc) = match wheel_platform(wheel)? {
        Some(platform) => platform,
        None => return Ok(None),
    };

    let libc_flavor = libc.unwrap_or_else(crate::resolver::system_libc);

    let musl_policy = if libc_flavor == Libc::Musl {
        wheel
            .elf_files()?
            .first()
            .and_then(|rel| ElfFile::open(&wheel.root().join(rel)).ok())
            .and_then(|elf| resolver.detect_host_libc(&elf))
            .and_then(|host| host.version)
            .and_then(|version| default_musl_policy(&version))
    } else {
        None
    };

    let policies = match args.value_of("policy_file") {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading policy file {}", path))?;
            PolicySet::from_json(&text, libc_flavor, arch, musl_policy.as_deref())?
        }
        None => PolicySet::load_default(libc_flavor, arch, musl_policy.as_deref())?,
    };

    Ok(Some((policies, libc)))
}

fn command_show(args: &ArgMatches) -> Result<i32> {
    let wheel_path = PathBuf::from(args.value_of("wheel_file").unwrap());
    if !wheel_path.is_file() {
        return Err(anyhow!("cannot access {}: no such file", wheel_path.display()));
    }
    let basename = wheel_path.file_name().unwrap().to_string_lossy().into_owned();

    let wheel = UnpackedWheel::unpack(&wheel_path)?;
    let resolver = build_resolver(args);
    let exclude = parse_excludes(args)?;

    let (policies, _) = match load_policies(args, &wheel, &resolver)? {
        Some(loaded) => loaded,
        None => {
            println!("{}", show::non_platform_wheel_message(&basename));
            return Ok(1);
        }
    };

    let report = match analyze_wheel(&wheel, &policies, &resolver, &exclude, true) {
        Ok(report) => report,
        Err(AuditError::NonPlatformWheel) => {
            println!("{}", show::non_platform_wheel_message(&basename));
            return Ok(1);
        }
        Err(e) => return Err(map_audit_error(e)),
    };

    print!("{}", show::render_report(&basename, &report, &policies));

    // A wheel satisfying only the permissive default is not installable
    // under any portable tag.
    if report.overall_policy.is_default_linux() {
        Ok(1)
    } else {
        Ok(0)
    }
}

fn command_repair(args: &ArgMatches) -> Result<i32> {
    let wheel_path = PathBuf::from(args.value_of("wheel_file").unwrap());
    if !wheel_path.is_file() {
        return Err(anyhow!("cannot access {}: no such file", wheel_path.display()));
    }
    let basename = wheel_path.file_name().unwrap().to_string_lossy().into_owned();

    let mut wheel = UnpackedWheel::unpack(&wheel_path)?;
    let resolver = build_resolver(args);
    let exclude = parse_excludes(args)?;

    let (policies, _) = match load_policies(args, &wheel, &resolver)? {
        Some(loaded) => loaded,
        None => {
            info!("{}", show::non_platform_wheel_message(&basename));
            info!("nothing to repair");
            return Ok(0);
        }
    };

    let report = match analyze_wheel(&wheel, &policies, &resolver, &exclude, false) {
        Ok(report) => report,
        Err(AuditError::NonPlatformWheel) => {
            info!("{}", show::non_platform_wheel_message(&basename));
            info!("nothing to repair");
            return Ok(0);
        }
        Err(e) if is_infeasible(&e) => {
            log::error!("cannot repair {}: {}", basename, e);
            return Ok(1);
        }
        Err(e) => return Err(map_audit_error(e)),
    };

    let target = match args.value_of("plat") {
        Some(name) => policies.find(name).map_err(map_audit_error)?.clone(),
        None => report.overall_policy.clone(),
    };

    let options = RepairOptions {
        lib_sdir: args.value_of("lib_sdir").unwrap().to_string(),
        out_dir: PathBuf::from(args.value_of("wheel_dir").unwrap()),
        update_tags: !args.is_present("no_update_tags"),
        only_plat: args.is_present("only_plat"),
        strip: args.is_present("strip"),
    };

    let plan = match plan_repair(&wheel, &report, &target, &options) {
        Ok(plan) => plan,
        Err(e) if is_infeasible(&e) => {
            log::error!("cannot repair {}: {}", basename, e);
            return Ok(1);
        }
        Err(e) => return Err(map_audit_error(e)),
    };

    let patchelf;
    let patcher: &dyn ElfPatcher = if plan.patches.is_empty() {
        &NoopPatcher
    } else {
        patchelf = Patchelf::new().map_err(map_audit_error)?;
        &patchelf
    };

    match execute_repair(&mut wheel, &plan, patcher, &options) {
        Ok(_) => Ok(0),
        Err(e) if is_infeasible(&e) => {
            log::error!("cannot repair {}: {}", basename, e);
            Ok(1)
        }
        Err(e) => Err(map_audit_error(e)),
    }
}

/// Errors meaning the wheel cannot be brought to the requested policy,
/// as opposed to usage or I/O failures.
fn is_infeasible(e: &AuditError) -> bool {
    matches!(
        e,
        AuditError::PolicyViolation { .. }
            | AuditError::BlacklistedSymbol { .. }
            | AuditError::SonameConflict { .. }
            | AuditError::Unresolved { .. }
            | AuditError::HeterogeneousArchive(_, _)
            | AuditError::PatcherFailed { .. }
            | AuditError::StripFailed { .. }
    )
}

fn map_audit_error(e: AuditError) -> anyhow::Error {
    anyhow::Error::new(e)
}
