// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Rendering of the analysis record.

The only producer of human-readable text in the core; programmatic
callers read [crate::audit::WheelAbiReport] directly.
*/

use {
    crate::{audit::WheelAbiReport, policy::PolicySet},
    std::fmt::Write,
};

/// Render the `show` report for a wheel.
pub fn render_report(
    wheel_basename: &str,
    report: &WheelAbiReport,
    policies: &PolicySet,
) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{} is consistent with the following platform tag: \"{}\".",
        wheel_basename, report.overall_policy.name
    );

    if report.versioned_symbols.is_empty() {
        let _ = writeln!(
            out,
            "\nThe wheel references no external versioned symbols from \
             system-provided shared libraries."
        );
    } else {
        let libs_with_versions: Vec<String> = report
            .versioned_symbols
            .iter()
            .map(|(library, tokens)| {
                let tokens: Vec<&str> = tokens.iter().map(|t| t.as_str()).collect();
                format!("{} with versions {{{}}}", library, tokens.join(", "))
            })
            .collect();

        let _ = writeln!(
            out,
            "\nThe wheel references external versioned symbols in these \
             system-provided shared libraries: {}",
            libs_with_versions.join(", ")
        );
    }

    if report.sym_policy.priority < policies.highest().priority {
        let _ = writeln!(
            out,
            "\nThis constrains the platform tag to \"{}\". In order to \
             achieve a more compatible tag, you would need to recompile \
             a new wheel from source on a system with earlier versions \
             of these libraries.",
            report.sym_policy.name
        );
    }

    let external = &report.external_refs[&report.overall_policy.name].libs;
    let lowest_whitelisted: Vec<&String> = report
        .graph
        .external
        .keys()
        .filter(|soname| !external.contains_key(*soname))
        .collect();

    if external.is_empty() {
        let _ = writeln!(out, "\nThe wheel requires no external shared libraries.");
    } else {
        let _ = writeln!(
            out,
            "\nThe following external shared libraries are required by the wheel:"
        );
        for (soname, path) in external {
            match path {
                Some(path) => {
                    let _ = writeln!(out, "    {} => {}", soname, path.display());
                }
                None => {
                    let _ = writeln!(out, "    {} => (could not be located)", soname);
                }
            }
        }
    }

    if !lowest_whitelisted.is_empty() {
        let _ = writeln!(
            out,
            "\nThe following shared libraries are satisfied by the platform \
             or the wheel itself:"
        );
        for soname in lowest_whitelisted {
            match report.graph.external[soname].path.as_ref() {
                Some(path) => {
                    let _ = writeln!(out, "    {} => {}", soname, path.display());
                }
                None => {
                    let _ = writeln!(out, "    {} => (could not be located)", soname);
                }
            }
        }
    }

    for policy in policies.by_descending_priority() {
        if policy.priority <= report.overall_policy.priority {
            continue;
        }

        let refs = &report.external_refs[&policy.name];

        if !refs.libs.is_empty() {
            let sonames: Vec<&str> = refs.libs.keys().map(|s| s.as_str()).collect();
            let _ = writeln!(
                out,
                "\nIn order to achieve the platform tag \"{}\" the following \
                 shared library dependencies will need to be eliminated:\n    {}",
                policy.name,
                sonames.join(", ")
            );
        }

        if !refs.blacklist.is_empty() {
            let _ = writeln!(
                out,
                "\nIn order to achieve the platform tag \"{}\" the following \
                 black-listed symbol dependencies will need to be eliminated:",
                policy.name
            );
            for (library, symbols) in &refs.blacklist {
                let symbols: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
                let _ = writeln!(out, "    From {}: {}", library, symbols.join(", "));
            }
        }

        let violations = policy.symbol_violations(&refs.symbols);
        if !violations.is_empty() {
            let mut tokens: Vec<String> = violations
                .iter()
                .map(|v| format!("{} > {}_{}", v.token, v.group, v.max))
                .collect();
            tokens.sort();
            tokens.dedup();
            let _ = writeln!(
                out,
                "\nIn order to achieve the platform tag \"{}\" the following \
                 versioned symbol demands would need to be lowered:\n    {}",
                policy.name,
                tokens.join(", ")
            );
        }
    }

    out
}

/// The diagnostic for archives containing no platform binaries.
pub fn non_platform_wheel_message(wheel_basename: &str) -> String {
    format!(
        "{}: this does not look like a platform wheel, no ELF executable \
         or shared library file (including compiled Python C extension) \
         found in the wheel archive",
        wheel_basename
    )
}
