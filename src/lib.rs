// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Audit and repair Linux wheels for platform ABI conformance.

A wheel carrying pre-compiled native extensions is only installable
across distributions when every external shared library it loads and
every versioned symbol it imports fall within a documented platform
policy (the manylinux / musllinux tags). This crate answers what a
wheel actually requires and rewrites wheels that reach beyond a policy:

* [elf] parses each binary's dynamic linking records.
* [resolver] locates needed libraries the way the runtime loader
  would, without executing anything.
* [graph] builds the transitive dependency graph for an archive.
* [policy] loads the ordered policy table and scores graphs against it.
* [audit] ties those together into a per-wheel analysis record, which
  [show] renders as a report.
* [repair] grafts non-whitelisted libraries into the archive, rewrites
  `DT_NEEDED`/`DT_RUNPATH` entries through [patcher], and [wheel]
  re-tags and repacks the archive deterministically.

State lives only for the duration of one `show` or `repair`
invocation; the input archive is never modified.
*/

pub mod arch;
pub mod audit;
pub mod cli;
pub mod elf;
pub mod error;
pub mod graph;
pub mod ldcache;
pub mod logging;
pub mod musl;
pub mod patcher;
pub mod policy;
pub mod repair;
pub mod resolver;
pub mod show;
pub mod testutil;
pub mod version;
pub mod wheel;

pub use error::{AuditError, Result};
