// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("not an ELF file: {0}")]
    NotElf(String),

    #[error("malformed ELF file {0}: {1}")]
    MalformedElf(String, String),

    #[error("unsupported ELF class or machine in {0}")]
    UnsupportedElf(String),

    #[error("could not resolve needed library {soname} (needed by {dependent})")]
    Unresolved { soname: String, dependent: String },

    #[error("soname {soname} resolves to multiple paths: {first} and {second}")]
    SonameConflict {
        soname: String,
        first: String,
        second: String,
    },

    #[error("archive contains binaries for multiple architectures: {0} and {1}")]
    HeterogeneousArchive(String, String),

    #[error("archive requires {group}_{actual}, exceeding the {group}_{max} allowed by {policy}")]
    PolicyViolation {
        policy: String,
        group: String,
        actual: String,
        max: String,
    },

    #[error("archive references blacklisted symbol {symbol} from {library}")]
    BlacklistedSymbol { library: String, symbol: String },

    #[error("patcher failed on {path}: {stderr}")]
    PatcherFailed { path: String, stderr: String },

    #[error("strip failed on {path}: {stderr}")]
    StripFailed { path: String, stderr: String },

    #[error("no platform-specific ELF binaries found in archive")]
    NonPlatformWheel,

    #[error("invalid wheel archive: {0}")]
    InvalidWheel(String),

    #[error("invalid policy table: {0}")]
    InvalidPolicy(String),

    #[error("ld.so.cache parse error: {0}")]
    LdsoCache(String),

    #[error("no policy named '{0}' found")]
    UnknownPolicy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object file error: {0}")]
    Object(#[from] object::read::Error),
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, AuditError>;
