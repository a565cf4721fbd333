//! Name sanitization.
//!
//! Every identifier that ends up as a store path segment or as a container
//! engine argument goes through [`sanitize`]. Names are trimmed, folded to
//! lowercase where the engine requires it, and validated against a
//! conservative character set so no value can escape its directory.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{CoreError, CoreResult};

/// The kind of identifier being sanitized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    /// Application name, doubles as the image repository.
    Application,
    /// Version, doubles as the image tag.
    Version,
    Env,
    Worker,
    Username,
    /// Instance id, doubles as the container name.
    Instance,
}

impl NameKind {
    pub fn label(self) -> &'static str {
        match self {
            NameKind::Application => "application",
            NameKind::Version => "version",
            NameKind::Env => "env",
            NameKind::Worker => "worker",
            NameKind::Username => "username",
            NameKind::Instance => "instance",
        }
    }

    fn folds_case(self) -> bool {
        matches!(
            self,
            NameKind::Application | NameKind::Env | NameKind::Worker | NameKind::Username
        )
    }

    fn pattern(self) -> &'static Regex {
        match self {
            NameKind::Application | NameKind::Env | NameKind::Worker | NameKind::Username => {
                &LOWER
            }
            NameKind::Version => &TAG,
            NameKind::Instance => &CONTAINER,
        }
    }
}

static LOWER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{0,62}$").expect("valid regex"));

// Docker image tag grammar.
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid regex"));

// Docker container name grammar.
static CONTAINER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("valid regex"));

/// Sanitize `value` as a name of the given kind.
pub fn sanitize(kind: NameKind, value: &str) -> CoreResult<String> {
    let trimmed = value.trim();
    let name = if kind.folds_case() {
        trimmed.to_ascii_lowercase()
    } else {
        trimmed.to_string()
    };

    if name.contains("..") || !kind.pattern().is_match(&name) {
        return Err(CoreError::InvalidName {
            kind: kind.label(),
            value: value.to_string(),
        });
    }
    Ok(name)
}

pub fn application(value: &str) -> CoreResult<String> {
    sanitize(NameKind::Application, value)
}

pub fn version(value: &str) -> CoreResult<String> {
    sanitize(NameKind::Version, value)
}

pub fn env(value: &str) -> CoreResult<String> {
    sanitize(NameKind::Env, value)
}

pub fn worker(value: &str) -> CoreResult<String> {
    sanitize(NameKind::Worker, value)
}

pub fn username(value: &str) -> CoreResult<String> {
    sanitize(NameKind::Username, value)
}

pub fn instance(value: &str) -> CoreResult<String> {
    sanitize(NameKind::Instance, value)
}
