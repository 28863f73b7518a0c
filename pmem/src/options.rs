//! Options for mapping a backing file.
use std::env;

/// Environment variable overriding the persistent medium detection.
///
/// `1` treats every mapping as persistent memory, `0` treats none of them as such. This is mostly
/// useful for exercising the cache flush path on machines without a DAX file system.
pub const FORCE_PMEM_ENV: &str = "PMEM_IS_PMEM_FORCE";

/// How a backing file is opened and mapped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapOptions {
    /// Create the file if it does not exist yet.
    pub create: bool,
    /// Together with `create`, fail if the file already exists.
    pub exclusive: bool,
    /// Permission bits of a newly created file.
    pub mode: u32,
    /// Override medium detection. Takes precedence over [`FORCE_PMEM_ENV`].
    pub force_pmem: Option<bool>,
}

impl Default for MapOptions {
    fn default() -> Self {
        MapOptions {
            create: false,
            exclusive: false,
            mode: 0o666,
            force_pmem: None,
        }
    }
}

impl MapOptions {
    /// Options creating the file, or reusing it if it exists.
    pub fn create() -> Self {
        MapOptions {
            create: true,
            ..MapOptions::default()
        }
    }

    /// Options creating the file, failing if it exists.
    pub fn create_new() -> Self {
        MapOptions {
            create: true,
            exclusive: true,
            ..MapOptions::default()
        }
    }

    /// The effective medium override, consulting the environment if no explicit one was set.
    pub fn resolved_force_pmem(&self) -> Option<bool> {
        self.force_pmem.or_else(forced_from_env)
    }
}

fn forced_from_env() -> Option<bool> {
    let value = env::var_os(FORCE_PMEM_ENV)?;

    match value.to_str() {
        Some("1") => Some(true),
        Some("0") => Some(false),
        _ => {
            tracing::warn!(value = ?value, "ignoring unrecognized {FORCE_PMEM_ENV}");
            None
        }
    }
}
