//! Logging setup for sandvisor.
//!
//! Set the `SANDVISOR_DEBUG` environment variable to enable verbose logging:
//! - `SANDVISOR_DEBUG=1` - Enable all debug output
//! - `SANDVISOR_DEBUG=vcpu` - Enable only VCPU run-loop logs
//! - `SANDVISOR_DEBUG=hypercall` - Enable only hypercall and sandbox logs
//! - `SANDVISOR_DEBUG=vcpu,memory,loader` - Enable multiple categories
//!
//! `RUST_LOG` takes precedence when it is set.

use tracing_subscriber::EnvFilter;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Vcpu,
    Hypercall,
    Memory,
    Loader,
}

impl DebugCategory {
    const ALL: [DebugCategory; 4] = [
        DebugCategory::Vcpu,
        DebugCategory::Hypercall,
        DebugCategory::Memory,
        DebugCategory::Loader,
    ];

    fn keyword(self) -> &'static str {
        match self {
            DebugCategory::Vcpu => "vcpu",
            DebugCategory::Hypercall => "hypercall",
            DebugCategory::Memory => "memory",
            DebugCategory::Loader => "loader",
        }
    }

    /// Module paths whose events belong to this category.
    fn targets(self) -> &'static [&'static str] {
        match self {
            DebugCategory::Vcpu => &[
                "sandvisor::vcpu",
                "sandvisor::runner",
                "sandvisor::machine",
                "sandvisor::backend",
                "sandvisor::device",
            ],
            DebugCategory::Hypercall => &["sandvisor::hypercall"],
            DebugCategory::Memory => &["sandvisor::memory", "sandvisor::translate"],
            DebugCategory::Loader => &["sandvisor::loader", "sandvisor::arch"],
        }
    }
}

/// Categories named by a `SANDVISOR_DEBUG` value.
fn categories(val: &str) -> Vec<DebugCategory> {
    let val = val.trim().to_lowercase();
    if val == "1" || val == "all" {
        return DebugCategory::ALL.to_vec();
    }
    DebugCategory::ALL
        .into_iter()
        .filter(|c| val.split(',').any(|part| part.trim() == c.keyword()))
        .collect()
}

/// Build the filter directives for a `SANDVISOR_DEBUG` value.
pub fn directives(val: Option<&str>) -> String {
    let mut out = String::from("info");
    for category in val.map(categories).unwrap_or_default() {
        for target in category.targets() {
            out.push(',');
            out.push_str(target);
            out.push_str("=debug");
        }
    }
    out
}

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => {
            let val = std::env::var("SANDVISOR_DEBUG").ok();
            EnvFilter::new(directives(val.as_deref()))
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
