//! Environment-driven configuration, read once at startup.
//!
//! Keeps `std::env::var` calls in one place instead of scattering them across
//! the compiler and launch-engine modules.

/// Debug-dump categories recognised in `FUSION_EXECUTOR_DEBUG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugDump {
    Source,
    BankConflict,
    Assembly,
    LaunchParams,
    KernelArgs,
    IndexType,
    Occupancy,
}

impl DebugDump {
    fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "source" => Some(DebugDump::Source),
            "bank_conflict" => Some(DebugDump::BankConflict),
            "assembly" => Some(DebugDump::Assembly),
            "launch_params" => Some(DebugDump::LaunchParams),
            "kernel_args" => Some(DebugDump::KernelArgs),
            "index_type" => Some(DebugDump::IndexType),
            "occupancy" => Some(DebugDump::Occupancy),
            _ => None,
        }
    }
}

/// Parsed configuration for the current process.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Per-fusion-id external source override paths, indexed by fusion id.
    pub external_src: Vec<String>,
    pub debug_dumps: Vec<DebugDump>,
    /// Process-wide opt-in to the zero-init buffer pool for intermediates
    /// that don't themselves require reset-to-zero (SPEC_FULL §4.4).
    pub zero_pool_opt_in: bool,
}

impl Config {
    /// Reads `EXTERNAL_SRC`, `FUSION_EXECUTOR_DEBUG` and
    /// `FUSION_EXECUTOR_POOL_OPT_IN` from the process environment. Unknown
    /// debug tokens are ignored with a warning rather than failing -- this is
    /// a debugging aid, not a contract (SPEC_FULL §9).
    pub fn from_env() -> Self {
        let external_src = std::env::var("EXTERNAL_SRC")
            .map(|raw| raw.split(',').map(|s| s.to_string()).collect())
            .unwrap_or_default();

        let debug_dumps = std::env::var("FUSION_EXECUTOR_DEBUG")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|tok| {
                        let parsed = DebugDump::parse(tok);
                        if parsed.is_none() && !tok.trim().is_empty() {
                            log::warn!("[Config] unrecognised debug dump token '{}'", tok);
                        }
                        parsed
                    })
                    .collect()
            })
            .unwrap_or_default();

        let zero_pool_opt_in = std::env::var("FUSION_EXECUTOR_POOL_OPT_IN")
            .map(|raw| matches!(raw.trim(), "1" | "true"))
            .unwrap_or(false);

        Config {
            external_src,
            debug_dumps,
            zero_pool_opt_in,
        }
    }

    /// The external-source override for the n-th fusion, if one was given and
    /// the path is non-empty. A missing or empty entry falls back to the
    /// generated source, with a warning (SPEC_FULL §6).
    pub fn external_src_for(&self, fusion_id: usize) -> Option<&str> {
        match self.external_src.get(fusion_id) {
            Some(path) if !path.is_empty() => Some(path.as_str()),
            Some(_) => {
                log::warn!(
                    "[Config] EXTERNAL_SRC entry for fusion {} is empty, using generated source",
                    fusion_id
                );
                None
            }
            None => None,
        }
    }

    pub fn dumps(&self, kind: DebugDump) -> bool {
        self.debug_dumps.contains(&kind)
    }
}
