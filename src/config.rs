use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::SandboxLimits;

/// Key of the persisted script registry map.
pub const KEY_SCRIPTS: &str = "scripts";
/// Key of the persisted token entry map.
pub const KEY_TOKENS: &str = "tokens";
/// Key of the ordered list of applied migration indexes.
pub const KEY_MIGRATIONS: &str = "migrations";
/// Prefix of the legacy per-script last-execution records.
pub const LEGACY_LAST_EXECUTED_PREFIX: &str = "lastExecuted-";
/// Prefix under which the cross-script `global` namespace lives.
pub const GLOBAL_NS_PREFIX: &str = "global-";
/// Prefix of script ids seeded from the bundled examples.
pub const EXAMPLE_SCRIPT_PREFIX: &str = "example-";
/// Sentinel id used for ad-hoc code that has no stored definition.
pub const INLINE_SCRIPT_ID: &str = "__inline__";

/// Wall-clock budget for one script run.
pub const EXECUTION_BUDGET: Duration = Duration::from_secs(30);
/// Buffered capacity of the realtime log broadcast channel.
pub const REALTIME_CHANNEL_CAPACITY: usize = 256;

/// Host-supplied runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding legacy one-file-per-script sources, imported on
    /// first boot. `None` skips legacy discovery entirely.
    pub legacy_scripts_dir: Option<PathBuf>,
    /// Seed the bundled example scripts when no registry exists yet.
    pub seed_examples: bool,
    /// Sandbox execution limits.
    pub limits: SandboxLimits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            legacy_scripts_dir: None,
            seed_examples: true,
            limits: SandboxLimits::default(),
        }
    }
}
