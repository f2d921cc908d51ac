//! Runtime-configurable checks and tuning parameters.
//!
//! All values have sensible defaults. Override via environment variables or by
//! constructing a custom `GpuCrConfig`.

use std::time::Duration;

/// Toggles for the optional GPU compatibility checks used when matching
/// checkpointed GPUs to local ones. Every check defaults to enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchChecks {
    pub fw_version: bool,
    pub sdma_fw_version: bool,
    pub caches_count: bool,
    pub num_gws: bool,
    pub vram_size: bool,
    pub numa: bool,
}

impl Default for MatchChecks {
    fn default() -> Self {
        Self {
            fw_version: true,
            sdma_fw_version: true,
            caches_count: true,
            num_gws: true,
            vram_size: true,
            numa: true,
        }
    }
}

impl MatchChecks {
    /// Every check disabled; only the mandatory device properties must match.
    pub fn none() -> Self {
        Self {
            fw_version: false,
            sdma_fw_version: false,
            caches_count: false,
            num_gws: false,
            vram_size: false,
            numa: false,
        }
    }

    /// Environment variable names, paired with the toggle they control.
    fn vars(&mut self) -> [(&'static str, &mut bool); 6] {
        [
            ("KFD_FW_VER_CHECK", &mut self.fw_version),
            ("KFD_SDMA_FW_VER_CHECK", &mut self.sdma_fw_version),
            ("KFD_CACHES_COUNT_CHECK", &mut self.caches_count),
            ("KFD_NUM_GWS_CHECK", &mut self.num_gws),
            ("KFD_VRAM_SIZE_CHECK", &mut self.vram_size),
            ("KFD_NUMA_CHECK", &mut self.numa),
        ]
    }

    /// Apply overrides from a variable lookup. Unparseable values are logged
    /// and leave the previous value in place.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (var, slot) in self.vars() {
            if let Some(raw) = lookup(var) {
                match parse_bool(&raw) {
                    Some(v) => *slot = v,
                    None => tracing::warn!(
                        var,
                        value = %raw,
                        "ignoring invalid value, expecting YES/NO"
                    ),
                }
            }
            tracing::info!(var, enabled = *slot, "match check");
        }
    }
}

/// Accepts `1`/`YES` and `0`/`NO`, case-insensitive.
fn parse_bool(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if raw == "1" || raw.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if raw == "0" || raw.eq_ignore_ascii_case("no") {
        Some(false)
    } else {
        None
    }
}

/// Tuning for the buffer content transfer engine.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Try the copy-engine path before falling back to CPU copies.
    pub hardware_copy: bool,

    /// Upper bound on waiting for one copy-engine submission.
    pub fence_timeout: Duration,

    /// Size of the host-pinned staging window used by the copy engine.
    /// Buffers larger than this are moved in several submissions.
    pub staging_bytes: u64,

    /// Largest span a single copy-engine packet may move.
    pub max_copy_span: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            hardware_copy: true,
            fence_timeout: Duration::from_secs(10),
            staging_bytes: 64 * 1024 * 1024, // 64 MiB
            max_copy_span: 1 << 21,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct GpuCrConfig {
    pub checks: MatchChecks,
    pub transfer: TransferConfig,
}

impl GpuCrConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `KFD_FW_VER_CHECK`, `KFD_SDMA_FW_VER_CHECK`, `KFD_CACHES_COUNT_CHECK`,
    ///   `KFD_NUM_GWS_CHECK`, `KFD_VRAM_SIZE_CHECK`, `KFD_NUMA_CHECK`
    /// - `GPUCR_HW_COPY` (YES/NO)
    /// - `GPUCR_FENCE_TIMEOUT_MS`
    /// - `GPUCR_STAGING_BYTES`
    /// - `GPUCR_SDMA_MAX_SPAN`
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        cfg.checks.apply_overrides(&lookup);

        if let Some(v) = lookup("GPUCR_HW_COPY") {
            match parse_bool(&v) {
                Some(b) => cfg.transfer.hardware_copy = b,
                None => tracing::warn!(value = %v, "ignoring invalid GPUCR_HW_COPY"),
            }
        }
        if let Some(v) = lookup("GPUCR_FENCE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.transfer.fence_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(v) = lookup("GPUCR_STAGING_BYTES") {
            if let Ok(n) = v.parse::<u64>()
                && n > 0
            {
                cfg.transfer.staging_bytes = n;
            }
        }
        if let Some(v) = lookup("GPUCR_SDMA_MAX_SPAN") {
            // Packet byte counts are 22 bits wide.
            match v.parse::<u64>() {
                Ok(n) if n > 0 && n < (1 << 22) => cfg.transfer.max_copy_span = n,
                _ => tracing::warn!(value = %v, "ignoring invalid GPUCR_SDMA_MAX_SPAN"),
            }
        }

        cfg
    }
}
