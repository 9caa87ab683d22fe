//! Process-wide runtime settings: accelerator environment variables and the
//! float32 matmul precision knob.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Empty value disables TLS certificate bundle verification for outbound HTTP.
pub const TLS_BUNDLE_VAR: &str = "CURL_CA_BUNDLE";
/// Allocator configuration for the accelerator memory pool.
pub const ALLOC_CONF_VAR: &str = "PYTORCH_CUDA_ALLOC_CONF";
/// Largest block the accelerator allocator may split, in MB.
pub const MAX_SPLIT_SIZE_MB: usize = 64;

/// Allocator configuration string bounding the split size.
pub fn alloc_conf(max_split_size_mb: usize) -> String {
    format!("max_split_size_mb:{max_split_size_mb}")
}

/// Export the accelerator environment for child tooling and backends.
///
/// # Safety
///
/// Mutates the process environment. Must be called before any other thread
/// is spawned (see [`std::env::set_var`]).
pub unsafe fn apply_process_env() {
    // SAFETY: the caller guarantees the process is still single-threaded.
    unsafe {
        std::env::set_var(TLS_BUNDLE_VAR, "");
        std::env::set_var(ALLOC_CONF_VAR, alloc_conf(MAX_SPLIT_SIZE_MB));
    }
    tracing::debug!(
        alloc_conf = %alloc_conf(MAX_SPLIT_SIZE_MB),
        "Applied accelerator environment"
    );
}

/// Internal precision of float32 matrix multiplications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MatmulPrecision {
    /// Full float32 accumulation.
    Highest = 0,
    /// TF32-class accumulation; trades exactness for throughput.
    High = 1,
    /// bfloat16-class accumulation.
    Medium = 2,
}

static MATMUL_PRECISION: AtomicU8 = AtomicU8::new(MatmulPrecision::Highest as u8);

pub fn set_float32_matmul_precision(precision: MatmulPrecision) {
    MATMUL_PRECISION.store(precision as u8, Ordering::SeqCst);
}

pub fn float32_matmul_precision() -> MatmulPrecision {
    match MATMUL_PRECISION.load(Ordering::SeqCst) {
        1 => MatmulPrecision::High,
        2 => MatmulPrecision::Medium,
        _ => MatmulPrecision::Highest,
    }
}
