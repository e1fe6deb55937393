//! GPU memory heuristics for picking an `EngineConfig` before a model load.
//!
//! Mirrors a memory-estimation tool that scaled known per-model profiles by
//! context length and, absent a profile, fell back to a size-from-name
//! heuristic. Ported here as pure, GPU-query-free arithmetic: the worker
//! supplies `total_memory_gb` itself (from its own engine backend) rather
//! than shelling out to `nvidia-smi`.

use std::collections::HashMap;

use crate::models::EngineConfig;

/// A known-good (or known-bad) memory profile for one model.
#[derive(Debug, Clone)]
pub struct ModelMemoryProfile {
    pub total_memory_gb: f32,
    pub max_model_len: u32,
    pub gpu_memory_utilization: f32,
    pub known_good: bool,
}

#[derive(Debug, Clone)]
pub struct ModelProfileTable {
    profiles: HashMap<String, ModelMemoryProfile>,
}

impl ModelProfileTable {
    /// Profiles carried over from prior benchmark runs of commonly deployed models.
    pub fn with_known_profiles() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            "google/gemma-3-4b-it".to_string(),
            ModelMemoryProfile {
                total_memory_gb: 10.95,
                max_model_len: 4096,
                gpu_memory_utilization: 0.90,
                known_good: true,
            },
        );
        profiles.insert(
            "meta-llama/Llama-3.2-1B-Instruct".to_string(),
            ModelMemoryProfile {
                total_memory_gb: 5.0,
                max_model_len: 4096,
                gpu_memory_utilization: 0.90,
                known_good: true,
            },
        );
        profiles.insert(
            "Qwen/Qwen3-4B-Instruct-2507".to_string(),
            ModelMemoryProfile {
                total_memory_gb: 14.66,
                max_model_len: 4096,
                gpu_memory_utilization: 0.85,
                known_good: false,
            },
        );
        Self { profiles }
    }

    pub fn empty() -> Self {
        Self { profiles: HashMap::new() }
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelMemoryProfile> {
        self.profiles.get(model_id)
    }

    /// Estimated total GPU memory a model needs at `max_model_len`, scaling
    /// a known profile linearly by context length, or falling back to a
    /// size-from-name heuristic with a 30% overhead for KV cache/CUDA graphs.
    pub fn estimate_memory_gb(&self, model_id: &str, max_model_len: u32) -> f32 {
        if let Some(profile) = self.profiles.get(model_id) {
            let scale = max_model_len as f32 / profile.max_model_len as f32;
            return profile.total_memory_gb * scale;
        }

        let model_lower = model_id.to_lowercase();
        let base_size = if model_lower.contains("1b") {
            2.5
        } else if model_lower.contains("3b") {
            6.0
        } else if model_lower.contains("4b") {
            8.0
        } else if model_lower.contains("7b") {
            14.0
        } else if model_lower.contains("12b") {
            24.0
        } else if model_lower.contains("13b") {
            26.0
        } else if model_lower.contains("20b") {
            40.0
        } else {
            10.0
        };

        let overhead_factor = 1.3_f32;
        let context_scale = max_model_len as f32 / 4096.0;
        base_size * overhead_factor * context_scale
    }
}

impl Default for ModelProfileTable {
    fn default() -> Self {
        Self::with_known_profiles()
    }
}

pub struct MemoryOptimizer {
    profiles: ModelProfileTable,
    total_memory_gb: f32,
}

impl MemoryOptimizer {
    pub fn new(profiles: ModelProfileTable, total_memory_gb: f32) -> Self {
        Self { profiles, total_memory_gb }
    }

    /// Produces a conservative `EngineConfig` for `model_id`, shrinking
    /// `gpu_memory_utilization` and `max_model_len` as the estimated memory
    /// ratio against `total_memory_gb` grows.
    pub fn optimize(&self, model_id: &str, max_model_len: u32) -> EngineConfig {
        let estimated = self.profiles.estimate_memory_gb(model_id, max_model_len);
        let ratio = estimated / self.total_memory_gb;

        let (mut gpu_util, mut use_max_model_len, mut enforce_eager, mut kv_cache_dtype) =
            if ratio > 0.95 {
                (0.80, max_model_len.min(2048), true, Some("fp8".to_string()))
            } else if ratio > 0.90 {
                (0.80, max_model_len, true, None)
            } else if ratio > 0.80 {
                (0.85, max_model_len, false, None)
            } else {
                (0.90, max_model_len, false, None)
            };

        if let Some(profile) = self.profiles.get(model_id) {
            if !profile.known_good {
                gpu_util = gpu_util.min(profile.gpu_memory_utilization);
                enforce_eager = true;
            }
        }

        if gpu_util < 0.85 && kv_cache_dtype.is_none() && ratio > 0.95 {
            kv_cache_dtype = Some("fp8".to_string());
        }

        EngineConfig {
            model_id: model_id.to_string(),
            gpu_memory_utilization: gpu_util,
            max_model_len: use_max_model_len,
            enforce_eager,
            kv_cache_dtype,
        }
    }

    /// A more conservative retry config after an OOM: halves `max_model_len`
    /// and drops `gpu_memory_utilization` by 0.1, forcing eager execution.
    pub fn shrink(&self, previous: &EngineConfig) -> EngineConfig {
        EngineConfig {
            model_id: previous.model_id.clone(),
            gpu_memory_utilization: (previous.gpu_memory_utilization - 0.1).max(0.5),
            max_model_len: (previous.max_model_len / 2).max(512),
            enforce_eager: true,
            kv_cache_dtype: previous.kv_cache_dtype.clone().or_else(|| Some("fp8".to_string())),
        }
    }
}
