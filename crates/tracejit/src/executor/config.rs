use std::sync::Arc;

use super::cache::OptimizedGraphCache;
use crate::pipeline::PipelineConfig;

/// When the optimization pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizePolicy {
    /// On the first `run`.
    #[default]
    Lazy,
    /// While constructing the executor.
    Eager,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Run the pipeline at all. When `false` every call interprets the unoptimized graph.
    pub optimize: bool,
    pub policy: OptimizePolicy,
    /// Treat lint failures during optimization as fatal instead of falling back.
    pub strict_lint: bool,
    pub pipeline: PipelineConfig,
    /// Optional shared cache of optimized graphs.
    pub cache: Option<Arc<OptimizedGraphCache>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            optimize: true,
            policy: OptimizePolicy::Lazy,
            strict_lint: cfg!(debug_assertions),
            pipeline: PipelineConfig::default(),
            cache: None,
        }
    }
}

impl ExecutorConfig {
    /// Defaults adjusted by `TRACEJIT_EAGER`, `TRACEJIT_STRICT_LINT`, `TRACEJIT_PASS_STATS`
    /// and `TRACEJIT_DISABLE_OPT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if crate::env::eager_enabled() {
            config.policy = OptimizePolicy::Eager;
        }
        if crate::env::strict_lint_enabled() {
            config.strict_lint = true;
            config.pipeline.lint_after_each_pass = true;
        }
        if crate::env::optimization_disabled() {
            config.optimize = false;
        }
        config.pipeline.log_stats |= crate::env::pass_stats_enabled();
        config
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_policy(mut self, policy: OptimizePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_strict_lint(mut self, strict: bool) -> Self {
        self.strict_lint = strict;
        self
    }

    pub fn with_lowering(mut self, lower: bool) -> Self {
        self.pipeline.lower_for_export = lower;
        self
    }

    pub fn with_cache(mut self, cache: Arc<OptimizedGraphCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}
