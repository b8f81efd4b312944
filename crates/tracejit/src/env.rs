use std::env;
use std::sync::OnceLock;

static TRACEJIT_EAGER: OnceLock<bool> = OnceLock::new();
static TRACEJIT_STRICT_LINT: OnceLock<bool> = OnceLock::new();
static TRACEJIT_PASS_STATS: OnceLock<bool> = OnceLock::new();
static TRACEJIT_DISABLE_OPT: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(cell: &OnceLock<bool>, name: &str) -> bool {
    *cell.get_or_init(|| match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Optimize at construction instead of on the first run.
pub(crate) fn eager_enabled() -> bool {
    flag(&TRACEJIT_EAGER, "TRACEJIT_EAGER")
}

pub(crate) fn strict_lint_enabled() -> bool {
    flag(&TRACEJIT_STRICT_LINT, "TRACEJIT_STRICT_LINT")
}

pub(crate) fn pass_stats_enabled() -> bool {
    flag(&TRACEJIT_PASS_STATS, "TRACEJIT_PASS_STATS")
}

pub(crate) fn optimization_disabled() -> bool {
    flag(&TRACEJIT_DISABLE_OPT, "TRACEJIT_DISABLE_OPT")
}
