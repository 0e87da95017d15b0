use tracing::Level;

/// Engine switches, fixed for the lifetime of a [`crate::rtti::Runtime`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Sound mode: static tuple deltas are always zero, extra positions are
    /// recovered by the runtime structural check instead.
    pub zero_delta_tuples: bool,
    /// Record the `any`-absorption delta on a value's tag when it is coerced
    /// into `any`.
    pub widen_on_any: bool,
    pub log_level: Level,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            zero_delta_tuples: false,
            widen_on_any: true,
            log_level: Level::WARN,
        }
    }
}

impl EngineConfig {
    pub fn with_zero_delta_tuples(mut self, on: bool) -> Self {
        self.zero_delta_tuples = on;
        self
    }

    pub fn with_widen_on_any(mut self, on: bool) -> Self {
        self.widen_on_any = on;
        self
    }

    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Defaults overridden by `RTTI_SOUND` and `RTTI_LOG`.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("RTTI_SOUND").ok().as_deref(),
            std::env::var("RTTI_LOG").ok().as_deref(),
        )
    }

    pub(crate) fn from_vars(sound: Option<&str>, log: Option<&str>) -> Self {
        let mut config = EngineConfig::default();

        if let Some(s) = sound {
            let s = s.trim().to_ascii_lowercase();
            config.zero_delta_tuples = matches!(s.as_str(), "1" | "true" | "yes" | "on");
        }

        // unparseable levels keep the default
        if let Some(level) = log.and_then(|l| l.trim().parse::<Level>().ok()) {
            config.log_level = level;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = EngineConfig::default();
        assert!(!c.zero_delta_tuples);
        assert!(c.widen_on_any);
        assert_eq!(c.log_level, Level::WARN);
    }

    #[test]
    fn reads_variables() {
        let c = EngineConfig::from_vars(Some("yes"), Some("debug"));
        assert!(c.zero_delta_tuples);
        assert_eq!(c.log_level, Level::DEBUG);

        let c = EngineConfig::from_vars(Some("0"), Some("loud"));
        assert!(!c.zero_delta_tuples);
        assert_eq!(c.log_level, Level::WARN);
    }

    #[test]
    fn builders() {
        let c = EngineConfig::default()
            .with_widen_on_any(false)
            .with_log_level(Level::TRACE);
        assert!(!c.widen_on_any);
        assert_eq!(c.log_level, Level::TRACE);
    }
}
