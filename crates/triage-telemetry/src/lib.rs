use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: String,
    /// Per-module level overrides (e.g. "triage_engine" => "debug").
    pub module_levels: Vec<(String, String)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string built from the configured levels.
    /// Unparseable levels fall back to `info`.
    pub fn filter_directives(&self) -> String {
        let mut filter = normalize_level(&self.log_level);
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, normalize_level(level)));
        }
        filter
    }
}

fn normalize_level(level: &str) -> String {
    level
        .parse::<Level>()
        .unwrap_or(Level::INFO)
        .to_string()
        .to_lowercase()
}

/// Returned by `init_telemetry`; reports what was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    filter: String,
    installed: bool,
}

impl TelemetryGuard {
    /// The effective filter directives.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// False when another global subscriber was already set.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let directives = config.filter_directives();
    let (env_filter, filter) = match EnvFilter::try_from_default_env() {
        Ok(env) => {
            let shown = env.to_string();
            (env, shown)
        }
        Err(_) => (EnvFilter::new(&directives), directives),
    };

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .is_ok();

    TelemetryGuard { filter, installed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_info() {
        assert_eq!(TelemetryConfig::default().filter_directives(), "info");
    }

    #[test]
    fn module_levels_are_appended() {
        let config = TelemetryConfig {
            log_level: "WARN".into(),
            module_levels: vec![
                ("triage_engine".into(), "debug".into()),
                ("triage_llm".into(), "nonsense".into()),
            ],
            json: false,
        };
        assert_eq!(
            config.filter_directives(),
            "warn,triage_engine=debug,triage_llm=info"
        );
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: TelemetryConfig = serde_json::from_str(r#"{"log_level": "debug"}"#).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.json);
        assert!(config.module_levels.is_empty());
    }

    #[test]
    fn second_init_does_not_panic() {
        let config = TelemetryConfig::default();
        let first = init_telemetry(&config);
        let second = init_telemetry(&config);
        assert!(!(first.installed() && second.installed()));
        assert!(!second.filter().is_empty());
    }
}
