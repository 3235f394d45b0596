// =============================================================================
// Typed error taxonomy
// =============================================================================
//
// Only two error families need structured variants: configuration problems
// (fatal at startup) and broker-level failures (surfaced as rejection events
// or retried on the next tick). Everything else flows through `anyhow` and is
// converted into pipeline events by the owning service.

use thiserror::Error;

/// Configuration validation failures. Any of these aborts startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one symbol must be configured")]
    NoSymbols,

    #[error("at least one timeframe must be configured")]
    NoTimeframes,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Broker adapter failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker rejected request: retcode={retcode} {comment}")]
    Rejected { retcode: i32, comment: String },

    #[error("no price available for {symbol}")]
    NoPrice { symbol: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let e = ConfigError::invalid("risk.daily_loss_limit", "must be >= 0");
        assert_eq!(
            e.to_string(),
            "invalid value for risk.daily_loss_limit: must be >= 0"
        );
    }

    #[test]
    fn broker_error_display() {
        let e = BrokerError::Rejected {
            retcode: 10013,
            comment: "invalid volume".to_string(),
        };
        assert!(e.to_string().contains("10013"));
        assert!(e.to_string().contains("invalid volume"));
    }
}
