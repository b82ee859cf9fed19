//! The `utils` module provides shared definitions used across the broker:
//! the public error taxonomy and logging initialisation.

pub mod error;
pub mod logging;

pub use error::BrokerError;

#[cfg(test)]
mod tests {
    use super::logging;
    use tracing::Level;

    #[test]
    fn logging_init_is_repeatable() {
        // Should not panic
        logging::init("info");
        assert!(!logging::init("debug"));
    }

    #[test]
    fn parse_level_accepts_common_names() {
        assert_eq!(logging::parse_level("ERROR"), Level::ERROR);
        assert_eq!(logging::parse_level("warning"), Level::WARN);
        assert_eq!(logging::parse_level(" debug "), Level::DEBUG);
        assert_eq!(logging::parse_level("trace"), Level::TRACE);
        assert_eq!(logging::parse_level("nonsense"), Level::INFO);
    }
}
