use powermonitor::config::LoggingConfig;
use powermonitor::logging::{
    LogContext, get_logger, get_logger_with_context, init_logging, parse_log_level,
};
use tracing::Level;

#[test]
fn console_only_logging_initializes_once() {
    let config = LoggingConfig {
        level: "debug".to_string(),
        ..LoggingConfig::default()
    };
    assert!(init_logging(&config).is_ok());
    // a restart calls it again with the same settings
    assert!(init_logging(&config).is_ok());

    let logger = get_logger_with_context(
        LogContext::new("meter").with_device("/dev/tcp/relay/2000"),
    );
    logger.info("P1 device opened");
    get_logger("server").debug("Listening");
}

#[test]
fn level_names_are_case_insensitive() {
    assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
    assert_eq!(parse_log_level("Warning").unwrap(), Level::WARN);
    assert!(parse_log_level("verbose").is_err());
}
