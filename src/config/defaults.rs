use super::*;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "::".to_string(),
            port: 9012,
            max_connections: 50,
            backlog: 5,
        }
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyAMA0".to_string(),
            baud_rate: 115_200,
            buffer_size: 4096,
            reopen_interval_ms: 5000,
        }
    }
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 502,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: String::new(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}
