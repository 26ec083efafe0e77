use super::{Config, ConfigError, KNOWN_OUTPUT_TYPES};
use url::Url;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate output endpoint URL
        let endpoint = Url::parse(&self.output_endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!(
                "Invalid output endpoint URL '{}': {}",
                self.output_endpoint, e
            ))
        })?;
        if endpoint.scheme() != "http" {
            return Err(ConfigError::InvalidUrl(format!(
                "Output endpoint '{}' must use http",
                self.output_endpoint
            )));
        }
        if endpoint.host_str().is_none() {
            return Err(ConfigError::InvalidUrl(format!(
                "Output endpoint '{}' has no host",
                self.output_endpoint
            )));
        }

        if !KNOWN_OUTPUT_TYPES.contains(&self.output.output_type.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Unknown output type '{}'. Valid values: {}",
                self.output_type,
                KNOWN_OUTPUT_TYPES.join(", ")
            )));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "Flush interval must be greater than 0".to_string(),
            ));
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "Output timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_in_flight_batches == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max in-flight batches must be greater than 0".to_string(),
            ));
        }

        if self.max_retries == u32::MAX {
            return Err(ConfigError::InvalidConfig(
                "Max retries is out of range".to_string(),
            ));
        }

        if self.http_receiver_port == Some(self.receiver_port) && self.receiver_port != 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "HTTP receiver port {} collides with the gRPC receiver port",
                self.receiver_port
            )));
        }

        if self.buffer_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Buffer path must not be empty".to_string(),
            ));
        }

        self.receiver.grpc_addr()?;
        self.receiver.http_addr()?;

        Ok(())
    }
}
