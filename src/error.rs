use thiserror::Error;

/// A configured topic that cannot be used. The topic is dropped from its
/// group; the group keeps running with what is left.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("topic {topic:?} is not of the form device/control")]
    MalformedTopic { topic: String },
    #[error("device {device:?} does not exist in the system")]
    MissingDevice { device: String, topic: String },
    #[error("device {device:?} has no control {control:?}")]
    MissingControl {
        device: String,
        control: String,
        topic: String,
    },
}

impl ConfigurationError {
    /// The offending topic as it was written in the configuration.
    pub fn topic(&self) -> &str {
        match self {
            ConfigurationError::MalformedTopic { topic }
            | ConfigurationError::MissingDevice { topic, .. }
            | ConfigurationError::MissingControl { topic, .. } => topic,
        }
    }
}

/// The configuration file cannot be loaded. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_topic() {
        let err = ConfigurationError::MissingControl {
            device: "wb-mr6c_1".to_string(),
            control: "K9".to_string(),
            topic: "wb-mr6c_1/K9".to_string(),
        };
        assert_eq!(err.topic(), "wb-mr6c_1/K9");
        assert_eq!(
            err.to_string(),
            "device \"wb-mr6c_1\" has no control \"K9\""
        );
    }
}
