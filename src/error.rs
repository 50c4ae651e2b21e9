//! Error types for the bridge.

use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge error types.
#[derive(Error, Debug)]
pub enum BridgeError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Unsupported configuration schema version
    #[error("Unsupported config version: {found} (supported: {supported:?})")]
    UnsupportedConfigVersion { found: u32, supported: Vec<u32> },

    /// Device not found
    #[error("Device not found: {device_key}")]
    DeviceNotFound { device_key: String },

    /// Register group not found
    #[error("Register group not found: {group_key} on device {device_key}")]
    GroupNotFound { device_key: String, group_key: String },

    // =========================================================================
    // Gateway transport errors
    // =========================================================================
    /// Broker connection lost
    #[error("Broker connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// Publish to the broker failed
    #[error("Publish failed on topic {topic}: {reason}")]
    PublishFailed { topic: String, reason: String },

    /// No response arrived for a Modbus transaction within the timeout
    #[error("Response timeout for slave {slave}, function {function:#04x}")]
    ResponseTimeout { slave: u8, function: u8 },

    // =========================================================================
    // Modbus protocol errors
    // =========================================================================
    /// Frame shorter than the minimum valid length
    #[error("Short Modbus frame: {len} bytes")]
    ShortFrame { len: usize },

    /// CRC-16 did not validate
    #[error("CRC mismatch: expected {expected:04X}, got {actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Response slave id or function code did not match the pending request
    #[error("Unexpected response: expected slave {expected_slave} fn {expected_fn:#04x}, got slave {actual_slave} fn {actual_fn:#04x}")]
    UnexpectedResponse {
        expected_slave: u8,
        expected_fn: u8,
        actual_slave: u8,
        actual_fn: u8,
    },

    /// Response payload length did not match the expected register count
    #[error("Wrong payload length: expected {expected} bytes, got {actual}")]
    WrongPayloadLength { expected: usize, actual: usize },

    /// Function code other than 0x03 is unsupported by this bridge
    #[error("Unsupported function code: {0:#04x}")]
    UnsupportedFunction(u8),

    // =========================================================================
    // Validation errors
    // =========================================================================
    /// Decoded value is NaN or infinite
    #[error("Non-finite value for {device_key}/{sensor_key}")]
    NonFiniteValue { device_key: String, sensor_key: String },

    /// Decoded value fell outside its configured bounds
    #[error("Value out of bounds for {device_key}/{sensor_key}: {value} not in [{min}, {max}]")]
    OutOfBounds {
        device_key: String,
        sensor_key: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// A monotonic (energy) lane decreased
    #[error("Monotonicity breach for {device_key}/{sensor_key}: {value} < previous {previous}")]
    MonotonicityBreach {
        device_key: String,
        sensor_key: String,
        value: f64,
        previous: f64,
    },

    /// Rate of change exceeded the configured maximum
    #[error("Excessive rate of change for {device_key}/{sensor_key}: {rate} > max {max}")]
    ExcessiveRateOfChange {
        device_key: String,
        sensor_key: String,
        rate: f64,
        max: f64,
    },

    // =========================================================================
    // Expression evaluator errors
    // =========================================================================
    /// Expression failed to parse
    #[error("Expression parse error in formula `{formula}`: {reason}")]
    ExpressionParse { formula: String, reason: String },

    /// An identifier in a formula did not resolve
    #[error("Unknown identifier `{name}` in formula `{formula}`")]
    UnknownIdentifier { name: String, formula: String },

    /// Division by zero during evaluation
    #[error("Division by zero in formula `{formula}`")]
    DivisionByZero { formula: String },

    /// sqrt of a negative number during evaluation
    #[error("sqrt of negative value in formula `{formula}`")]
    NegativeSqrt { formula: String },

    // =========================================================================
    // Publisher errors
    // =========================================================================
    /// Broker disconnected while publishing
    #[error("Publisher disconnected")]
    PublisherDisconnected,

    /// JSON serialization of a publish payload failed
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Circuit breaker
    // =========================================================================
    /// The circuit breaker is open and is fast-failing calls
    #[error("Circuit open: {reason}")]
    CircuitOpen { reason: String },

    // =========================================================================
    // Internal
    // =========================================================================
    /// Internal invariant violated
    #[error("Internal error: {reason}")]
    Internal { reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error
    #[error("Channel send error")]
    ChannelSend,

    /// Channel receive error
    #[error("Channel receive error")]
    ChannelReceive,
}

impl BridgeError {
    /// Returns the error code used for bridge diagnostic payloads.
    pub fn error_code(&self) -> u16 {
        match self {
            Self::InvalidConfig { .. } => 300,
            Self::UnsupportedConfigVersion { .. } => 301,
            Self::DeviceNotFound { .. } => 302,
            Self::GroupNotFound { .. } => 303,

            Self::ConnectionLost { .. } => 100,
            Self::PublishFailed { .. } => 101,
            Self::ResponseTimeout { .. } => 102,

            Self::ShortFrame { .. } => 200,
            Self::CrcMismatch { .. } => 201,
            Self::UnexpectedResponse { .. } => 202,
            Self::WrongPayloadLength { .. } => 203,
            Self::UnsupportedFunction(_) => 204,

            Self::NonFiniteValue { .. } => 400,
            Self::OutOfBounds { .. } => 401,
            Self::MonotonicityBreach { .. } => 402,
            Self::ExcessiveRateOfChange { .. } => 403,

            Self::ExpressionParse { .. } => 500,
            Self::UnknownIdentifier { .. } => 501,
            Self::DivisionByZero { .. } => 502,
            Self::NegativeSqrt { .. } => 503,

            Self::PublisherDisconnected => 600,
            Self::Serialization(_) => 601,

            Self::CircuitOpen { .. } => 700,

            Self::Internal { .. } => 900,
            Self::Io(_) => 901,
            Self::ChannelSend => 902,
            Self::ChannelReceive => 903,
        }
    }

    /// Returns whether this error represents a transient condition worth
    /// retrying on the next scheduler tick rather than a configuration fault.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. }
                | Self::ResponseTimeout { .. }
                | Self::CrcMismatch { .. }
                | Self::ShortFrame { .. }
                | Self::UnexpectedResponse { .. }
                | Self::WrongPayloadLength { .. }
                | Self::CircuitOpen { .. }
        )
    }
}
