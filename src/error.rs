//! Application error type.
//!
//! Errors carry the process exit code they map to. The codes double as the
//! error taxonomy of the pipeline:
//!
//! - `2`: configuration (weights, manifests, scans directory, CLI values)
//! - `3`: subject input (missing or unreadable volume)
//! - `4`: inference/runtime (toolkit failure, timeout, malformed output)

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_INPUT: u8 = 3;
pub const EXIT_RUNTIME: u8 = 4;

#[derive(Clone, PartialEq, Eq)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(EXIT_CONFIG, message)
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::new(EXIT_INPUT, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(EXIT_RUNTIME, message)
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_config(&self) -> bool {
        self.exit_code == EXIT_CONFIG
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}
