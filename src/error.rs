use thiserror::Error;

/// Failures surfaced through the public entry points.
///
/// Each variant carries a stable string code so the host binding layer can
/// dispatch on it without matching Rust enums.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("server is running on port {running}; stop it before switching to {requested}")]
    PortChangeWhileRunning { running: u16, requested: u16 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::PortInUse { .. } => "PORT_IN_USE",
            ProxyError::PortChangeWhileRunning { .. } => "PORT_CHANGE_WHILE_RUNNING",
            ProxyError::Io(_) => "IO",
        }
    }
}
