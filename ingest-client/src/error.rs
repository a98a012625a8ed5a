use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    /// The polling budget ran out. The session may still finish on the server.
    #[error("Session still running after {attempts} status checks")]
    ClientTimeout { attempts: u32 },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Server rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Unreadable server response: {0}")]
    Decode(String),
    #[error("Observation cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for PollError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}
