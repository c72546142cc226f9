use thiserror::Error;

use crate::config::ConfigError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help; nothing has been observed by the peer.
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transience::Permanent => "permanent",
            Transience::Retryable => "retryable",
            Transience::Unknown => "unknown",
        }
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Top-level error for fallible crate entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Config(_) => Transience::Permanent,
            Error::Io(_) => Transience::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_permanent() {
        let err = Error::Config(ConfigError::Parse {
            path: "bellwether.toml".into(),
            message: "expected table".to_string(),
        });
        assert_eq!(err.transience(), Transience::Permanent);
        assert!(!err.transience().is_retryable());
    }
}
