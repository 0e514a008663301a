//! Close codes carried by realtime channel close frames.
//!
//! The chat server closes a channel with one of two reserved application codes
//! when the realtime token in the connection URL is unusable. Every other code
//! is an ordinary disconnect.

use std::fmt;

/// Raw value of the "token invalid" close code.
pub const TOKEN_INVALID: u16 = 4001;

/// Raw value of the "token expired" close code.
pub const TOKEN_EXPIRED: u16 = 4002;

/// Classified channel close code.
///
/// Use [`CloseCode::requires_new_token`] to decide whether the closure should
/// trigger a room-list refetch (which issues a fresh realtime token).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// The realtime token was rejected by the server.
    TokenInvalid,
    /// The realtime token was valid once but has expired.
    TokenExpired,
    /// Any other close code, kept verbatim.
    Other(u16),
    /// The connection ended without a close frame (network drop, refused connect).
    Abnormal,
}

impl CloseCode {
    /// Classify an optional raw close code.
    pub fn from_raw(code: Option<u16>) -> Self {
        match code {
            Some(TOKEN_INVALID) => Self::TokenInvalid,
            Some(TOKEN_EXPIRED) => Self::TokenExpired,
            Some(other) => Self::Other(other),
            None => Self::Abnormal,
        }
    }

    /// Returns `true` for the two reserved codes meaning the realtime
    /// credential is no longer usable for this channel.
    pub fn requires_new_token(self) -> bool {
        matches!(self, Self::TokenInvalid | Self::TokenExpired)
    }

    /// Returns the raw numeric code, if the closure carried one.
    pub fn as_raw(self) -> Option<u16> {
        match self {
            Self::TokenInvalid => Some(TOKEN_INVALID),
            Self::TokenExpired => Some(TOKEN_EXPIRED),
            Self::Other(code) => Some(code),
            Self::Abnormal => None,
        }
    }

    /// Returns a human-readable description of this close code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::TokenInvalid => {
                "The realtime token was rejected. A new token will be requested with the room list."
            }
            Self::TokenExpired => {
                "The realtime token has expired. A new token will be requested with the room list."
            }
            Self::Other(1000) => "The channel was closed normally.",
            Self::Other(1001) => "The server is going away.",
            Self::Other(_) => "The channel was closed by the server.",
            Self::Abnormal => "The connection ended without a close frame.",
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self::from_raw(Some(code))
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_raw() {
            Some(code) => write!(f, "{code}: {}", self.description()),
            None => write!(f, "{}", self.description()),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn reserved_codes_require_new_token() {
        assert!(CloseCode::from(4001).requires_new_token());
        assert!(CloseCode::from(4002).requires_new_token());
    }

    #[test]
    fn ordinary_codes_do_not_require_new_token() {
        for code in [1000, 1001, 1006, 1011, 4000, 4003] {
            assert!(
                !CloseCode::from(code).requires_new_token(),
                "code {code} should be an ordinary close"
            );
        }
        assert!(!CloseCode::from_raw(None).requires_new_token());
    }

    #[test]
    fn raw_value_survives_classification() {
        assert_eq!(CloseCode::from(4001).as_raw(), Some(4001));
        assert_eq!(CloseCode::from(4002).as_raw(), Some(4002));
        assert_eq!(CloseCode::from(1006).as_raw(), Some(1006));
        assert_eq!(CloseCode::Abnormal.as_raw(), None);
    }

    #[test]
    fn display_includes_code() {
        let text = CloseCode::TokenExpired.to_string();
        assert!(text.starts_with("4002: "));
        assert_eq!(CloseCode::Abnormal.to_string(), CloseCode::Abnormal.description());
    }
}
