//! Mapping between mio tokens and what they identify.
//!
//! Connection tokens are registry keys; the listener and the waker take the
//! two highest token values so they never collide with a slab key.

use crate::runtime::ConnId;
use mio::Token;

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Source of a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Listener,
    Waker,
    Connection(ConnId),
}

impl From<Token> for TokenKind {
    fn from(token: Token) -> Self {
        match token {
            LISTENER_TOKEN => TokenKind::Listener,
            WAKER_TOKEN => TokenKind::Waker,
            Token(id) => TokenKind::Connection(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_kinds() {
        assert_eq!(TokenKind::from(LISTENER_TOKEN), TokenKind::Listener);
        assert_eq!(TokenKind::from(WAKER_TOKEN), TokenKind::Waker);
        assert_eq!(TokenKind::from(Token(3)), TokenKind::Connection(3));
    }
}
