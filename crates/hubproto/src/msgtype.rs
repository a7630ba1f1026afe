//! Reply message codes.
//!
//! Every reply from the hub carries a one-character code saying where the
//! command it answers stands. Unsolicited status broadcasts use the same codes
//! (usually `i`).

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// One-character reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    /// `>` command queued / started
    Queued,
    /// `i` informational
    Information,
    /// `w` warning
    Warning,
    /// `:` command finished successfully
    Done,
    /// `f` command failed
    Failed,
    /// `!` command failed fatally (also used for synthetic failures)
    Error,
    /// `d` debug chatter
    Debug,
}

/// Codes that end a command.
pub const DONE_TYPES: [MsgType; 3] = [MsgType::Done, MsgType::Failed, MsgType::Error];

/// Codes that end a command unsuccessfully.
pub const FAIL_TYPES: [MsgType; 2] = [MsgType::Failed, MsgType::Error];

/// How loudly a consumer should present a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Warning,
    Error,
}

impl MsgType {
    /// Parse a reply code character.
    pub fn from_code(code: char) -> Result<Self, ParseError> {
        match code {
            '>' => Ok(MsgType::Queued),
            'i' => Ok(MsgType::Information),
            'w' => Ok(MsgType::Warning),
            ':' => Ok(MsgType::Done),
            'f' => Ok(MsgType::Failed),
            '!' => Ok(MsgType::Error),
            'd' => Ok(MsgType::Debug),
            other => Err(ParseError::UnknownMsgCode(other.to_string())),
        }
    }

    pub fn code(self) -> char {
        match self {
            MsgType::Queued => '>',
            MsgType::Information => 'i',
            MsgType::Warning => 'w',
            MsgType::Done => ':',
            MsgType::Failed => 'f',
            MsgType::Error => '!',
            MsgType::Debug => 'd',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Queued => "queued",
            MsgType::Information => "information",
            MsgType::Warning => "warning",
            MsgType::Done => "done",
            MsgType::Failed => "failed",
            MsgType::Error => "error",
            MsgType::Debug => "debug",
        }
    }

    /// True if this code terminates a command.
    pub fn is_done(self) -> bool {
        DONE_TYPES.contains(&self)
    }

    /// True if this code terminates a command unsuccessfully.
    pub fn is_failure(self) -> bool {
        FAIL_TYPES.contains(&self)
    }

    pub fn severity(self) -> Severity {
        match self {
            MsgType::Warning => Severity::Warning,
            MsgType::Failed | MsgType::Error => Severity::Error,
            _ => Severity::Normal,
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in ['>', 'i', 'w', ':', 'f', '!', 'd'] {
            assert_eq!(MsgType::from_code(code).unwrap().code(), code);
        }
    }

    #[test]
    fn unknown_code_is_error() {
        assert!(matches!(
            MsgType::from_code('x'),
            Err(ParseError::UnknownMsgCode(_))
        ));
    }

    #[test]
    fn done_and_fail_sets() {
        assert!(MsgType::Done.is_done());
        assert!(!MsgType::Done.is_failure());
        assert!(MsgType::Failed.is_done() && MsgType::Failed.is_failure());
        assert!(MsgType::Error.is_failure());
        assert!(!MsgType::Warning.is_done());
        assert!(!MsgType::Queued.is_done());
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(MsgType::Information.severity(), Severity::Normal);
        assert_eq!(MsgType::Warning.severity(), Severity::Warning);
        assert_eq!(MsgType::Failed.severity(), Severity::Error);
        assert!(Severity::Error > Severity::Warning);
    }
}
