//! The closed token vocabulary.
//!
//! Every protocol unit is exactly three ASCII bytes. The first byte names
//! the class: `~` command, `%`/`$` event, `@` acknowledgment. Each command
//! and event has exactly one acknowledgment.

use std::fmt;
use std::str::FromStr;

use phf::phf_map;

/// Length of every token on the wire.
pub const TOKEN_LEN: usize = 3;

/// Semantic name of a command or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Semantic {
    /// Host opens a session
    EstablishConnection,
    /// Host asks for one piece of candy
    DispenseCandy,
    /// Host asks the dispenser to forget outstanding dispenses
    ResetDispenser,
    /// Keep-alive probe
    MaintainConnection,
    /// Host closes the session
    Disconnect,
    /// Dispenser reports a jam or an empty hopper
    JamOrEmpty,
    /// Dispenser reports that dispensed candy was collected
    CandyTaken,
}

impl Semantic {
    /// All semantic names, commands first.
    pub const ALL: [Semantic; 7] = [
        Semantic::EstablishConnection,
        Semantic::DispenseCandy,
        Semantic::ResetDispenser,
        Semantic::MaintainConnection,
        Semantic::Disconnect,
        Semantic::JamOrEmpty,
        Semantic::CandyTaken,
    ];

    /// Snake-case name used in logs and the CLI.
    pub fn name(self) -> &'static str {
        match self {
            Self::EstablishConnection => "establish_connection",
            Self::DispenseCandy => "dispense_candy",
            Self::ResetDispenser => "reset_dispenser",
            Self::MaintainConnection => "maintain_connection",
            Self::Disconnect => "disconnect",
            Self::JamOrEmpty => "jam_or_empty",
            Self::CandyTaken => "candy_taken",
        }
    }

    /// Events originate on the dispenser; everything else is a command.
    pub fn is_event(self) -> bool {
        matches!(self, Self::JamOrEmpty | Self::CandyTaken)
    }
}

impl fmt::Display for Semantic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Semantic {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sem| sem.name() == s)
            .ok_or_else(|| format!("Unknown message name: {s}"))
    }
}

/// Token class, read from the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    /// `~`
    Command,
    /// `%` or `$`
    Event,
    /// `@`
    Ack,
}

/// A recognized protocol token.
///
/// Anything that does not decode to a `Token` never reaches a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// Command or event
    Request(Semantic),
    /// Acknowledgment of the named command or event
    Ack(Semantic),
}

/// Wire text → token.
static WIRE_DECODE: phf::Map<&'static str, Token> = phf_map! {
    // Commands
    "~ES" => Token::Request(Semantic::EstablishConnection),
    "~ID" => Token::Request(Semantic::DispenseCandy),
    "~QD" => Token::Request(Semantic::ResetDispenser),
    "~RS" => Token::Request(Semantic::MaintainConnection),
    "~FL" => Token::Request(Semantic::Disconnect),
    // Events
    "%JP" => Token::Request(Semantic::JamOrEmpty),
    "$FD" => Token::Request(Semantic::CandyTaken),
    // Acks
    "@es" => Token::Ack(Semantic::EstablishConnection),
    "@iD" => Token::Ack(Semantic::DispenseCandy),
    "@qD" => Token::Ack(Semantic::ResetDispenser),
    "@rs" => Token::Ack(Semantic::MaintainConnection),
    "@fl" => Token::Ack(Semantic::Disconnect),
    "@jp" => Token::Ack(Semantic::JamOrEmpty),
    "@fd" => Token::Ack(Semantic::CandyTaken),
};

impl Token {
    /// Wire text of this token.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request(sem) => match sem {
                Semantic::EstablishConnection => "~ES",
                Semantic::DispenseCandy => "~ID",
                Semantic::ResetDispenser => "~QD",
                Semantic::MaintainConnection => "~RS",
                Semantic::Disconnect => "~FL",
                Semantic::JamOrEmpty => "%JP",
                Semantic::CandyTaken => "$FD",
            },
            Self::Ack(sem) => match sem {
                Semantic::EstablishConnection => "@es",
                Semantic::DispenseCandy => "@iD",
                Semantic::ResetDispenser => "@qD",
                Semantic::MaintainConnection => "@rs",
                Semantic::Disconnect => "@fl",
                Semantic::JamOrEmpty => "@jp",
                Semantic::CandyTaken => "@fd",
            },
        }
    }

    /// Wire bytes of this token.
    pub fn to_bytes(self) -> [u8; TOKEN_LEN] {
        let mut out = [0u8; TOKEN_LEN];
        out.copy_from_slice(self.as_str().as_bytes());
        out
    }

    /// Semantic name this token carries or acknowledges.
    pub fn semantic(self) -> Semantic {
        match self {
            Self::Request(sem) | Self::Ack(sem) => sem,
        }
    }

    /// Class of this token.
    pub fn class(self) -> TokenClass {
        match self {
            Self::Ack(_) => TokenClass::Ack,
            Self::Request(sem) if sem.is_event() => TokenClass::Event,
            Self::Request(_) => TokenClass::Command,
        }
    }

    /// Whether this is an acknowledgment.
    pub fn is_ack(self) -> bool {
        matches!(self, Self::Ack(_))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Token {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        WIRE_DECODE
            .get(s)
            .copied()
            .ok_or_else(|| format!("Unrecognized token: {s:?}"))
    }
}

/// Token for a semantic name (the command or event, never the ack).
pub fn encode(name: Semantic) -> Token {
    Token::Request(name)
}

/// Decode raw wire bytes. Anything other than a known 3-byte token is `None`.
pub fn decode(raw: &[u8]) -> Option<Token> {
    if raw.len() != TOKEN_LEN {
        return None;
    }
    let text = std::str::from_utf8(raw).ok()?;
    WIRE_DECODE.get(text).copied()
}

/// Acknowledgment paired with a command or event; acks have none.
pub fn ack_for(token: Token) -> Option<Token> {
    match token {
        Token::Request(sem) => Some(Token::Ack(sem)),
        Token::Ack(_) => None,
    }
}
