//! AT command parsing and formatting.
//!
//! HFP and HSP exchange AT commands over the RFCOMM channel. Commands from
//! the hands-free side are classified into plain, read, set and test
//! variants; everything sent by the audio gateway is a response, with the
//! bare `OK`/`ERROR`/`RING` lines represented as responses without a
//! command.

use std::fmt;
use strum::Display;

use crate::{Error, ErrorKind, Result};

/// Message classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Display)]
pub enum AtType {
    /// Unparsable payload passed through verbatim.
    #[strum(serialize = "RAW")]
    Raw,
    /// Plain command, e.g. `AT+CHUP`.
    #[strum(serialize = "CMD")]
    Cmd,
    /// Read command, e.g. `AT+CIND?`.
    #[strum(serialize = "CMD-GET")]
    CmdGet,
    /// Set command, e.g. `AT+BRSF=59`.
    #[strum(serialize = "CMD-SET")]
    CmdSet,
    /// Test command, e.g. `AT+CIND=?`.
    #[strum(serialize = "CMD-TEST")]
    CmdTest,
    /// Response or unsolicited result code.
    #[strum(serialize = "RESP")]
    Resp,
}

/// One parsed AT message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct At {
    /// Message classification.
    pub ty: AtType,
    /// Command name including any `+` prefix; empty for bare result codes.
    pub command: String,
    /// Value for set commands and responses.
    pub value: Option<String>,
}

impl At {
    /// Creates a plain command.
    pub fn cmd(command: &str) -> Self {
        Self { ty: AtType::Cmd, command: command.to_string(), value: None }
    }

    /// Creates a read command.
    pub fn get(command: &str) -> Self {
        Self { ty: AtType::CmdGet, command: command.to_string(), value: None }
    }

    /// Creates a set command.
    pub fn set(command: &str, value: impl Into<String>) -> Self {
        Self { ty: AtType::CmdSet, command: command.to_string(), value: Some(value.into()) }
    }

    /// Creates a test command.
    pub fn test(command: &str) -> Self {
        Self { ty: AtType::CmdTest, command: command.to_string(), value: None }
    }

    /// Creates a response with a command prefix, e.g. `+BRSF: 59`.
    pub fn resp(command: &str, value: impl Into<String>) -> Self {
        Self { ty: AtType::Resp, command: command.to_string(), value: Some(value.into()) }
    }

    /// Creates a bare result code, e.g. `OK`.
    pub fn result(value: &str) -> Self {
        Self { ty: AtType::Resp, command: String::new(), value: Some(value.to_string()) }
    }

    /// The `OK` result code.
    pub fn ok() -> Self {
        Self::result("OK")
    }

    /// The `ERROR` result code.
    pub fn error() -> Self {
        Self::result("ERROR")
    }

    /// Whether this is the given bare result code.
    pub fn is_result(&self, value: &str) -> bool {
        self.ty == AtType::Resp && self.command.is_empty() && self.value.as_deref() == Some(value)
    }

    /// Parses one line, with any line termination already stripped.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "empty AT line"));
        }

        if let Some(rest) = strip_prefix_ignore_case(line, "AT") {
            if rest.is_empty() {
                return Ok(Self::cmd(""));
            }
            if let Some(command) = rest.strip_suffix("=?") {
                return Ok(Self::test(command));
            }
            if let Some((command, value)) = rest.split_once('=') {
                return Ok(Self::set(command, value));
            }
            if let Some(command) = rest.strip_suffix('?') {
                return Ok(Self::get(command));
            }
            return Ok(Self::cmd(rest));
        }

        if let Some(rest) = line.strip_prefix('+') {
            match rest.split_once(':') {
                Some((command, value)) => {
                    return Ok(Self::resp(&format!("+{command}"), value.trim()));
                }
                None => return Ok(Self::resp(&format!("+{rest}"), "")),
            }
        }

        match line {
            "OK" | "ERROR" | "RING" | "BUSY" | "NO CARRIER" | "NO ANSWER" => Ok(Self::result(line)),
            _ => Ok(Self { ty: AtType::Raw, command: String::new(), value: Some(line.to_string()) }),
        }
    }

    /// Wire representation including line termination.
    pub fn line(&self) -> String {
        match self.ty {
            AtType::Cmd => format!("AT{}\r", self.command),
            AtType::CmdGet => format!("AT{}?\r", self.command),
            AtType::CmdSet => format!("AT{}={}\r", self.command, self.value.as_deref().unwrap_or("")),
            AtType::CmdTest => format!("AT{}=?\r", self.command),
            AtType::Resp if self.command.is_empty() => {
                format!("\r\n{}\r\n", self.value.as_deref().unwrap_or(""))
            }
            AtType::Resp => format!("\r\n{}: {}\r\n", self.command, self.value.as_deref().unwrap_or("")),
            AtType::Raw => self.value.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for At {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.ty, self.command)?;
        if let Some(value) = &self.value {
            write!(f, " = {value}")?;
        }
        Ok(())
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_variants() {
        assert_eq!(At::parse("AT+CHUP\r").unwrap(), At::cmd("+CHUP"));
        assert_eq!(At::parse("AT+CIND?").unwrap(), At::get("+CIND"));
        assert_eq!(At::parse("AT+CIND=?").unwrap(), At::test("+CIND"));
        assert_eq!(At::parse("AT+BRSF=59").unwrap(), At::set("+BRSF", "59"));
        assert_eq!(At::parse("at+brsf=59").unwrap(), At::set("+brsf", "59"));
        assert_eq!(At::parse("AT+CMER=3,0,0,1").unwrap(), At::set("+CMER", "3,0,0,1"));
    }

    #[test]
    fn parses_responses_and_result_codes() {
        assert_eq!(At::parse("+BRSF: 1544\r\n").unwrap(), At::resp("+BRSF", "1544"));
        assert_eq!(At::parse("+CIEV:2,1").unwrap(), At::resp("+CIEV", "2,1"));
        assert_eq!(At::parse("OK").unwrap(), At::ok());
        assert_eq!(At::parse("ERROR").unwrap(), At::error());
        assert_eq!(At::parse("RING").unwrap(), At::result("RING"));
        assert!(At::parse("OK").unwrap().is_result("OK"));
    }

    #[test]
    fn unknown_payload_is_raw() {
        let at = At::parse("CONNECT 9600").unwrap();
        assert_eq!(at.ty, AtType::Raw);
        assert_eq!(at.value.as_deref(), Some("CONNECT 9600"));
        assert!(At::parse("   ").is_err());
    }

    #[test]
    fn wire_format_round_trip() {
        for at in [
            At::cmd("+CHUP"),
            At::get("+CIND"),
            At::test("+CIND"),
            At::set("+BCS", "2"),
            At::resp("+BCS", "2"),
            At::ok(),
        ] {
            assert_eq!(At::parse(&at.line()).unwrap(), at, "round trip of {at}");
        }
    }
}
