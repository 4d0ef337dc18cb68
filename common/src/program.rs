use std::fmt;

use serde::{Deserialize, Serialize};

/// A single instruction from a stored pump program. Programs are plain
/// text, one command per line:
///
/// ```text
/// MOVE 2.5ml SPEED 0.5ml/s
/// PAUSE 10
/// END
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Dispense a volume at the given flow rate
    Move { volume_ml: f64, speed_ml_per_s: f64 },
    /// Wait before running the next command
    Pause { seconds: f64 },
    /// Stop the program, even if more lines follow
    End,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Move {
                volume_ml,
                speed_ml_per_s,
            } => write!(f, "MOVE {volume_ml}ml SPEED {speed_ml_per_s}ml/s"),
            Command::Pause { seconds } => write!(f, "PAUSE {seconds}"),
            Command::End => write!(f, "END"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParseError {
    UnknownCommand(String),
    MissingArgument(String),
    InvalidNumber(String),
    UnexpectedToken(String),
    NotPositive(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand(word) => write!(f, "unknown command '{word}'"),
            Self::MissingArgument(what) => write!(f, "missing {what}"),
            Self::InvalidNumber(token) => write!(f, "'{token}' is not a number"),
            Self::UnexpectedToken(token) => write!(f, "unexpected '{token}'"),
            Self::NotPositive(what) => write!(f, "{what} must be greater than zero"),
        }
    }
}

impl std::error::Error for ParseError {}

/// A line that could not be turned into a command. These are reported back
/// to whoever loaded the program instead of aborting the whole parse.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RejectedLine {
    pub line_number: usize,
    pub text: String,
    pub reason: ParseError,
}

impl fmt::Display for RejectedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {} ({})", self.line_number, self.reason, self.text)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub commands: Vec<Command>,
    pub rejected: Vec<RejectedLine>,
}

/// Parse a whole program. Blank lines and `#` comments are skipped, and bad
/// lines end up in [`Program::rejected`].
pub fn parse_program(text: &str) -> Program {
    let mut program = Program::default();

    for (i, line) in text.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(command)) => program.commands.push(command),
            Ok(None) => {}
            Err(reason) => program.rejected.push(RejectedLine {
                line_number: i + 1,
                text: line.trim().to_string(),
                reason,
            }),
        }
    }

    program
}

/// Parse one program line. Keywords and units are case-insensitive, and
/// units may be attached (`5ml`) or separate (`5 ml`).
pub fn parse_line(line: &str) -> Result<Option<Command>, ParseError> {
    let line = match line.split_once('#') {
        Some((code, _comment)) => code,
        None => line,
    };
    let line = line.trim().to_ascii_lowercase();
    let tokens: Vec<&str> = line.split_whitespace().collect();

    let Some((keyword, rest)) = tokens.split_first() else {
        return Ok(None);
    };
    let mut rest = Tokens { tokens: rest, at: 0 };

    let command = match *keyword {
        "move" => {
            let volume_ml = rest.quantity("volume", &["ml"])?;
            rest.keyword("speed")?;
            let speed_ml_per_s = rest.quantity("speed", &["ml/s"])?;
            positive("volume", volume_ml)?;
            positive("speed", speed_ml_per_s)?;
            Command::Move {
                volume_ml,
                speed_ml_per_s,
            }
        }
        "pause" => {
            let seconds = rest.quantity("pause duration", &["s", "sec"])?;
            if seconds < 0.0 {
                return Err(ParseError::NotPositive("pause duration".into()));
            }
            Command::Pause { seconds }
        }
        "end" => Command::End,
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    };

    rest.finish()?;
    Ok(Some(command))
}

fn positive(what: &str, value: f64) -> Result<(), ParseError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(ParseError::NotPositive(what.to_string()))
    }
}

struct Tokens<'a> {
    tokens: &'a [&'a str],
    at: usize,
}

impl<'a> Tokens<'a> {
    fn next(&mut self) -> Option<&'a str> {
        let token = self.tokens.get(self.at).copied();
        if token.is_some() {
            self.at += 1;
        }
        token
    }

    fn keyword(&mut self, word: &str) -> Result<(), ParseError> {
        match self.next() {
            Some(token) if token == word => Ok(()),
            Some(token) => Err(ParseError::UnexpectedToken(token.to_string())),
            None => Err(ParseError::MissingArgument(word.to_uppercase())),
        }
    }

    /// Read a number with an optional unit, either glued to the number or as
    /// the following token.
    fn quantity(&mut self, what: &str, units: &[&str]) -> Result<f64, ParseError> {
        let token = self
            .next()
            .ok_or_else(|| ParseError::MissingArgument(what.to_string()))?;

        let mut number = token;
        let mut attached = false;
        for unit in units {
            if let Some(stripped) = token.strip_suffix(unit) {
                if !stripped.is_empty() {
                    number = stripped;
                    attached = true;
                    break;
                }
            }
        }

        let value: f64 = number
            .parse()
            .map_err(|_| ParseError::InvalidNumber(token.to_string()))?;
        if !value.is_finite() {
            return Err(ParseError::InvalidNumber(token.to_string()));
        }

        if !attached {
            if let Some(next) = self.tokens.get(self.at) {
                if units.contains(next) {
                    self.at += 1;
                }
            }
        }

        Ok(value)
    }

    fn finish(&mut self) -> Result<(), ParseError> {
        match self.next() {
            Some(token) => Err(ParseError::UnexpectedToken(token.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_move_with_units() {
        assert_eq!(
            parse_line("MOVE 2.5ml SPEED 0.5ml/s").unwrap(),
            Some(Command::Move {
                volume_ml: 2.5,
                speed_ml_per_s: 0.5
            })
        );
        assert_eq!(
            parse_line("move 3 ml speed 1 ml/s").unwrap(),
            Some(Command::Move {
                volume_ml: 3.0,
                speed_ml_per_s: 1.0
            })
        );
        assert_eq!(
            parse_line("Move 4 Speed 2").unwrap(),
            Some(Command::Move {
                volume_ml: 4.0,
                speed_ml_per_s: 2.0
            })
        );
    }

    #[test]
    fn test_parse_pause_and_end() {
        assert_eq!(
            parse_line("pause 10").unwrap(),
            Some(Command::Pause { seconds: 10.0 })
        );
        assert_eq!(
            parse_line("PAUSE 1.5s").unwrap(),
            Some(Command::Pause { seconds: 1.5 })
        );
        assert_eq!(parse_line("End").unwrap(), Some(Command::End));
    }

    #[test]
    fn test_blank_and_comment_lines_are_skipped() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("# prime the lines first").unwrap(), None);
        assert_eq!(
            parse_line("PAUSE 2 # settle").unwrap(),
            Some(Command::Pause { seconds: 2.0 })
        );
    }

    #[test]
    fn test_bad_lines() {
        assert_eq!(
            parse_line("SPIN 3"),
            Err(ParseError::UnknownCommand("spin".into()))
        );
        assert_eq!(
            parse_line("MOVE 3ml"),
            Err(ParseError::MissingArgument("SPEED".into()))
        );
        assert_eq!(
            parse_line("MOVE abc SPEED 1"),
            Err(ParseError::InvalidNumber("abc".into()))
        );
        assert_eq!(
            parse_line("MOVE 0 SPEED 1"),
            Err(ParseError::NotPositive("volume".into()))
        );
        assert_eq!(
            parse_line("END now"),
            Err(ParseError::UnexpectedToken("now".into()))
        );
    }

    #[test]
    fn test_program_reports_rejected_lines() {
        let program = parse_program(
            "MOVE 1ml SPEED 0.5ml/s\n\
             wiggle\n\
             PAUSE 5\n\
             MOVE -2 SPEED 1\n\
             END\n",
        );

        assert_eq!(program.commands.len(), 3);
        assert_eq!(program.commands[2], Command::End);
        assert_eq!(program.rejected.len(), 2);
        assert_eq!(program.rejected[0].line_number, 2);
        assert_eq!(program.rejected[0].text, "wiggle");
        assert_eq!(program.rejected[1].line_number, 4);
    }
}
