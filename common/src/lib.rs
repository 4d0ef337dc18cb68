pub mod program;

pub use program::{parse_line, parse_program, Command, ParseError, Program, RejectedLine};
