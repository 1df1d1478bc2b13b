use nom::branch::alt;
use nom::character::complete::char;
use nom::combinator::map;

use crate::assembler::parser;
use crate::assembler::ParseError;

// Possible tokens that may occur in instruction text.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Token<'a> {
    // A mnemonic, register or symbol name.
    Ident(&'a str),
    // A `#`-prefixed immediate value.
    Immediate(i64),
    // A bare hexadecimal address.
    Address(u64),
    // The opening bracket of a memory operand.
    LBracket,
    // The closing bracket of a memory operand.
    RBracket,
    // The write-back marker of a memory operand.
    Bang,
    // The operand separator.
    Comma,
}

impl<'a> Token<'a> {
    // Parses the next token from the input, if applicable.
    fn next(input: &'a str) -> nom::IResult<&'a str, Self> {
        parser::ws(alt((
            map(char('['), |_| Token::LBracket),
            map(char(']'), |_| Token::RBracket),
            map(char('!'), |_| Token::Bang),
            map(char(','), |_| Token::Comma),
            map(parser::immediate, Token::Immediate),
            map(parser::address, Token::Address),
            map(parser::identifier, Token::Ident),
        )))(input)
    }
}

// Tokenizes one line of instruction text.
pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>, ParseError> {
    let mut tokens = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        match Token::next(rest) {
            Ok((tail, token)) => {
                tokens.push(token);
                rest = tail.trim_start();
            }
            Err(_) => {
                return Err(ParseError::new(format!(
                    "unexpected input near {:?}",
                    rest
                )))
            }
        }
    }
    Ok(tokens)
}
