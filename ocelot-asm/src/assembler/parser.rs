use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while1};
use nom::character::complete::{alpha1, alphanumeric1, char, space0};
use nom::combinator::{map, map_res, opt, recognize};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;
use num_traits::{PrimInt, Signed, Unsigned};

/// Parses one run of digits in the given radix.
fn digits(radix: u32) -> impl Fn(&str) -> IResult<&str, &str> {
    move |input| take_while1(|c: char| c.is_digit(radix))(input)
}

/// Parses the magnitude of an integer literal: hexadecimal when the
/// `0x` prefix is present, decimal otherwise.
fn magnitude<T>(input: &str) -> IResult<&str, T>
where
    T: PrimInt,
{
    alt((
        map_res(preceded(tag_no_case("0x"), digits(16)), |s: &str| {
            T::from_str_radix(s, 16)
        }),
        map_res(digits(10), |s: &str| T::from_str_radix(s, 10)),
    ))(input)
}

/// Parses a signed integer literal in hexadecimal or decimal notation.
///
/// The sign, when present, precedes the whole literal, matching the way
/// instruction printing spells negative displacements (`#-0x10`).
pub fn signed_integer<T>(input: &str) -> IResult<&str, T>
where
    T: PrimInt + Signed,
{
    map(
        pair(opt(char('-')), magnitude::<T>),
        |(sign, n)| if sign.is_some() { -n } else { n },
    )(input)
}

/// Parses an unsigned integer literal in hexadecimal or decimal
/// notation.
pub fn unsigned_integer<T>(input: &str) -> IResult<&str, T>
where
    T: PrimInt + Unsigned,
{
    magnitude(input)
}

/// Parses an `#`-prefixed immediate.
pub fn immediate(input: &str) -> IResult<&str, i64> {
    preceded(char('#'), signed_integer)(input)
}

/// Parses a bare address literal. Addresses always carry the `0x`
/// prefix, which keeps them apart from register names and mnemonics.
pub fn address(input: &str) -> IResult<&str, u64> {
    map_res(preceded(tag_no_case("0x"), digits(16)), |s: &str| {
        u64::from_str_radix(s, 16)
    })(input)
}

/// Parses an identifier: a mnemonic, register or symbol name.
pub fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"), tag("$"), tag("."))),
        many0(alt((alphanumeric1, tag("_"), tag("."), tag("$")))),
    ))(input)
}

/// Consumes surrounding spaces around `inner`.
pub fn ws<'a, O, F>(inner: F) -> impl Fn(&'a str) -> IResult<&'a str, O>
where
    F: Fn(&'a str) -> IResult<&'a str, O>,
{
    move |input| delimited(space0, &inner, space0)(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_parse_in_both_radixes() {
        assert_eq!(signed_integer::<i64>("42"), Ok(("", 42)));
        assert_eq!(signed_integer::<i64>("0x2a"), Ok(("", 0x2a)));
        assert_eq!(signed_integer::<i64>("-16"), Ok(("", -16)));
        assert_eq!(signed_integer::<i64>("-0x10"), Ok(("", -16)));
        assert_eq!(unsigned_integer::<u64>("0xFFFF"), Ok(("", 0xFFFF)));
    }

    #[test]
    fn immediates_need_the_hash_prefix() {
        assert_eq!(immediate("#-16"), Ok(("", -16)));
        assert_eq!(immediate("#0x2a"), Ok(("", 0x2a)));
        assert!(immediate("42").is_err());
    }

    #[test]
    fn addresses_need_the_hex_prefix() {
        assert_eq!(address("0x5008"), Ok(("", 0x5008)));
        assert!(address("5008").is_err());
    }
}
