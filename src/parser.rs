//! Deserialize data from the bytecode protocol.
use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::take,
    multi::many_m_n,
    number::complete::{be_i8, be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::constants::MAX_PROTOCOL_ARRAY_SIZE;
use crate::error::Error;

type ParseError = nom::Err<nom::error::Error<NomBytes>>;

fn failure(input: NomBytes, kind: nom::error::ErrorKind) -> ParseError {
    nom::Err::Failure(nom::error::Error::new(input, kind))
}

/// Maps any nom failure into a crate error naming what was being parsed.
pub fn parse_error<E>(what: &str) -> impl FnOnce(E) -> Error + '_ {
    move |_| Error::Encoding(format!("malformed {}", what))
}

/// Convert bytes to a validated UTF-8 string.
/// Returns an error if the bytes are not valid UTF-8.
pub fn bytes_to_string(bytes: &Bytes) -> Result<String, ParseError> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| failure(NomBytes::from(bytes.as_ref()), nom::error::ErrorKind::Verify))
}

pub fn parse_bool(s: NomBytes) -> IResult<NomBytes, bool> {
    let (s, b) = be_i8(s)?;
    Ok((s, b != 0))
}

/// Non-nullable STRING, returned as an owned UTF-8 `String`.
pub fn parse_string(s: NomBytes) -> IResult<NomBytes, String> {
    let (s, length) = be_i16(s)?;
    if length < 0 {
        return Err(failure(s, nom::error::ErrorKind::LengthValue));
    }
    let (s, string) = take(length as usize)(s)?;
    Ok((s, bytes_to_string(&string.into_bytes())?))
}

pub fn parse_nullable_string(s: NomBytes) -> IResult<NomBytes, Option<String>> {
    let (s, length) = be_i16(s)?;

    if length == -1 {
        return Ok((s, None));
    }
    if length < 0 {
        return Err(failure(s, nom::error::ErrorKind::TooLarge));
    }

    let (s, string) = take(length as usize)(s)?;
    Ok((s, Some(bytes_to_string(&string.into_bytes())?)))
}

/// Nullable BYTES with an i32 length prefix.
pub fn parse_nullable_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i32(s)?;
    if length == -1 {
        return Ok((s, None));
    }
    if length < 0 {
        return Err(failure(s, nom::error::ErrorKind::LengthValue));
    }
    let (s, data) = take(length as usize)(s)?;
    Ok((s, Some(data.into_bytes())))
}

/// BYTES with an i32 length prefix; a null value decodes as empty.
pub fn parse_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, data) = parse_nullable_bytes(s)?;
    Ok((s, data.unwrap_or_default()))
}

pub fn parse_array<O, E, F>(f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: nom::error::ParseError<NomBytes>,
{
    let mut nullable = parse_nullable_array(f);
    move |input: NomBytes| {
        let (i, items) = nullable(input)?;
        Ok((i, items.unwrap_or_default()))
    }
}

/// Array whose length -1 means null.
pub fn parse_nullable_array<O, E, F>(
    f: F,
) -> impl FnMut(NomBytes) -> IResult<NomBytes, Option<Vec<O>>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: nom::error::ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (i, length) = be_i32(input)?;

        if length == -1 {
            return Ok((i, None));
        }

        if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&length) {
            return Err(nom::Err::Failure(E::from_error_kind(
                i,
                nom::error::ErrorKind::TooLarge,
            )));
        }

        let (i, items) = many_m_n(length as usize, length as usize, f)(i)?;
        Ok((i, Some(items)))
    }
}

/// Zigzag-encoded signed varlong as used by v2 records.
pub fn parse_varlong(s: NomBytes) -> IResult<NomBytes, i64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut remaining = s;

    loop {
        let (s, byte) = take(1usize)(remaining)?;
        let b = byte.into_bytes()[0];
        remaining = s;

        result |= ((b & 0x7F) as u64) << shift;

        if (b & 0x80) == 0 {
            break;
        }

        shift += 7;
        if shift > 63 {
            return Err(failure(remaining, nom::error::ErrorKind::TooLarge));
        }
    }

    let value = ((result >> 1) as i64) ^ -((result & 1) as i64);
    Ok((remaining, value))
}

pub fn parse_varint(s: NomBytes) -> IResult<NomBytes, i32> {
    let (s, value) = parse_varlong(s)?;
    let value = i32::try_from(value).map_err(|_| failure(s.clone(), nom::error::ErrorKind::TooLarge))?;
    Ok((s, value))
}

/// Varint-length-prefixed bytes; length -1 means null.
pub fn parse_varint_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = parse_varint(s)?;
    if length == -1 {
        return Ok((s, None));
    }
    if length < 0 {
        return Err(failure(s, nom::error::ErrorKind::LengthValue));
    }
    let (s, data) = take(length as usize)(s)?;
    Ok((s, Some(data.into_bytes())))
}
