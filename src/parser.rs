//! Deserialize data from the bytecode protocol.
use bytes::Bytes;
use nom::{
    bytes::complete::take,
    combinator::{map, map_res},
    error::{ErrorKind, ParseError},
    number::complete::{be_i16, be_i32, be_u16, be_u32, be_u8},
    IResult, Parser,
};
use nombytes::NomBytes;
use num_traits::FromPrimitive;

use crate::error::KafkaCode;

pub fn parse_kafka_code(s: NomBytes) -> IResult<NomBytes, KafkaCode> {
    map(be_i16, |n| {
        FromPrimitive::from_i16(n).unwrap_or(KafkaCode::Unknown)
    })(s)
}

/// Unsigned LEB128.
pub fn take_varint(s: NomBytes) -> IResult<NomBytes, u64> {
    let mut value = 0u64;
    let mut rest = s;
    for i in 0..10 {
        let (next, byte) = be_u8(rest)?;
        rest = next;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((rest, value));
        }
    }
    Err(nom::Err::Error(nom::error::Error::from_error_kind(
        rest,
        ErrorKind::TooLarge,
    )))
}

/// Zigzag encoded signed varint, as used by record fields.
pub fn parse_varint(s: NomBytes) -> IResult<NomBytes, i64> {
    map(take_varint, |v| ((v >> 1) as i64) ^ -((v & 1) as i64))(s)
}

pub fn parse_varint_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = parse_varint(s)?;
    if length < 0 {
        return Ok((s, None));
    }
    let (s, bytes) = take(length as usize)(s)?;
    Ok((s, Some(bytes.into_bytes())))
}

pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u16(s)?;
    let (s, string) = take(length)(s)?;
    Ok((s, string.into_bytes()))
}

pub fn parse_str(s: NomBytes) -> IResult<NomBytes, String> {
    map_res(parse_string, |b: Bytes| String::from_utf8(b.to_vec()))(s)
}

pub fn parse_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u32(s)?;
    let (s, string) = take(length)(s)?;
    Ok((s, string.into_bytes()))
}

pub fn parse_array<O, E, F>(mut f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: Parser<NomBytes, O, E>,
    E: ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (mut i, length) = be_i32(input)?;
        if length <= 0 {
            return Ok((i, vec![]));
        }
        // the length comes off the wire, so do not trust it for allocation
        let mut items = Vec::with_capacity((length as usize).min(1024));
        for _ in 0..length {
            let (rest, item) = f.parse(i)?;
            i = rest;
            items.push(item);
        }
        Ok((i, items))
    }
}

/// An array whose length may be -1, which decodes as `None`.
pub fn parse_nullable_array<O, E, F>(
    mut f: F,
) -> impl FnMut(NomBytes) -> IResult<NomBytes, Option<Vec<O>>, E>
where
    F: Parser<NomBytes, O, E>,
    E: ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (mut i, length) = be_i32(input)?;
        if length < 0 {
            return Ok((i, None));
        }
        let mut items = Vec::with_capacity((length as usize).min(1024));
        for _ in 0..length {
            let (rest, item) = f.parse(i)?;
            i = rest;
            items.push(item);
        }
        Ok((i, Some(items)))
    }
}

pub fn parse_nullable_string(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i16(s)?;
    if length < 0 {
        return Ok((s, None));
    }

    let (s, string) = take(length as u16)(s)?;
    Ok((s, Some(string.into_bytes())))
}

pub fn parse_nullable_str(s: NomBytes) -> IResult<NomBytes, Option<String>> {
    map_res(parse_nullable_string, |b: Option<Bytes>| {
        b.map(|b| String::from_utf8(b.to_vec())).transpose()
    })(s)
}

pub fn parse_nullable_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i32(s)?;
    if length < 0 {
        return Ok((s, None));
    }

    let (s, bytes) = take(length as u32)(s)?;
    Ok((s, Some(bytes.into_bytes())))
}
