//! Fixed-layout record packing, driven by `#[derive(StructPack, StructUnpack)]`.
use crate::error::{ArcError, Result};
use crate::reader::BinaryReader;
use crate::types::Encoding;
use crate::utils::encoding::encode_string;
use arc_tool_macro::struct_unpack_impl_for_num;
use std::io::{Read, Seek, Write};

pub trait StructUnpack: Sized {
    fn unpack<R: Read + Seek>(reader: &mut BinaryReader<R>, big: bool, encoding: Encoding) -> Result<Self>;
}

pub trait StructPack {
    fn pack<W: Write>(&self, writer: &mut W, big: bool, encoding: Encoding) -> Result<()>;
}

struct_unpack_impl_for_num!(u8);
struct_unpack_impl_for_num!(u16);
struct_unpack_impl_for_num!(u32);
struct_unpack_impl_for_num!(u64);
struct_unpack_impl_for_num!(i16);
struct_unpack_impl_for_num!(i32);
struct_unpack_impl_for_num!(i64);

impl<const N: usize> StructUnpack for [u8; N] {
    fn unpack<R: Read + Seek>(reader: &mut BinaryReader<R>, _big: bool, _encoding: Encoding) -> Result<Self> {
        reader.read_array::<N>()
    }
}

impl<const N: usize> StructPack for [u8; N] {
    fn pack<W: Write>(&self, writer: &mut W, _big: bool, _encoding: Encoding) -> Result<()> {
        writer.write_all(self)?;
        Ok(())
    }
}

impl<T: StructPack> StructPack for Vec<T> {
    fn pack<W: Write>(&self, writer: &mut W, big: bool, encoding: Encoding) -> Result<()> {
        for item in self {
            item.pack(writer, big, encoding)?;
        }
        Ok(())
    }
}

/// Writes `value` into a `len` byte field padded with `pad`.
///
/// A NUL follows the text whenever it is shorter than the field.
pub fn pack_fixed_string<W: Write>(
    writer: &mut W,
    value: &str,
    len: usize,
    pad: u8,
    encoding: Encoding,
    field: &str,
) -> Result<()> {
    let mut bytes = encode_string(encoding, value, true)?;
    if bytes.len() > len {
        return Err(ArcError::InvalidInput(format!(
            "'{}' needs {} bytes but field '{}' holds {}",
            value,
            bytes.len(),
            field,
            len
        )));
    }
    if bytes.len() < len {
        bytes.push(0);
    }
    bytes.resize(len, pad);
    writer.write_all(&bytes)?;
    Ok(())
}

pub fn pack_prefixed_string<W: Write>(
    writer: &mut W,
    value: &str,
    width: usize,
    big: bool,
    encoding: Encoding,
) -> Result<()> {
    let bytes = encode_string(encoding, value, true)?;
    let len = bytes.len() as u64;
    if width < 8 && len >= 1u64 << (width * 8) {
        return Err(ArcError::InvalidInput(format!(
            "'{}' is too long for a {} byte length prefix",
            value, width
        )));
    }
    let prefix = if big { len.to_be_bytes() } else { len.to_le_bytes() };
    if big {
        writer.write_all(&prefix[8 - width..])?;
    } else {
        writer.write_all(&prefix[..width])?;
    }
    writer.write_all(&bytes)?;
    Ok(())
}
