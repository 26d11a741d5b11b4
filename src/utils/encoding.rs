//! Name decoding and encoding.
use crate::error::{ArcError, Result};
use crate::types::*;

/// Decodes `data` read at `offset`. The offset is only used for error reporting.
pub fn decode_to_string(encoding: Encoding, data: &[u8], offset: u64) -> Result<String> {
    let invalid = |reason: &str| ArcError::InvalidEncoding {
        offset,
        reason: reason.to_string(),
    };
    match encoding {
        Encoding::Utf8 => String::from_utf8(data.to_vec()).map_err(|e| invalid(&e.to_string())),
        Encoding::Cp932 => {
            let (text, _, had_errors) = encoding_rs::SHIFT_JIS.decode(data);
            if had_errors {
                Err(invalid("malformed Shift-JIS sequence"))
            } else {
                Ok(text.into_owned())
            }
        }
        Encoding::Gb2312 => {
            let (text, _, had_errors) = encoding_rs::GBK.decode(data);
            if had_errors {
                Err(invalid("malformed GBK sequence"))
            } else {
                Ok(text.into_owned())
            }
        }
        Encoding::Utf16Le => {
            let wstr = utf16string::WStr::from_utf16le(data)
                .map_err(|e| invalid(&format!("malformed UTF-16LE: {e}")))?;
            Ok(wstr.to_utf8())
        }
    }
}

/// Encodes `data`. With `check` set, unmappable characters are an error;
/// otherwise they are replaced and a warning is logged.
pub fn encode_string(encoding: Encoding, data: &str, check: bool) -> Result<Vec<u8>> {
    let legacy = |codec: &'static encoding_rs::Encoding| -> Result<Vec<u8>> {
        let (bytes, _, had_errors) = codec.encode(data);
        if had_errors {
            if check {
                return Err(ArcError::InvalidInput(format!(
                    "'{}' cannot be encoded as {}",
                    data,
                    codec.name()
                )));
            }
            tracing::warn!("some characters of '{}' cannot be encoded as {}", data, codec.name());
        }
        Ok(bytes.into_owned())
    };
    match encoding {
        Encoding::Utf8 => Ok(data.as_bytes().to_vec()),
        Encoding::Cp932 => legacy(encoding_rs::SHIFT_JIS),
        Encoding::Gb2312 => legacy(encoding_rs::GBK),
        Encoding::Utf16Le => Ok(data.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()),
    }
}

#[test]
fn test_decode_to_string() {
    assert_eq!(
        decode_to_string(
            Encoding::Cp932,
            &[130, 171, 130, 225, 130, 215, 130, 194, 130, 187, 130, 211, 130, 198],
            0
        )
        .unwrap(),
        "きゃべつそふと"
    );
    assert_eq!(
        decode_to_string(Encoding::Gb2312, &[214, 208, 206, 196], 0).unwrap(),
        "中文"
    );
    assert_eq!(
        decode_to_string(Encoding::Utf16Le, &[0x64, 0, 0x61, 0, 0x74, 0, 0x61, 0], 0).unwrap(),
        "data"
    );
}

#[test]
fn test_decode_reports_offset() {
    match decode_to_string(Encoding::Utf8, &[0xFF, 0xFE], 0x40) {
        Err(ArcError::InvalidEncoding { offset, .. }) => assert_eq!(offset, 0x40),
        other => panic!("unexpected result: {other:?}"),
    }
    // odd length cannot be UTF-16
    assert!(decode_to_string(Encoding::Utf16Le, &[0x61, 0, 0x62], 0).is_err());
}

#[test]
fn test_encode_string() {
    assert_eq!(
        encode_string(Encoding::Cp932, "きゃべつそふと", true).unwrap(),
        vec![130, 171, 130, 225, 130, 215, 130, 194, 130, 187, 130, 211, 130, 198]
    );
    assert_eq!(
        encode_string(Encoding::Utf16Le, "ab", true).unwrap(),
        vec![0x61, 0, 0x62, 0]
    );
    assert!(encode_string(Encoding::Cp932, "\u{1F600}", true).is_err());
}
