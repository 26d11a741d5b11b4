#[cfg(feature = "utils-bit-stream")]
pub mod bit_stream;
pub mod counter;
pub mod encoding;
pub mod files;
pub mod lzo;
pub mod lzss;
#[cfg(feature = "utils-bit-stream")]
pub mod lzw;
pub mod struct_pack;
pub mod threadpool;
pub mod xored_stream;
