//! Registered container formats.
#[cfg(feature = "afs")]
pub mod afs;
pub mod base;
#[cfg(feature = "bsa")]
pub mod bsa;
#[cfg(feature = "circus-dat")]
pub mod circus_dat;
#[cfg(feature = "escude")]
pub mod escude;
#[cfg(feature = "gcm")]
pub mod gcm;
#[cfg(feature = "grp")]
pub mod grp;
#[cfg(feature = "lnk")]
pub mod lnk;
#[cfg(feature = "pak")]
pub mod pak;
#[cfg(feature = "pfs")]
pub mod pfs;
#[cfg(feature = "rgssad")]
pub mod rgssad;
#[cfg(feature = "tfc")]
pub mod tfc;
#[cfg(feature = "vpk")]
pub mod vpk;
#[cfg(feature = "wad")]
pub mod wad;
#[cfg(feature = "xp3")]
pub mod xp3;

pub use base::{
    Archive, ArchiveBuilder, ArchiveWriter, PackItem, PackSource, WriteOptions, decode_table,
    find_builder, serialize, serialize_to_vec,
};

lazy_static::lazy_static! {
    /// Every compiled-in format. Detection breaks ties by this order.
    pub static ref BUILDER: Vec<Box<dyn ArchiveBuilder>> = vec![
        #[cfg(feature = "escude")]
        Box::new(escude::EscudeArchiveBuilder::new()),
        #[cfg(feature = "pfs")]
        Box::new(pfs::PfsArchiveBuilder::new()),
        #[cfg(feature = "xp3")]
        Box::new(xp3::Xp3ArchiveBuilder::new()),
        #[cfg(feature = "rgssad")]
        Box::new(rgssad::RgssadArchiveBuilder::new()),
        #[cfg(feature = "vpk")]
        Box::new(vpk::VpkArchiveBuilder::new()),
        #[cfg(feature = "bsa")]
        Box::new(bsa::BsaArchiveBuilder::new()),
        #[cfg(feature = "gcm")]
        Box::new(gcm::GcmArchiveBuilder::new()),
        #[cfg(feature = "afs")]
        Box::new(afs::AfsArchiveBuilder::new()),
        #[cfg(feature = "lnk")]
        Box::new(lnk::LnkArchiveBuilder::new()),
        #[cfg(feature = "pak")]
        Box::new(pak::PakArchiveBuilder::new()),
        #[cfg(feature = "wad")]
        Box::new(wad::WadArchiveBuilder::new()),
        #[cfg(feature = "grp")]
        Box::new(grp::GrpArchiveBuilder::new()),
        #[cfg(feature = "tfc")]
        Box::new(tfc::TfcArchiveBuilder::new()),
        #[cfg(feature = "circus-dat")]
        Box::new(circus_dat::CircusDatArchiveBuilder::new()),
    ];
    pub static ref ALL_EXTS: Vec<String> =
        BUILDER.iter().flat_map(|b| b.extensions()).map(|s| s.to_string()).collect();
}
