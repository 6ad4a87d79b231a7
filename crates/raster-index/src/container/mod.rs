//! Low-level TIFF container plumbing shared by the writer and the overview
//! builder.
//!
//! Inputs are decoded with the `tiff` crate. Outputs need byte-level control
//! (tile ordering, IFD placement, in-place header patching for overviews), so
//! they are assembled here directly:
//!
//! ```text
//! ┌────────┬─────────────┬──────────────┬─────┬──────────────┬──────────────┐
//! │ header │ tile blocks │ main IFD (v1)│ ... │ overview IFDs│ main IFD (v2)│
//! └────────┴─────────────┴──────────────┴─────┴──────────────┴──────────────┘
//!     │                                                             ▲
//!     └──────────────── first IFD offset (patched) ─────────────────┘
//! ```
//!
//! Only little-endian files are produced or edited.

mod codec;
mod ifd;
mod metadata;

pub use codec::{decode_block, encode_block};
pub use ifd::{
    patch_first_ifd, patch_next_ifd, read_ifd_chain, write_header, write_ifd, IfdEntry, IfdInfo,
    TiffFlavor, TiffLayout,
};
pub use metadata::{read_dataset_tags, GdalMetadata, MetadataItem};

/// Tag codes used by the engine.
pub mod tag {
    pub const NEW_SUBFILE_TYPE: u16 = 254;
    pub const IMAGE_WIDTH: u16 = 256;
    pub const IMAGE_LENGTH: u16 = 257;
    pub const BITS_PER_SAMPLE: u16 = 258;
    pub const COMPRESSION: u16 = 259;
    pub const PHOTOMETRIC: u16 = 262;
    pub const STRIP_OFFSETS: u16 = 273;
    pub const SAMPLES_PER_PIXEL: u16 = 277;
    pub const ROWS_PER_STRIP: u16 = 278;
    pub const STRIP_BYTE_COUNTS: u16 = 279;
    pub const PLANAR_CONFIGURATION: u16 = 284;
    pub const PREDICTOR: u16 = 317;
    pub const TILE_WIDTH: u16 = 322;
    pub const TILE_LENGTH: u16 = 323;
    pub const TILE_OFFSETS: u16 = 324;
    pub const TILE_BYTE_COUNTS: u16 = 325;
    pub const EXTRA_SAMPLES: u16 = 338;
    pub const SAMPLE_FORMAT: u16 = 339;
    pub const MODEL_PIXEL_SCALE: u16 = 33550;
    pub const MODEL_TIEPOINT: u16 = 33922;
    pub const MODEL_TRANSFORMATION: u16 = 34264;
    pub const GEO_KEY_DIRECTORY: u16 = 34735;
    pub const GEO_DOUBLE_PARAMS: u16 = 34736;
    pub const GEO_ASCII_PARAMS: u16 = 34737;
    pub const GDAL_METADATA: u16 = 42112;
    pub const GDAL_NODATA: u16 = 42113;
}

/// TIFF field types.
pub mod field {
    pub const BYTE: u16 = 1;
    pub const ASCII: u16 = 2;
    pub const SHORT: u16 = 3;
    pub const LONG: u16 = 4;
    pub const RATIONAL: u16 = 5;
    pub const SBYTE: u16 = 6;
    pub const UNDEFINED: u16 = 7;
    pub const SSHORT: u16 = 8;
    pub const SLONG: u16 = 9;
    pub const SRATIONAL: u16 = 10;
    pub const FLOAT: u16 = 11;
    pub const DOUBLE: u16 = 12;
    pub const IFD: u16 = 13;
    pub const LONG8: u16 = 16;
    pub const SLONG8: u16 = 17;
    pub const IFD8: u16 = 18;

    /// Size in bytes of one value of the given type, if known.
    pub fn size_of(field_type: u16) -> Option<usize> {
        match field_type {
            BYTE | ASCII | SBYTE | UNDEFINED => Some(1),
            SHORT | SSHORT => Some(2),
            LONG | SLONG | FLOAT | IFD => Some(4),
            RATIONAL | SRATIONAL | DOUBLE | LONG8 | SLONG8 | IFD8 => Some(8),
            _ => None,
        }
    }
}

/// Compression scheme codes.
pub mod compression {
    pub const DEFLATE: u16 = 8;
}

/// Predictor codes.
pub mod predictor {
    pub const HORIZONTAL: u16 = 2;
}

/// PhotometricInterpretation: min-is-black grayscale.
pub const PHOTOMETRIC_BLACK_IS_ZERO: u16 = 1;

/// PhotometricInterpretation: RGB.
pub const PHOTOMETRIC_RGB: u16 = 2;

/// NewSubfileType bit marking a reduced-resolution image.
pub const SUBFILE_REDUCED_RESOLUTION: u32 = 1;

/// SampleFormat: unsigned integer.
pub const SAMPLE_FORMAT_UINT: u16 = 1;
