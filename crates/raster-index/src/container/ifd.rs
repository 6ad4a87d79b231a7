//! Image File Directory encoding and decoding.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{field, tag};
use crate::error::{RasterIndexError, Result};

/// Upper bound on directories followed in one chain.
const MAX_IFDS: usize = 4096;

/// Upper bound on a single out-of-line tag payload.
const MAX_TAG_BYTES: u64 = 1 << 30;

/// Classic TIFF or BigTIFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiffFlavor {
    /// 32-bit offsets, 12-byte entries.
    Classic,
    /// 64-bit offsets, 20-byte entries.
    Big,
}

impl TiffFlavor {
    /// Pick the flavor for a file expected to grow to `estimated_bytes`.
    pub fn for_estimated_size(estimated_bytes: u64) -> Self {
        if estimated_bytes >= u32::MAX as u64 {
            Self::Big
        } else {
            Self::Classic
        }
    }

    /// Version number stored after the byte-order mark.
    pub fn magic(&self) -> u16 {
        match self {
            Self::Classic => 42,
            Self::Big => 43,
        }
    }

    /// Length of the file header.
    pub fn header_len(&self) -> u64 {
        match self {
            Self::Classic => 8,
            Self::Big => 16,
        }
    }

    /// File position of the first-IFD pointer.
    pub fn first_ifd_pointer(&self) -> u64 {
        match self {
            Self::Classic => 4,
            Self::Big => 8,
        }
    }

    /// Width of offsets, counts and the inline value field.
    pub fn word_len(&self) -> u64 {
        match self {
            Self::Classic => 4,
            Self::Big => 8,
        }
    }

    fn entry_count_len(&self) -> u64 {
        match self {
            Self::Classic => 2,
            Self::Big => 8,
        }
    }

    fn entry_len(&self) -> u64 {
        4 + 2 * self.word_len()
    }

    /// Size of a directory table with `entries` entries, excluding
    /// out-of-line values.
    pub fn ifd_len(&self, entries: usize) -> u64 {
        self.entry_count_len() + entries as u64 * self.entry_len() + self.word_len()
    }

    /// Field type used for strip/tile offset arrays.
    pub fn offset_field_type(&self) -> u16 {
        match self {
            Self::Classic => field::LONG,
            Self::Big => field::LONG8,
        }
    }

    fn push_word(&self, buf: &mut Vec<u8>, value: u64) -> Result<()> {
        match self {
            Self::Classic => {
                let value = u32::try_from(value).map_err(|_| {
                    RasterIndexError::write_failure(format!(
                        "value {} does not fit a classic TIFF offset",
                        value
                    ))
                })?;
                buf.extend_from_slice(&value.to_le_bytes());
            }
            Self::Big => buf.extend_from_slice(&value.to_le_bytes()),
        }
        Ok(())
    }

    fn push_entry_count(&self, buf: &mut Vec<u8>, count: usize) -> Result<()> {
        match self {
            Self::Classic => {
                let count = u16::try_from(count).map_err(|_| {
                    RasterIndexError::write_failure("too many entries for one directory")
                })?;
                buf.extend_from_slice(&count.to_le_bytes());
            }
            Self::Big => buf.extend_from_slice(&(count as u64).to_le_bytes()),
        }
        Ok(())
    }
}

/// One directory entry holding its value bytes (little-endian).
#[derive(Debug, Clone, PartialEq)]
pub struct IfdEntry {
    pub tag: u16,
    pub field_type: u16,
    pub count: u64,
    pub data: Vec<u8>,
}

impl IfdEntry {
    /// Create an entry from raw little-endian value bytes.
    pub fn new(tag: u16, field_type: u16, count: u64, data: Vec<u8>) -> Self {
        Self {
            tag,
            field_type,
            count,
            data,
        }
    }

    pub fn short(tag: u16, value: u16) -> Self {
        Self::shorts(tag, &[value])
    }

    pub fn shorts(tag: u16, values: &[u16]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(tag, field::SHORT, values.len() as u64, data)
    }

    pub fn long(tag: u16, value: u32) -> Self {
        Self::new(tag, field::LONG, 1, value.to_le_bytes().to_vec())
    }

    pub fn long8s(tag: u16, values: &[u64]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(tag, field::LONG8, values.len() as u64, data)
    }

    pub fn doubles(tag: u16, values: &[f64]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(tag, field::DOUBLE, values.len() as u64, data)
    }

    /// NUL-terminated ASCII value.
    pub fn ascii(tag: u16, text: &str) -> Self {
        let mut data = text.as_bytes().to_vec();
        data.push(0);
        Self::new(tag, field::ASCII, data.len() as u64, data)
    }

    /// Offsets or byte counts, as LONG for classic files and LONG8 for
    /// BigTIFF.
    pub fn offsets(tag: u16, values: &[u64], flavor: TiffFlavor) -> Result<Self> {
        match flavor {
            TiffFlavor::Big => Ok(Self::long8s(tag, values)),
            TiffFlavor::Classic => {
                let mut data = Vec::with_capacity(values.len() * 4);
                for &value in values {
                    let value = u32::try_from(value).map_err(|_| {
                        RasterIndexError::write_failure(format!(
                            "tag {} value {} exceeds classic TIFF range",
                            tag, value
                        ))
                    })?;
                    data.extend_from_slice(&value.to_le_bytes());
                }
                Ok(Self::new(tag, field::LONG, values.len() as u64, data))
            }
        }
    }

    /// Unsigned integer values, widened to u64.
    pub fn as_u64s(&self) -> Option<Vec<u64>> {
        let values = match self.field_type {
            field::BYTE | field::UNDEFINED => self.data.iter().map(|&b| b as u64).collect(),
            field::SHORT => self
                .data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as u64)
                .collect(),
            field::LONG | field::IFD => self
                .data
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as u64)
                .collect(),
            field::LONG8 | field::IFD8 => self
                .data
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
            _ => return None,
        };
        Some(values)
    }

    /// First unsigned value.
    pub fn as_u64(&self) -> Option<u64> {
        self.as_u64s()?.first().copied()
    }

    /// Unsigned values narrowed to u16 (GeoKey directories).
    pub fn as_u16s(&self) -> Option<Vec<u16>> {
        Some(self.as_u64s()?.into_iter().map(|v| v as u16).collect())
    }

    /// Floating point values.
    pub fn as_f64s(&self) -> Option<Vec<f64>> {
        match self.field_type {
            field::DOUBLE => Some(
                self.data
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            field::FLOAT => Some(
                self.data
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                    .collect(),
            ),
            _ => None,
        }
    }

    /// ASCII value without trailing NULs.
    pub fn as_ascii(&self) -> Option<String> {
        if self.field_type != field::ASCII {
            return None;
        }
        let end = self
            .data
            .iter()
            .rposition(|&b| b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        Some(String::from_utf8_lossy(&self.data[..end]).into_owned())
    }
}

/// A directory as found on disk.
#[derive(Debug, Clone)]
pub struct IfdInfo {
    /// File offset of the directory table.
    pub offset: u64,
    /// Entries in on-disk order.
    pub entries: Vec<IfdEntry>,
    /// File offset of this directory's next-IFD pointer.
    pub next_pointer_pos: u64,
    /// Offset of the next directory (0 = last).
    pub next: u64,
}

impl IfdInfo {
    /// Look up an entry by tag.
    pub fn get(&self, tag: u16) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag == tag)
    }

    /// First unsigned value of a tag.
    pub fn u64_value(&self, tag: u16) -> Option<u64> {
        self.get(tag)?.as_u64()
    }

    /// All unsigned values of a tag.
    pub fn u64_values(&self, tag: u16) -> Option<Vec<u64>> {
        self.get(tag)?.as_u64s()
    }

    pub fn width(&self) -> Option<u64> {
        self.u64_value(tag::IMAGE_WIDTH)
    }

    pub fn height(&self) -> Option<u64> {
        self.u64_value(tag::IMAGE_LENGTH)
    }

    /// Whether NewSubfileType marks this as a reduced-resolution image.
    pub fn is_reduced_resolution(&self) -> bool {
        self.u64_value(tag::NEW_SUBFILE_TYPE)
            .map(|v| v & 1 == 1)
            .unwrap_or(false)
    }
}

/// Header flavor plus every directory of a file, in chain order.
#[derive(Debug, Clone)]
pub struct TiffLayout {
    pub flavor: TiffFlavor,
    pub ifds: Vec<IfdInfo>,
}

impl TiffLayout {
    /// The full-resolution directory (first in the chain).
    pub fn main(&self) -> Option<&IfdInfo> {
        self.ifds.first()
    }

    /// Whether the chain already carries more than one image.
    pub fn has_subfiles(&self) -> bool {
        self.ifds.len() > 1
    }
}

/// Write a little-endian header whose first-IFD pointer is still zero.
pub fn write_header<W: Write>(w: &mut W, flavor: TiffFlavor) -> Result<()> {
    let mut header = Vec::with_capacity(flavor.header_len() as usize);
    header.extend_from_slice(b"II");
    header.extend_from_slice(&flavor.magic().to_le_bytes());
    if flavor == TiffFlavor::Big {
        header.extend_from_slice(&8u16.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
    }
    flavor.push_word(&mut header, 0)?;
    w.write_all(&header)?;
    Ok(())
}

/// Append a directory at the end of the stream and return its offset.
///
/// Entries are written in ascending tag order; values that do not fit the
/// inline field follow the table.
pub fn write_ifd<W: Write + Seek>(
    w: &mut W,
    flavor: TiffFlavor,
    entries: &[IfdEntry],
    next_ifd: u64,
) -> Result<u64> {
    let mut sorted: Vec<&IfdEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.tag);
    if let Some(pair) = sorted.windows(2).find(|pair| pair[0].tag == pair[1].tag) {
        return Err(RasterIndexError::invalid_data(format!(
            "duplicate tag {} in directory",
            pair[0].tag
        )));
    }

    let mut offset = w.seek(SeekFrom::End(0))?;
    if offset % 2 == 1 {
        w.write_all(&[0])?;
        offset += 1;
    }

    let table_len = flavor.ifd_len(sorted.len());
    let inline_len = flavor.word_len() as usize;
    let mut table = Vec::with_capacity(table_len as usize);
    let mut overflow = Vec::new();

    flavor.push_entry_count(&mut table, sorted.len())?;
    for entry in sorted {
        table.extend_from_slice(&entry.tag.to_le_bytes());
        table.extend_from_slice(&entry.field_type.to_le_bytes());
        flavor.push_word(&mut table, entry.count)?;

        if entry.data.len() <= inline_len {
            table.extend_from_slice(&entry.data);
            table.resize(table.len() + inline_len - entry.data.len(), 0);
        } else {
            flavor.push_word(&mut table, offset + table_len + overflow.len() as u64)?;
            overflow.extend_from_slice(&entry.data);
            if overflow.len() % 2 == 1 {
                overflow.push(0);
            }
        }
    }
    flavor.push_word(&mut table, next_ifd)?;

    w.write_all(&table)?;
    w.write_all(&overflow)?;
    Ok(offset)
}

/// Point the header at a directory.
pub fn patch_first_ifd<W: Write + Seek>(w: &mut W, flavor: TiffFlavor, offset: u64) -> Result<()> {
    let mut word = Vec::with_capacity(8);
    flavor.push_word(&mut word, offset)?;
    w.seek(SeekFrom::Start(flavor.first_ifd_pointer()))?;
    w.write_all(&word)?;
    Ok(())
}

/// Rewrite the next-IFD pointer stored at `pointer_pos`.
pub fn patch_next_ifd<W: Write + Seek>(
    w: &mut W,
    flavor: TiffFlavor,
    pointer_pos: u64,
    next: u64,
) -> Result<()> {
    let mut word = Vec::with_capacity(8);
    flavor.push_word(&mut word, next)?;
    w.seek(SeekFrom::Start(pointer_pos))?;
    w.write_all(&word)?;
    Ok(())
}

fn read_failed(err: std::io::Error) -> RasterIndexError {
    RasterIndexError::read_failed(err.to_string())
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).map_err(read_failed)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_word<R: Read>(r: &mut R, flavor: TiffFlavor) -> Result<u64> {
    match flavor {
        TiffFlavor::Classic => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf).map_err(read_failed)?;
            Ok(u32::from_le_bytes(buf) as u64)
        }
        TiffFlavor::Big => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf).map_err(read_failed)?;
            Ok(u64::from_le_bytes(buf))
        }
    }
}

/// Read the header and every directory of a little-endian TIFF.
pub fn read_ifd_chain(path: &Path) -> Result<TiffLayout> {
    let file = File::open(path).map_err(|e| RasterIndexError::input_not_found(path, e))?;
    let mut reader = BufReader::new(file);

    let mut order = [0u8; 2];
    reader.read_exact(&mut order).map_err(read_failed)?;
    match &order {
        b"II" => {}
        b"MM" => {
            return Err(RasterIndexError::unsupported(format!(
                "{} is big-endian",
                path.display()
            )))
        }
        _ => {
            return Err(RasterIndexError::invalid_data(format!(
                "{} is not a TIFF file",
                path.display()
            )))
        }
    }

    let flavor = match read_u16(&mut reader)? {
        42 => TiffFlavor::Classic,
        43 => {
            let offset_size = read_u16(&mut reader)?;
            let _reserved = read_u16(&mut reader)?;
            if offset_size != 8 {
                return Err(RasterIndexError::invalid_data(format!(
                    "unexpected BigTIFF offset size {}",
                    offset_size
                )));
            }
            TiffFlavor::Big
        }
        other => {
            return Err(RasterIndexError::invalid_data(format!(
                "unknown TIFF version {}",
                other
            )))
        }
    };

    let mut next = read_word(&mut reader, flavor)?;
    let mut visited = HashSet::new();
    let mut ifds = Vec::new();

    while next != 0 {
        if !visited.insert(next) || ifds.len() >= MAX_IFDS {
            return Err(RasterIndexError::invalid_data("IFD chain loops"));
        }
        let info = read_ifd(&mut reader, flavor, next)?;
        next = info.next;
        ifds.push(info);
    }

    Ok(TiffLayout { flavor, ifds })
}

fn read_ifd<R: Read + Seek>(r: &mut R, flavor: TiffFlavor, offset: u64) -> Result<IfdInfo> {
    r.seek(SeekFrom::Start(offset)).map_err(read_failed)?;

    let count = match flavor {
        TiffFlavor::Classic => read_u16(r)? as u64,
        TiffFlavor::Big => read_word(r, flavor)?,
    };
    if count > u16::MAX as u64 {
        return Err(RasterIndexError::invalid_data(format!(
            "directory at {} claims {} entries",
            offset, count
        )));
    }

    let inline_len = flavor.word_len() as usize;
    let mut raw = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = read_u16(r)?;
        let field_type = read_u16(r)?;
        let value_count = read_word(r, flavor)?;
        let mut value = vec![0u8; inline_len];
        r.read_exact(&mut value).map_err(read_failed)?;
        raw.push((tag, field_type, value_count, value));
    }

    let next_pointer_pos = offset + flavor.ifd_len(count as usize) - flavor.word_len();
    let next = read_word(r, flavor)?;

    let mut entries = Vec::with_capacity(raw.len());
    for (tag, field_type, value_count, value) in raw {
        // Unknown field types cannot be sized, so they are dropped.
        let Some(size) = field::size_of(field_type) else {
            continue;
        };
        let total = value_count.saturating_mul(size as u64);
        let data = if total <= inline_len as u64 {
            value[..total as usize].to_vec()
        } else {
            if total > MAX_TAG_BYTES {
                return Err(RasterIndexError::invalid_data(format!(
                    "tag {} payload of {} bytes",
                    tag, total
                )));
            }
            let mut word = value.as_slice();
            let data_offset = read_word(&mut word, flavor)?;
            r.seek(SeekFrom::Start(data_offset)).map_err(read_failed)?;
            let mut data = vec![0u8; total as usize];
            r.read_exact(&mut data).map_err(read_failed)?;
            data
        };
        entries.push(IfdEntry::new(tag, field_type, value_count, data));
    }

    Ok(IfdInfo {
        offset,
        entries,
        next_pointer_pos,
        next,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_entries() -> Vec<IfdEntry> {
        vec![
            IfdEntry::ascii(tag::GDAL_NODATA, "255"),
            IfdEntry::long(tag::IMAGE_WIDTH, 700),
            IfdEntry::long(tag::IMAGE_LENGTH, 300),
            IfdEntry::doubles(tag::MODEL_PIXEL_SCALE, &[0.25, 0.25, 0.0]),
            IfdEntry::shorts(tag::BITS_PER_SAMPLE, &[8]),
        ]
    }

    fn write_to_temp(flavor: TiffFlavor, entries: &[IfdEntry]) -> tempfile::NamedTempFile {
        let mut buf = Cursor::new(Vec::new());
        write_header(&mut buf, flavor).unwrap();
        buf.write_all(&[1, 2, 3]).unwrap();
        let offset = write_ifd(&mut buf, flavor, entries, 0).unwrap();
        patch_first_ifd(&mut buf, flavor, offset).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(buf.get_ref()).unwrap();
        file
    }

    #[test]
    fn test_chain_round_trip_classic_and_big() {
        for flavor in [TiffFlavor::Classic, TiffFlavor::Big] {
            let file = write_to_temp(flavor, &sample_entries());
            let layout = read_ifd_chain(file.path()).unwrap();

            assert_eq!(layout.flavor, flavor);
            assert_eq!(layout.ifds.len(), 1);
            let main = layout.main().unwrap();
            // Directories are word aligned.
            assert_eq!(main.offset % 2, 0);
            assert_eq!(main.width(), Some(700));
            assert_eq!(main.height(), Some(300));
            assert_eq!(
                main.get(tag::MODEL_PIXEL_SCALE).unwrap().as_f64s(),
                Some(vec![0.25, 0.25, 0.0])
            );
            assert_eq!(
                main.get(tag::GDAL_NODATA).unwrap().as_ascii().as_deref(),
                Some("255")
            );

            let tags: Vec<u16> = main.entries.iter().map(|e| e.tag).collect();
            let mut sorted = tags.clone();
            sorted.sort_unstable();
            assert_eq!(tags, sorted);
        }
    }

    #[test]
    fn test_duplicate_tags_rejected() {
        let mut buf = Cursor::new(Vec::new());
        write_header(&mut buf, TiffFlavor::Classic).unwrap();
        let entries = vec![
            IfdEntry::long(tag::IMAGE_WIDTH, 1),
            IfdEntry::long(tag::IMAGE_WIDTH, 2),
        ];
        assert!(write_ifd(&mut buf, TiffFlavor::Classic, &entries, 0).is_err());
    }

    #[test]
    fn test_classic_offsets_must_fit_32_bits() {
        assert!(IfdEntry::offsets(tag::TILE_OFFSETS, &[u64::MAX], TiffFlavor::Classic).is_err());
        let big = IfdEntry::offsets(tag::TILE_OFFSETS, &[u64::MAX], TiffFlavor::Big).unwrap();
        assert_eq!(big.as_u64s(), Some(vec![u64::MAX]));
    }

    #[test]
    fn test_flavor_selection() {
        assert_eq!(TiffFlavor::for_estimated_size(1 << 20), TiffFlavor::Classic);
        assert_eq!(TiffFlavor::for_estimated_size(5 << 30), TiffFlavor::Big);
    }

    #[test]
    fn test_big_endian_is_unsupported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"MM\0\x2a\0\0\0\x08").unwrap();
        let err = read_ifd_chain(file.path()).unwrap_err();
        assert!(matches!(err, RasterIndexError::UnsupportedLayout(_)));
    }

    #[test]
    fn test_missing_file_is_input_not_found() {
        let err = read_ifd_chain(Path::new("/nonexistent/raster.tif")).unwrap_err();
        assert!(matches!(err, RasterIndexError::InputNotFound { .. }));
    }
}
