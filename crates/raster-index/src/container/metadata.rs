//! Dataset key/value metadata stored in the `GDAL_METADATA` tag.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{read_ifd_chain, tag};
use crate::error::{RasterIndexError, Result};

/// One metadata item. `domain` is `None` for the default domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub value: String,
}

/// Ordered dataset metadata. Insertion order is preserved so the encoded tag
/// is byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GdalMetadata {
    items: Vec<MetadataItem>,
}

impl GdalMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an item in the default domain, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.upsert(None, name.into(), value.into());
    }

    /// Set an item in a named domain.
    pub fn set_in_domain(
        &mut self,
        domain: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.upsert(Some(domain.into()), name.into(), value.into());
    }

    fn upsert(&mut self, domain: Option<String>, name: String, value: String) {
        match self
            .items
            .iter_mut()
            .find(|item| item.name == name && item.domain == domain)
        {
            Some(item) => item.value = value,
            None => self.items.push(MetadataItem {
                name,
                domain,
                value,
            }),
        }
    }

    /// Value of a default-domain item.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.find(None, name)
    }

    /// Value of an item in a named domain.
    pub fn get_in_domain(&self, domain: &str, name: &str) -> Option<&str> {
        self.find(Some(domain), name)
    }

    fn find(&self, domain: Option<&str>, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.name == name && item.domain.as_deref() == domain)
            .map(|item| item.value.as_str())
    }

    pub fn items(&self) -> &[MetadataItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encode as the XML document GDAL stores in tag 42112.
    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<GDALMetadata>\n");
        for item in &self.items {
            xml.push_str("  <Item name=\"");
            xml.push_str(&escape(&item.name));
            xml.push('"');
            if let Some(domain) = &item.domain {
                xml.push_str(" domain=\"");
                xml.push_str(&escape(domain));
                xml.push('"');
            }
            xml.push('>');
            xml.push_str(&escape(&item.value));
            xml.push_str("</Item>\n");
        }
        xml.push_str("</GDALMetadata>");
        xml
    }

    /// Parse a `GDALMetadata` XML document.
    ///
    /// Band-level items (those with a `sample` attribute) are skipped.
    pub fn parse_xml(xml: &str) -> Result<Self> {
        if !xml.contains("<GDALMetadata") {
            return Err(RasterIndexError::invalid_data(
                "GDAL metadata is missing its root element",
            ));
        }

        let mut metadata = Self::new();
        let mut rest = xml;
        while let Some(start) = rest.find("<Item") {
            rest = &rest[start + "<Item".len()..];
            let open_end = rest
                .find('>')
                .ok_or_else(|| RasterIndexError::invalid_data("unterminated <Item> element"))?;
            let self_closing = rest[..open_end].ends_with('/');
            let attrs = &rest[..open_end];
            rest = &rest[open_end + 1..];

            let value = if self_closing {
                String::new()
            } else {
                let close = rest
                    .find("</Item>")
                    .ok_or_else(|| RasterIndexError::invalid_data("missing </Item>"))?;
                let value = unescape(&rest[..close]);
                rest = &rest[close + "</Item>".len()..];
                value
            };

            if attribute(attrs, "sample").is_some() {
                continue;
            }
            let name = attribute(attrs, "name")
                .ok_or_else(|| RasterIndexError::invalid_data("<Item> without a name"))?;
            metadata.upsert(attribute(attrs, "domain"), name, value);
        }

        Ok(metadata)
    }
}

/// Read the dataset metadata of the first image of a TIFF file.
///
/// A file without a `GDAL_METADATA` tag yields empty metadata.
pub fn read_dataset_tags(path: &Path) -> Result<GdalMetadata> {
    let layout = read_ifd_chain(path)?;
    let xml = layout
        .main()
        .and_then(|ifd| ifd.get(tag::GDAL_METADATA))
        .and_then(|entry| entry.as_ascii());

    match xml {
        Some(xml) => GdalMetadata::parse_xml(&xml),
        None => Ok(GdalMetadata::new()),
    }
}

fn attribute(attrs: &str, key: &str) -> Option<String> {
    let needle = format!("{}=\"", key);
    let mut search = attrs;
    while let Some(pos) = search.find(&needle) {
        let boundary = pos == 0
            || search[..pos]
                .chars()
                .next_back()
                .map(char::is_whitespace)
                .unwrap_or(true);
        let after = &search[pos + needle.len()..];
        if boundary {
            let end = after.find('"')?;
            return Some(unescape(&after[..end]));
        }
        search = after;
    }
    None
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_round_trip_preserves_order_and_domains() {
        let mut metadata = GdalMetadata::new();
        metadata.set("LAYER_TYPE", "NDVI");
        metadata.set("FORMULA", "(NIR - Red) / (NIR + Red)");
        metadata.set_in_domain("rio_overview", "resampling", "average");
        metadata.set("ENCODING", "uint8: [0,254] maps to [-1,1], 255=nodata");

        let xml = metadata.to_xml();
        assert!(xml.starts_with("<GDALMetadata>"));
        assert!(xml.contains("<Item name=\"resampling\" domain=\"rio_overview\">average</Item>"));

        let parsed = GdalMetadata::parse_xml(&xml).unwrap();
        assert_eq!(parsed, metadata);
        assert_eq!(parsed.get("resampling"), None);
        assert_eq!(parsed.get_in_domain("rio_overview", "resampling"), Some("average"));
    }

    #[test]
    fn test_special_characters_are_escaped() {
        let mut metadata = GdalMetadata::new();
        metadata.set("DECODE_FORMULA", "a < b & \"c\" > d");
        let xml = metadata.to_xml();
        assert!(!xml.contains("a < b"));

        let parsed = GdalMetadata::parse_xml(&xml).unwrap();
        assert_eq!(parsed.get("DECODE_FORMULA"), Some("a < b & \"c\" > d"));
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut metadata = GdalMetadata::new();
        metadata.set("A", "1");
        metadata.set("B", "2");
        metadata.set("A", "3");
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata.items()[0].value, "3");
    }

    #[test]
    fn test_parse_foreign_document() {
        let xml = r#"<GDALMetadata>
  <Item name="AREA_OR_POINT">Area</Item>
  <Item name="STATISTICS_MEAN" sample="0">12.5</Item>
  <Item name="EMPTY"/>
</GDALMetadata>"#;
        let parsed = GdalMetadata::parse_xml(xml).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("AREA_OR_POINT"), Some("Area"));
        assert_eq!(parsed.get("EMPTY"), Some(""));
    }

    #[test]
    fn test_rejects_non_metadata_text() {
        assert!(GdalMetadata::parse_xml("hello").is_err());
    }
}
