//! Display-data model.
//!
//! A [`MimeMap`] holds one value rendered in several formats, keyed by MIME
//! type. [`Data`] is the exact payload published to Jupyter for results and
//! display calls: the renderable `data`, presentation `metadata` and
//! ephemeral `transient` routing hints.
//!
//! Values are owned trees, so [`MimeMap::deep_copy`] yields a copy that
//! shares nothing with the original and can be handed to concurrent readers.

pub mod synced;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::btree_map;
use std::collections::BTreeMap;

pub const MIME_TYPE_HTML: &str = "text/html";
pub const MIME_TYPE_JAVASCRIPT: &str = "application/javascript";
pub const MIME_TYPE_JPEG: &str = "image/jpeg";
pub const MIME_TYPE_JSON: &str = "application/json";
pub const MIME_TYPE_LATEX: &str = "text/latex";
pub const MIME_TYPE_MARKDOWN: &str = "text/markdown";
pub const MIME_TYPE_PNG: &str = "image/png";
pub const MIME_TYPE_PDF: &str = "application/pdf";
pub const MIME_TYPE_SVG: &str = "image/svg+xml";
pub const MIME_TYPE_TEXT: &str = "text/plain";

/// Transient key naming the display to update in place.
pub const TRANSIENT_DISPLAY_ID: &str = "display_id";

/// One rendered value. These four shapes are the only ones a [`MimeMap`]
/// can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum MimeValue {
    Text(String),
    /// Raw bytes, base64-encoded on the wire.
    Bytes(Vec<u8>),
    Lines(Vec<String>),
    /// Nested map, used for structured metadata.
    Map(MimeMap),
}

impl From<String> for MimeValue {
    fn from(s: String) -> Self {
        MimeValue::Text(s)
    }
}

impl From<&str> for MimeValue {
    fn from(s: &str) -> Self {
        MimeValue::Text(s.to_string())
    }
}

impl From<Vec<u8>> for MimeValue {
    fn from(b: Vec<u8>) -> Self {
        MimeValue::Bytes(b)
    }
}

impl From<Vec<String>> for MimeValue {
    fn from(lines: Vec<String>) -> Self {
        MimeValue::Lines(lines)
    }
}

impl From<MimeMap> for MimeValue {
    fn from(map: MimeMap) -> Self {
        MimeValue::Map(map)
    }
}

impl Serialize for MimeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MimeValue::Text(s) => serializer.serialize_str(s),
            MimeValue::Bytes(b) => serializer.serialize_str(&BASE64.encode(b)),
            MimeValue::Lines(lines) => {
                let mut seq = serializer.serialize_seq(Some(lines.len()))?;
                for line in lines {
                    seq.serialize_element(line)?;
                }
                seq.end()
            }
            MimeValue::Map(map) => map.serialize(serializer),
        }
    }
}

/// Mapping from MIME type (or metadata key) to a rendered value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MimeMap(BTreeMap<String, MimeValue>);

impl MimeMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MimeValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MimeValue> {
        self.0.get(key)
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(MimeValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<MimeValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, MimeValue> {
        self.0.iter()
    }

    /// Recursively duplicate every nested map and sequence.
    pub fn deep_copy(&self) -> MimeMap {
        MimeMap(
            self.0
                .iter()
                .map(|(key, value)| {
                    let copied = match value {
                        MimeValue::Text(s) => MimeValue::Text(s.clone()),
                        MimeValue::Bytes(b) => MimeValue::Bytes(b.clone()),
                        MimeValue::Lines(lines) => MimeValue::Lines(lines.to_vec()),
                        MimeValue::Map(map) => MimeValue::Map(map.deep_copy()),
                    };
                    (key.clone(), copied)
                })
                .collect(),
        )
    }

    /// Copy every entry of `other` into `self`. Nested maps present on both
    /// sides are merged recursively; any other collision takes `other`'s value.
    pub fn merge(&mut self, other: &MimeMap) {
        for (key, value) in other.iter() {
            match (self.0.get_mut(key), value) {
                (Some(MimeValue::Map(mine)), MimeValue::Map(theirs)) => mine.merge(theirs),
                _ => {
                    self.0.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Nested map stored under `key`, created empty if absent. `None` if the
    /// key already holds a different shape.
    pub fn map_entry(&mut self, key: &str) -> Option<&mut MimeMap> {
        match self
            .0
            .entry(key.to_string())
            .or_insert_with(|| MimeValue::Map(MimeMap::new()))
        {
            MimeValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// String sequence stored under `key`, created empty if absent. `None` if
    /// the key already holds a different shape.
    pub fn lines_entry(&mut self, key: &str) -> Option<&mut Vec<String>> {
        match self
            .0
            .entry(key.to_string())
            .or_insert_with(|| MimeValue::Lines(Vec::new()))
        {
            MimeValue::Lines(lines) => Some(lines),
            _ => None,
        }
    }
}

impl Serialize for MimeMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<MimeValue>> FromIterator<(K, V)> for MimeMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        MimeMap(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// The exact structure returned to Jupyter for a rendered value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Data {
    pub data: MimeMap,
    pub metadata: MimeMap,
    pub transient: MimeMap,
}

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain-text only payload.
    pub fn text(text: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.data.insert(MIME_TYPE_TEXT, text.into());
        data
    }

    /// Payload of one MIME type plus a `text/plain` fallback.
    pub fn mime(mime_type: &str, value: impl Into<MimeValue>) -> Self {
        let value = value.into();
        let plain = match &value {
            MimeValue::Text(s) => s.clone(),
            MimeValue::Bytes(b) => format!("<{} {} bytes>", mime_type, b.len()),
            MimeValue::Lines(lines) => lines.join("\n"),
            MimeValue::Map(_) => format!("<{}>", mime_type),
        };
        Self::with_plain(mime_type, plain, value)
    }

    /// Payload of one MIME type with an explicit plain-text rendering.
    pub fn with_plain(mime_type: &str, plain: impl Into<String>, value: impl Into<MimeValue>) -> Self {
        let mut data = Data::new();
        data.data.insert(MIME_TYPE_TEXT, plain.into());
        if mime_type != MIME_TYPE_TEXT {
            data.data.insert(mime_type, value);
        }
        data
    }

    pub fn html(html: impl Into<String>) -> Self {
        Self::mime(MIME_TYPE_HTML, html.into())
    }

    pub fn markdown(markdown: impl Into<String>) -> Self {
        Self::mime(MIME_TYPE_MARKDOWN, markdown.into())
    }

    pub fn svg(svg: impl Into<String>) -> Self {
        Self::mime(MIME_TYPE_SVG, svg.into())
    }

    pub fn png(png: Vec<u8>) -> Self {
        Self::mime(MIME_TYPE_PNG, png)
    }

    /// Inline LaTeX: the rendered value is wrapped in single dollars.
    pub fn latex(latex: &str) -> Self {
        Self::with_plain(
            MIME_TYPE_LATEX,
            latex,
            format!("${}$", latex.trim_matches('$')),
        )
    }

    /// Display-mode LaTeX: the rendered value is wrapped in double dollars.
    pub fn math(latex: &str) -> Self {
        Self::with_plain(
            MIME_TYPE_LATEX,
            latex,
            format!("$${}$$", latex.trim_matches('$')),
        )
    }

    /// True when there is nothing to render.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn deep_copy(&self) -> Data {
        Data {
            data: self.data.deep_copy(),
            metadata: self.metadata.deep_copy(),
            transient: self.transient.deep_copy(),
        }
    }

    pub fn merge(&mut self, other: &Data) {
        self.data.merge(&other.data);
        self.metadata.merge(&other.metadata);
        self.transient.merge(&other.transient);
    }

    /// Display id to update in place, if the producer set one.
    pub fn display_id(&self) -> Option<&str> {
        self.transient.get_text(TRANSIENT_DISPLAY_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn nested_sample() -> MimeMap {
        let mut size = MimeMap::new();
        size.insert("width", "640");
        size.insert("height", "480");

        let mut map = MimeMap::new();
        map.insert(MIME_TYPE_TEXT, "hello");
        map.insert(MIME_TYPE_PNG, vec![0x89u8, b'P', b'N', b'G']);
        map.insert("traceback", vec!["line 1".to_string(), "line 2".to_string()]);
        map.insert(MIME_TYPE_PNG.to_string() + "+meta", size);
        map
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let original = nested_sample();
        let mut copy = original.deep_copy();
        assert_eq!(copy, original);

        if let Some(MimeValue::Lines(lines)) = copy.0.get_mut("traceback") {
            lines.push("line 3".to_string());
        }
        copy.map_entry("image/png+meta").unwrap().insert("width", "1");

        assert_eq!(original.get("traceback"), Some(&MimeValue::Lines(vec![
            "line 1".to_string(),
            "line 2".to_string(),
        ])));
        match original.get("image/png+meta") {
            Some(MimeValue::Map(meta)) => assert_eq!(meta.get_text("width"), Some("640")),
            other => panic!("unexpected metadata shape: {:?}", other),
        }
    }

    #[test]
    fn test_serialize_shapes() {
        let value = serde_json::to_value(nested_sample()).unwrap();
        assert_eq!(
            value,
            json!({
                "text/plain": "hello",
                "image/png": "iVBORw==",
                "traceback": ["line 1", "line 2"],
                "image/png+meta": {"height": "480", "width": "640"},
            })
        );
    }

    #[test]
    fn test_merge_nested_maps() {
        let mut left = Data::text("a");
        left.metadata.map_entry(MIME_TYPE_PNG).unwrap().insert("width", "10");

        let mut right = Data::html("<b>a</b>");
        right.metadata.map_entry(MIME_TYPE_PNG).unwrap().insert("height", "20");
        right.transient.insert(TRANSIENT_DISPLAY_ID, "d-1");

        left.merge(&right);
        assert_eq!(left.data.get_text(MIME_TYPE_HTML), Some("<b>a</b>"));
        assert_eq!(left.data.get_text(MIME_TYPE_TEXT), Some("<b>a</b>"));
        assert_eq!(left.display_id(), Some("d-1"));
        match left.metadata.get(MIME_TYPE_PNG) {
            Some(MimeValue::Map(meta)) => assert_eq!(meta.len(), 2),
            other => panic!("unexpected metadata shape: {:?}", other),
        }
    }

    #[test]
    fn test_entry_shape_mismatch() {
        let mut map = MimeMap::new();
        map.insert("traceback", "not a sequence");
        assert!(map.lines_entry("traceback").is_none());
        assert!(map.map_entry("traceback").is_none());
    }

    #[test]
    fn test_builders() {
        let latex = Data::latex("x^2");
        assert_eq!(latex.data.get_text(MIME_TYPE_LATEX), Some("$x^2$"));
        assert_eq!(latex.data.get_text(MIME_TYPE_TEXT), Some("x^2"));

        let math = Data::math("$x^2$");
        assert_eq!(math.data.get_text(MIME_TYPE_LATEX), Some("$$x^2$$"));

        let png = Data::png(vec![1, 2, 3]);
        assert_eq!(png.data.get_text(MIME_TYPE_TEXT), Some("<image/png 3 bytes>"));
        assert!(!png.is_empty());
        assert!(Data::new().is_empty());
    }

    fn arb_value() -> impl Strategy<Value = MimeValue> {
        let leaf = prop_oneof![
            ".*".prop_map(MimeValue::Text),
            prop::collection::vec(any::<u8>(), 0..16).prop_map(MimeValue::Bytes),
            prop::collection::vec(".*", 0..4).prop_map(MimeValue::Lines),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop::collection::btree_map("[a-z/]{1,8}", inner, 0..4)
                .prop_map(|m| MimeValue::Map(MimeMap(m)))
        })
    }

    proptest! {
        #[test]
        fn prop_deep_copy_equal_by_value(entries in prop::collection::btree_map("[a-z/]{1,8}", arb_value(), 0..6)) {
            let original = MimeMap(entries);
            let copy = original.deep_copy();
            prop_assert_eq!(&copy, &original);

            let mut mutated = copy;
            mutated.insert("x-mutated/extra", "y");
            prop_assert!(!original.contains_key("x-mutated/extra"));
        }
    }
}
