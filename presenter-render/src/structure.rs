//! Document-level facts pdfium does not expose: page transition durations,
//! page labels, and content that rendering ignores.

use std::path::Path;

use lopdf::{Dictionary, Document, Object};
use presenter_core::UnsupportedFeature;
use tracing::{debug, warn};

/// Nesting limit for page label number trees.
const MAX_TREE_DEPTH: usize = 32;
/// Largest `/St` honoured; higher values are clamped.
const MAX_FIRST_NUMBER: i64 = 1_000_000;
/// Roman numerals above this are written as decimals.
const MAX_ROMAN: i64 = 3999;
/// Letter labels repeat at most this many times before falling back to decimals.
const MAX_LETTER_REPEAT: i64 = 16;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentStructure {
    durations: Vec<Option<f32>>,
    labels: Vec<Option<String>>,
    unsupported: Vec<UnsupportedFeature>,
}

impl DocumentStructure {
    pub fn scan(path: &Path) -> lopdf::Result<Self> {
        let document = Document::load(path)?;
        Ok(Self::from_document(&document))
    }

    /// Like [`DocumentStructure::scan`], but a file lopdf cannot read (an
    /// encrypted one, typically) just yields no durations and no labels.
    pub fn scan_or_default(path: &Path) -> Self {
        match Self::scan(path) {
            Ok(structure) => structure,
            Err(err) => {
                warn!(path = %path.display(), %err, "could not scan document structure");
                Self::default()
            }
        }
    }

    pub fn from_document(document: &Document) -> Self {
        let pages = document.get_pages();
        let durations = pages
            .values()
            .map(|&id| {
                document
                    .get_dictionary(id)
                    .ok()
                    .and_then(|page| page.get(b"Dur").ok())
                    .and_then(number)
            })
            .collect();

        let catalog = document.catalog().ok();
        let labels = catalog
            .map(|catalog| page_labels(document, catalog, pages.len()))
            .unwrap_or_default();
        let unsupported = catalog
            .map(|catalog| unsupported_features(document, catalog))
            .unwrap_or_default();

        debug!(pages = pages.len(), ?unsupported, "scanned document structure");
        Self {
            durations,
            labels,
            unsupported,
        }
    }

    /// Seconds the page is meant to stay on screen, if declared.
    pub fn duration(&self, page: usize) -> Option<f32> {
        self.durations.get(page).copied().flatten()
    }

    pub fn label(&self, page: usize) -> Option<&str> {
        self.labels.get(page).and_then(|label| label.as_deref())
    }

    pub fn unsupported(&self) -> &[UnsupportedFeature] {
        &self.unsupported
    }
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> &'a Object {
    match object.as_reference() {
        Ok(id) => document.get_object(id).unwrap_or(object),
        Err(_) => object,
    }
}

fn resolve_dict<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    resolve(document, object).as_dict().ok()
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value),
        _ => None,
    }
}

fn unsupported_features(document: &Document, catalog: &Dictionary) -> Vec<UnsupportedFeature> {
    let mut found = Vec::new();
    if catalog.has(b"OCProperties") {
        found.push(UnsupportedFeature::OptionalContent);
    }

    let names = catalog
        .get(b"Names")
        .ok()
        .and_then(|names| resolve_dict(document, names));
    if names.is_some_and(|names| names.has(b"EmbeddedFiles")) {
        found.push(UnsupportedFeature::EmbeddedFiles);
    }

    let open_action_script = catalog
        .get(b"OpenAction")
        .ok()
        .and_then(|action| resolve_dict(document, action))
        .is_some_and(|action| {
            matches!(action.get(b"S"), Ok(Object::Name(kind)) if kind == b"JavaScript")
        });
    if names.is_some_and(|names| names.has(b"JavaScript")) || open_action_script {
        found.push(UnsupportedFeature::Scripts);
    }
    found
}

/// Label ranges from the catalog's `/PageLabels` number tree, expanded to one
/// entry per page.
fn page_labels(
    document: &Document,
    catalog: &Dictionary,
    page_count: usize,
) -> Vec<Option<String>> {
    let Some(root) = catalog
        .get(b"PageLabels")
        .ok()
        .and_then(|tree| resolve_dict(document, tree))
    else {
        return Vec::new();
    };

    let mut ranges = Vec::new();
    collect_label_ranges(document, root, &mut ranges, 0);
    ranges.sort_by_key(|range| range.start);

    (0..page_count)
        .map(|page| {
            ranges
                .iter()
                .rev()
                .find(|range| range.start <= page)
                .map(|range| range.label_for(page))
        })
        .collect()
}

#[derive(Debug)]
struct LabelRange {
    start: usize,
    style: Option<u8>,
    prefix: String,
    first_number: i64,
}

impl LabelRange {
    fn parse(document: &Document, start: usize, dict: &Dictionary) -> Self {
        let style = match dict.get(b"S") {
            Ok(Object::Name(name)) => name.first().copied(),
            _ => None,
        };
        let prefix = dict
            .get(b"P")
            .ok()
            .map(|prefix| resolve(document, prefix))
            .and_then(|prefix| match prefix {
                Object::String(bytes, _) => Some(decode_text(bytes)),
                _ => None,
            })
            .unwrap_or_default();
        let first_number = dict
            .get(b"St")
            .ok()
            .and_then(|start| start.as_i64().ok())
            .unwrap_or(1)
            .clamp(1, MAX_FIRST_NUMBER);

        Self {
            start,
            style,
            prefix,
            first_number,
        }
    }

    fn label_for(&self, page: usize) -> String {
        let offset = i64::try_from(page.saturating_sub(self.start)).unwrap_or(i64::MAX);
        let number = self.first_number.saturating_add(offset);
        let numeral = match self.style {
            Some(b'D') => number.to_string(),
            Some(b'R') => roman(number).to_uppercase(),
            Some(b'r') => roman(number),
            Some(b'A') => letters(number).to_uppercase(),
            Some(b'a') => letters(number),
            _ => String::new(),
        };
        format!("{}{}", self.prefix, numeral)
    }
}

fn collect_label_ranges(
    document: &Document,
    node: &Dictionary,
    out: &mut Vec<LabelRange>,
    depth: usize,
) {
    if depth > MAX_TREE_DEPTH {
        return;
    }

    if let Ok(nums) = node.get(b"Nums").and_then(Object::as_array) {
        for pair in nums.chunks_exact(2) {
            let start = pair[0].as_i64().ok().and_then(|n| usize::try_from(n).ok());
            let dict = resolve_dict(document, &pair[1]);
            if let (Some(start), Some(dict)) = (start, dict) {
                out.push(LabelRange::parse(document, start, dict));
            }
        }
    }

    if let Ok(kids) = node.get(b"Kids").and_then(Object::as_array) {
        for kid in kids {
            if let Some(kid) = resolve_dict(document, kid) {
                collect_label_ranges(document, kid, out, depth + 1);
            }
        }
    }
}

/// PDF text strings are either UTF-16BE with a byte order mark or
/// PDFDocEncoding, which matches Latin-1 for printable characters.
fn decode_text(bytes: &[u8]) -> String {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn roman(mut number: i64) -> String {
    if number > MAX_ROMAN {
        return number.to_string();
    }
    const NUMERALS: [(i64, &str); 13] = [
        (1000, "m"),
        (900, "cm"),
        (500, "d"),
        (400, "cd"),
        (100, "c"),
        (90, "xc"),
        (50, "l"),
        (40, "xl"),
        (10, "x"),
        (9, "ix"),
        (5, "v"),
        (4, "iv"),
        (1, "i"),
    ];
    let mut out = String::new();
    for (value, numeral) in NUMERALS {
        while number >= value {
            out.push_str(numeral);
            number -= value;
        }
    }
    out
}

/// a..z, then aa..zz, then aaa..zzz.
fn letters(number: i64) -> String {
    if number < 1 {
        return String::new();
    }
    if number > 26 * MAX_LETTER_REPEAT {
        return number.to_string();
    }
    let index = (number - 1) % 26;
    let repeat = (number - 1) / 26 + 1;
    let letter = char::from(b'a' + index as u8);
    std::iter::repeat(letter).take(repeat as usize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use lopdf::{dictionary, ObjectId, StringFormat};
    use tempfile::tempdir;

    fn build_document(durations: &[Option<Object>], catalog_extra: Dictionary) -> Document {
        let mut document = Document::with_version("1.5");
        let pages_id = document.new_object_id();

        let kids: Vec<Object> = durations
            .iter()
            .map(|duration| {
                let mut page = dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                    "MediaBox" => vec![0.into(), 0.into(), 400.into(), 300.into()],
                };
                if let Some(duration) = duration {
                    page.set("Dur", duration.clone());
                }
                let id: ObjectId = document.add_object(page);
                id.into()
            })
            .collect();

        let count = kids.len() as i64;
        document.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );

        let mut catalog = dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        };
        for (key, value) in catalog_extra.iter() {
            catalog.set(key.clone(), value.clone());
        }
        let catalog_id = document.add_object(catalog);
        document.trailer.set("Root", catalog_id);
        document
    }

    #[test]
    fn reads_page_durations_from_saved_file() {
        let mut document = build_document(
            &[None, Some(Object::Real(0.5)), Some(Object::Integer(3)), None],
            Dictionary::new(),
        );
        let dir = tempdir().unwrap();
        let path = dir.path().join("talk.pdf");
        document.save(&path).unwrap();

        let structure = DocumentStructure::scan(&path).unwrap();

        assert_eq!(structure.duration(0), None);
        assert_eq!(structure.duration(1), Some(0.5));
        assert_eq!(structure.duration(2), Some(3.0));
        assert_eq!(structure.duration(9), None);
        assert!(structure.unsupported().is_empty());
        assert_eq!(structure.label(0), None);
    }

    #[test]
    fn expands_page_label_ranges() {
        let labels = dictionary! {
            "Nums" => vec![
                0.into(),
                Object::Dictionary(dictionary! { "S" => "r" }),
                2.into(),
                Object::Dictionary(dictionary! {
                    "S" => "D",
                    "P" => Object::String(b"A-".to_vec(), StringFormat::Literal),
                    "St" => 7,
                }),
                4.into(),
                Object::Dictionary(dictionary! {
                    "P" => Object::String(b"Backup".to_vec(), StringFormat::Literal),
                }),
            ],
        };
        let document = build_document(
            &[None, None, None, None, None],
            dictionary! { "PageLabels" => Object::Dictionary(labels) },
        );

        let structure = DocumentStructure::from_document(&document);
        let found: Vec<Option<&str>> = (0..5).map(|page| structure.label(page)).collect();
        assert_eq!(
            found,
            vec![Some("i"), Some("ii"), Some("A-7"), Some("A-8"), Some("Backup")]
        );
    }

    #[test]
    fn flags_unsupported_catalog_entries() {
        let document = build_document(
            &[None],
            dictionary! {
                "OCProperties" => dictionary! { "OCGs" => Vec::<Object>::new() },
                "Names" => dictionary! {
                    "EmbeddedFiles" => dictionary! { "Names" => Vec::<Object>::new() },
                    "JavaScript" => dictionary! { "Names" => Vec::<Object>::new() },
                },
            },
        );

        let structure = DocumentStructure::from_document(&document);
        assert_eq!(
            structure.unsupported(),
            &[
                UnsupportedFeature::OptionalContent,
                UnsupportedFeature::EmbeddedFiles,
                UnsupportedFeature::Scripts,
            ]
        );
    }

    #[test]
    fn unreadable_file_yields_empty_structure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();

        assert_eq!(DocumentStructure::scan_or_default(&path), DocumentStructure::default());
    }

    #[test]
    fn numbering_styles() {
        assert_eq!(roman(1994), "mcmxciv");
        assert_eq!(letters(1), "a");
        assert_eq!(letters(28), "bb");
    }

    #[test]
    fn huge_label_numbers_stay_bounded() {
        let range = LabelRange {
            start: 0,
            style: Some(b'D'),
            prefix: String::new(),
            first_number: i64::MAX,
        };
        assert_eq!(range.label_for(1), i64::MAX.to_string());
        assert_eq!(roman(4000), "4000");
        assert_eq!(letters(1_000_000_000), "1000000000");

        let labels = dictionary! {
            "Nums" => vec![
                0.into(),
                Object::Dictionary(dictionary! { "S" => "R", "St" => i64::MAX }),
            ],
        };
        let document = build_document(
            &[None, None],
            dictionary! { "PageLabels" => Object::Dictionary(labels) },
        );
        let structure = DocumentStructure::from_document(&document);
        assert_eq!(structure.label(0), Some("1000000"));
        assert_eq!(structure.label(1), Some("1000001"));
    }
}
