// SPDX-License-Identifier: MIT OR Apache-2.0
//! SyncTeX position-map parsing and lookup.
//!
//! The TeX engine emits a gzip-wrapped text file mapping source positions
//! to page coordinates. [`PositionMap`] parses it into a compact index
//! queryable in both directions: [`PositionMap::source_to_page`] for
//! forward sync (editor line → page position) and
//! [`PositionMap::page_to_source`] for inverse sync (click → source line).
//!
//! The format is line-oriented. A preamble declares numeric file ids
//! (`Input:<id>:<path>`) and ends at the literal `Content:` line. The
//! content section interleaves page markers (`{<n>` opens page `n`, `}`
//! closes it) with record lines whose leading byte is one of
//! `h x g k v $ [ (` followed by `<file>,<line>,<col>:<x>,<y>` and an
//! optional `:<w>,<h>,<d>` tail. Coordinates are fixed-point: 65536 units
//! per typographic point.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::io::Read;

/// Fixed-point units per typographic point (1/72 inch).
pub const UNITS_PER_POINT: f32 = 65536.0;

/// Default page height used for `y_norm` when none is supplied (A4).
pub const DEFAULT_PAGE_HEIGHT_PT: f32 = 842.0;

/// Sandbox-interior path prefixes stripped during normalization, so
/// lookups by user-facing project paths succeed.
const MOUNT_PREFIXES: &[&str] = &["/work/source/", "/work/output/"];

/// Leading bytes that introduce a record line in the content section.
const RECORD_TAGS: &[u8] = b"hxgkv$[(";

/// Errors from parsing a position map.
#[derive(Debug, thiserror::Error)]
pub enum SynctexError {
    /// The gzip envelope could not be decompressed (or was not UTF-8).
    #[error("failed to decompress position map: {0}")]
    Decompress(#[from] std::io::Error),

    /// The file has no `Content:` section marker.
    #[error("position map has no Content: section")]
    MissingContent,
}

/// One source↔page correspondence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosRecord {
    /// Index into [`PositionMap::files`].
    pub file: u32,
    /// 1-based source line.
    pub line: u32,
    /// Source column; `-1` when the engine did not track it.
    pub column: i32,
    /// 1-based page number.
    pub page: u32,
    /// Horizontal position in points, from the page's left edge.
    pub x: f32,
    /// Vertical position in points, from the page's top edge.
    pub y: f32,
    /// Box width in points (0 for point-like records).
    pub width: f32,
    /// Box height in points (0 for point-like records).
    pub height: f32,
}

/// Forward-lookup result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PagePosition {
    /// Page the line lands on.
    pub page: u32,
    /// Horizontal position in points.
    pub x: f32,
    /// Vertical position in points.
    pub y: f32,
    /// `y` as a fraction of the page height, clamped to `[0, 1]`.
    pub y_norm: f32,
}

/// Inverse-lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePosition {
    /// Normalized source file path.
    pub file: String,
    /// 1-based source line.
    pub line: u32,
    /// Source column; `-1` when untracked.
    pub column: i32,
}

/// Parsed, queryable position map.
///
/// Storage is a flat record vector plus two index maps; groups are small
/// and queried at interactive rates, so indices are plain sorted vectors
/// of record offsets.
#[derive(Debug, Default)]
pub struct PositionMap {
    records: Vec<PosRecord>,
    files: Vec<String>,
    by_file: HashMap<String, Vec<u32>>,
    by_page: HashMap<u32, Vec<u32>>,
    skipped: usize,
}

impl PositionMap {
    /// Decompress a gzip envelope and parse the contained map.
    ///
    /// # Errors
    ///
    /// Returns [`SynctexError::Decompress`] or
    /// [`SynctexError::MissingContent`].
    pub fn parse_gz(bytes: &[u8]) -> Result<Self, SynctexError> {
        let mut text = String::new();
        flate2::read::GzDecoder::new(bytes).read_to_string(&mut text)?;
        Self::parse(&text)
    }

    /// Parse the decompressed text form of the map.
    ///
    /// Record lines that fail to parse, reference an undeclared file id,
    /// carry a non-positive line number, or fall outside a page block are
    /// skipped and counted in [`PositionMap::skipped_records`].
    ///
    /// # Errors
    ///
    /// Returns [`SynctexError::MissingContent`] if the `Content:` marker
    /// never appears.
    pub fn parse(text: &str) -> Result<Self, SynctexError> {
        let mut map = Self::default();
        // synctex id → index into map.files
        let mut file_ids: HashMap<u32, u32> = HashMap::new();

        let mut lines = text.lines();
        let mut saw_content = false;
        for line in lines.by_ref() {
            if line == "Content:" {
                saw_content = true;
                break;
            }
            if let Some(rest) = line.strip_prefix("Input:") {
                if let Some((id, path)) = rest.split_once(':') {
                    if let Ok(id) = id.parse::<u32>() {
                        let normalized = normalize_path(path);
                        let idx = map.files.len() as u32;
                        map.files.push(normalized.clone());
                        file_ids.insert(id, idx);
                        map.by_file.entry(normalized).or_default();
                    }
                }
            }
        }
        if !saw_content {
            return Err(SynctexError::MissingContent);
        }

        let mut current_page: Option<u32> = None;
        for line in lines {
            let bytes = line.as_bytes();
            let Some(&first) = bytes.first() else {
                continue;
            };
            match first {
                b'{' => {
                    current_page = line[1..].parse::<u32>().ok().filter(|p| *p >= 1);
                }
                b'}' => {
                    current_page = None;
                }
                _ if RECORD_TAGS.contains(&first) => {
                    let Some(page) = current_page else {
                        map.skipped += 1;
                        continue;
                    };
                    match parse_record(&line[1..], page, &file_ids) {
                        Some(record) => map.push(record),
                        None => map.skipped += 1,
                    }
                }
                // Preamble echoes, box closers, postamble: not records.
                _ => {}
            }
        }

        map.finish();
        Ok(map)
    }

    fn push(&mut self, record: PosRecord) {
        let idx = self.records.len() as u32;
        let path = &self.files[record.file as usize];
        self.by_file.get_mut(path).expect("file group exists").push(idx);
        self.by_page.entry(record.page).or_default().push(idx);
        self.records.push(record);
    }

    fn finish(&mut self) {
        let records = &self.records;
        for group in self.by_file.values_mut() {
            // Stable: ties keep input order.
            group.sort_by_key(|&i| records[i as usize].line);
        }
        for group in self.by_page.values_mut() {
            group.sort_by(|&a, &b| {
                records[a as usize]
                    .y
                    .partial_cmp(&records[b as usize].y)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    /// All parsed records in input order.
    #[must_use]
    pub fn records(&self) -> &[PosRecord] {
        &self.records
    }

    /// Normalized paths of all declared input files.
    #[must_use]
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Normalized path of the file a record points into.
    #[must_use]
    pub fn file_path(&self, record: &PosRecord) -> &str {
        &self.files[record.file as usize]
    }

    /// Number of content lines that looked like records but were skipped.
    #[must_use]
    pub fn skipped_records(&self) -> usize {
        self.skipped
    }

    /// Forward lookup: where does `line` of `file` land on the page?
    ///
    /// Finds the record with the largest line number `≤ line` in the
    /// file's group (among equals, the earliest record of that line).
    /// When `file` has no exact match, files sharing its basename are
    /// tried instead. `y_norm` uses `page_height` or
    /// [`DEFAULT_PAGE_HEIGHT_PT`].
    #[must_use]
    pub fn source_to_page(
        &self,
        file: &str,
        line: u32,
        page_height: Option<f32>,
    ) -> Option<PagePosition> {
        let group = self.file_group(file)?;
        if group.is_empty() {
            return None;
        }
        // First index whose line exceeds the query.
        let upper = group.partition_point(|&i| self.records[i as usize].line <= line);
        if upper == 0 {
            return None;
        }
        let best_line = self.records[group[upper - 1] as usize].line;
        // Walk back to the earliest record of that line.
        let first_of_run = group[..upper]
            .iter()
            .rposition(|&i| self.records[i as usize].line != best_line)
            .map_or(0, |p| p + 1);
        let record = &self.records[group[first_of_run] as usize];

        let height = page_height.unwrap_or(DEFAULT_PAGE_HEIGHT_PT);
        Some(PagePosition {
            page: record.page,
            x: record.x,
            y: record.y,
            y_norm: (record.y / height).clamp(0.0, 1.0),
        })
    }

    /// Inverse lookup: which source position sits closest to `(x, y)` on
    /// `page`? Distance is squared-Euclidean over record anchor points.
    #[must_use]
    pub fn page_to_source(&self, page: u32, x: f32, y: f32) -> Option<SourcePosition> {
        let group = self.by_page.get(&page)?;
        let best = group.iter().min_by(|&&a, &&b| {
            let da = dist2(&self.records[a as usize], x, y);
            let db = dist2(&self.records[b as usize], x, y);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })?;
        let record = &self.records[*best as usize];
        Some(SourcePosition {
            file: self.file_path(record).to_string(),
            line: record.line,
            column: record.column,
        })
    }

    /// For one file, the first page each line was seen on, in record
    /// input order.
    #[must_use]
    pub fn line_pages(&self, file: &str) -> HashMap<u32, u32> {
        let mut pages = HashMap::new();
        let Some(target) = self.resolve_file(file) else {
            return pages;
        };
        for record in &self.records {
            if record.file == target {
                pages.entry(record.line).or_insert(record.page);
            }
        }
        pages
    }

    fn file_group(&self, file: &str) -> Option<&[u32]> {
        let idx = self.resolve_file(file)?;
        self.by_file
            .get(&self.files[idx as usize])
            .map(Vec::as_slice)
    }

    /// Exact path match, falling back to basename agreement. Among
    /// several basename candidates the lexicographically smallest path
    /// wins, which keeps the fallback deterministic.
    fn resolve_file(&self, file: &str) -> Option<u32> {
        let normalized = normalize_path(file);
        if let Some(idx) = self.files.iter().position(|f| *f == normalized) {
            return Some(idx as u32);
        }
        let query_base = basename(&normalized);
        self.files
            .iter()
            .enumerate()
            .filter(|(_, f)| basename(f) == query_base)
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(idx, _)| idx as u32)
    }
}

fn dist2(record: &PosRecord, x: f32, y: f32) -> f32 {
    let dx = record.x - x;
    let dy = record.y - y;
    dx * dx + dy * dy
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Strip a leading `./` and any sandbox mount prefix.
fn normalize_path(path: &str) -> String {
    let mut p = path.trim();
    for prefix in MOUNT_PREFIXES {
        if let Some(rest) = p.strip_prefix(prefix) {
            p = rest;
            break;
        }
    }
    p.strip_prefix("./").unwrap_or(p).to_string()
}

/// Parse a record body `<file>,<line>,<col>:<x>,<y>[:<w>,<h>,<d>]`.
fn parse_record(body: &str, page: u32, file_ids: &HashMap<u32, u32>) -> Option<PosRecord> {
    let mut sections = body.split(':');
    let head = sections.next()?;
    let pos = sections.next()?;
    let size = sections.next();

    let mut head_parts = head.split(',');
    let file_id: u32 = head_parts.next()?.parse().ok()?;
    let line: i64 = head_parts.next()?.parse().ok()?;
    let column: i32 = head_parts.next().and_then(|c| c.parse().ok()).unwrap_or(-1);
    if line <= 0 {
        return None;
    }
    let file = *file_ids.get(&file_id)?;

    let (x_raw, y_raw) = pos.split_once(',')?;
    let x: i64 = x_raw.parse().ok()?;
    let y: i64 = y_raw.parse().ok()?;

    let (mut width, mut height) = (0i64, 0i64);
    if let Some(size) = size {
        let mut parts = size.split(',');
        if let Some(w) = parts.next().and_then(|v| v.parse().ok()) {
            width = w;
        }
        if let Some(h) = parts.next().and_then(|v| v.parse().ok()) {
            height = h;
        }
        // A trailing depth component is parsed past but not retained.
    }

    Some(PosRecord {
        file,
        line: line as u32,
        column,
        page,
        x: x as f32 / UNITS_PER_POINT,
        y: y as f32 / UNITS_PER_POINT,
        width: width as f32 / UNITS_PER_POINT,
        height: height as f32 / UNITS_PER_POINT,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TWO_PAGE_MAP: &str = "\
SyncTeX Version:1
Input:1:./main.tex
Input:2:/work/source/chapters/intro.tex
Output:pdf
Magnitude:1000
Unit:1
X Offset:0
Y Offset:0
Content:
!60
{1
[1,1:4736286,4736286:39158276,52099715,0
h1,1:4736286,4736286:0,655360,0
x1,2:4736286,9437184
k1,2:5242880,9437184:655360
v2,3:4736286,13107200:0,786432,0
g2,4:6553600,13107200
]
}
{2
[1,10:4736286,4736286:39158276,52099715,0
x1,10:4736286,6553600
$2,12:5242880,10485760
(1,13:6553600,45875200
]
}
Postamble:
";

    fn gzipped(text: &str) -> Vec<u8> {
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn preamble_paths_are_normalized() {
        let map = PositionMap::parse(TWO_PAGE_MAP).unwrap();
        assert_eq!(map.files(), &["main.tex", "chapters/intro.tex"]);
    }

    #[test]
    fn coordinates_are_scaled_to_points() {
        let map = PositionMap::parse(TWO_PAGE_MAP).unwrap();
        let first = &map.records()[0];
        assert!((first.x - 4_736_286.0 / 65_536.0).abs() < 1e-3);
        assert_eq!(first.page, 1);
        assert_eq!(first.line, 1);
    }

    #[test]
    fn all_record_tags_are_recognized() {
        // TWO_PAGE_MAP exercises every tag in {h,x,g,k,v,$,[,(}.
        let map = PositionMap::parse(TWO_PAGE_MAP).unwrap();
        assert_eq!(map.records().len(), 10);
        assert_eq!(map.skipped_records(), 0);
    }

    #[test]
    fn forward_lookup_exact_line() {
        let map = PositionMap::parse(TWO_PAGE_MAP).unwrap();
        let pos = map.source_to_page("main.tex", 10, None).unwrap();
        assert_eq!(pos.page, 2);
        assert!(pos.y_norm >= 0.0 && pos.y_norm <= 1.0);
    }

    #[test]
    fn forward_lookup_rounds_down_to_nearest_line() {
        let map = PositionMap::parse(TWO_PAGE_MAP).unwrap();
        // Line 7 has no record; line 2 is the largest ≤ 7 for main.tex
        // on page 1 ordering... the largest line ≤ 7 is 2.
        let pos = map.source_to_page("main.tex", 7, None).unwrap();
        assert_eq!(pos.page, 1);
    }

    #[test]
    fn forward_lookup_before_first_record_is_none() {
        let text = "Input:1:a.tex\nContent:\n{1\nx1,5:65536,65536\n}\n";
        let map = PositionMap::parse(text).unwrap();
        assert!(map.source_to_page("a.tex", 4, None).is_none());
        assert!(map.source_to_page("a.tex", 5, None).is_some());
    }

    #[test]
    fn forward_lookup_prefers_earliest_record_of_line() {
        let text = "Input:1:a.tex\nContent:\n{1\nx1,5:65536,131072\nx1,5:655360,131072\n}\n";
        let map = PositionMap::parse(text).unwrap();
        let pos = map.source_to_page("a.tex", 5, None).unwrap();
        assert!((pos.x - 1.0).abs() < 1e-4);
    }

    #[test]
    fn forward_lookup_basename_fallback() {
        let map = PositionMap::parse(TWO_PAGE_MAP).unwrap();
        let pos = map.source_to_page("anywhere/else/intro.tex", 3, None).unwrap();
        assert_eq!(pos.page, 1);
    }

    #[test]
    fn y_norm_respects_custom_page_height() {
        let text = "Input:1:a.tex\nContent:\n{1\nx1,1:0,6553600\n}\n";
        let map = PositionMap::parse(text).unwrap();
        let pos = map.source_to_page("a.tex", 1, Some(200.0)).unwrap();
        assert!((pos.y - 100.0).abs() < 1e-3);
        assert!((pos.y_norm - 0.5).abs() < 1e-4);
    }

    #[test]
    fn y_norm_clamps_to_unit_interval() {
        let text = "Input:1:a.tex\nContent:\n{1\nx1,1:0,655360000\n}\n";
        let map = PositionMap::parse(text).unwrap();
        let pos = map.source_to_page("a.tex", 1, None).unwrap();
        assert_eq!(pos.y_norm, 1.0);
    }

    #[test]
    fn inverse_lookup_picks_nearest_record() {
        let map = PositionMap::parse(TWO_PAGE_MAP).unwrap();
        // Exactly on the x record of line 10, page 2.
        let x = 4_736_286.0 / 65_536.0;
        let y = 6_553_600.0 / 65_536.0;
        let src = map.page_to_source(2, x, y).unwrap();
        assert_eq!(src.file, "main.tex");
        assert_eq!(src.line, 10);
    }

    #[test]
    fn inverse_lookup_unknown_page_is_none() {
        let map = PositionMap::parse(TWO_PAGE_MAP).unwrap();
        assert!(map.page_to_source(9, 0.0, 0.0).is_none());
    }

    #[test]
    fn forward_then_inverse_agree() {
        let map = PositionMap::parse(TWO_PAGE_MAP).unwrap();
        let pos = map.source_to_page("chapters/intro.tex", 3, None).unwrap();
        let back = map.page_to_source(pos.page, pos.x, pos.y).unwrap();
        assert_eq!(back.file, "chapters/intro.tex");
        assert_eq!(back.line, 3);
    }

    #[test]
    fn line_pages_first_page_wins() {
        let text = "\
Input:1:a.tex
Content:
{1
x1,5:65536,65536
}
{2
x1,5:65536,65536
x1,6:65536,131072
}
";
        let map = PositionMap::parse(text).unwrap();
        let pages = map.line_pages("a.tex");
        assert_eq!(pages.get(&5), Some(&1));
        assert_eq!(pages.get(&6), Some(&2));
        assert!(pages.get(&7).is_none());
    }

    #[test]
    fn nonpositive_lines_and_unknown_files_are_skipped() {
        let text = "\
Input:1:a.tex
Content:
{1
x1,0:65536,65536
x1,-3:65536,65536
x9,1:65536,65536
x1,1:65536,65536
}
";
        let map = PositionMap::parse(text).unwrap();
        assert_eq!(map.records().len(), 1);
        assert_eq!(map.skipped_records(), 3);
    }

    #[test]
    fn records_outside_page_blocks_are_skipped() {
        let text = "Input:1:a.tex\nContent:\nx1,1:65536,65536\n{1\nx1,2:65536,65536\n}\n";
        let map = PositionMap::parse(text).unwrap();
        assert_eq!(map.records().len(), 1);
        assert_eq!(map.skipped_records(), 1);
    }

    #[test]
    fn missing_content_marker_is_an_error() {
        let err = PositionMap::parse("Input:1:a.tex\n").unwrap_err();
        assert!(matches!(err, SynctexError::MissingContent));
    }

    #[test]
    fn gzip_roundtrip() {
        let map = PositionMap::parse_gz(&gzipped(TWO_PAGE_MAP)).unwrap();
        assert_eq!(map.records().len(), 10);
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        let err = PositionMap::parse_gz(b"not gzip at all").unwrap_err();
        assert!(matches!(err, SynctexError::Decompress(_)));
    }

    #[test]
    fn malformed_record_bodies_are_skipped() {
        let text = "Input:1:a.tex\nContent:\n{1\nxgarbage\nx1,1\nx1,1:65536,65536\n}\n";
        let map = PositionMap::parse(text).unwrap();
        assert_eq!(map.records().len(), 1);
        assert_eq!(map.skipped_records(), 2);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Every emitted record must round-trip: forward lookup of its
            /// (file, line) lands on its page, and inverse lookup at its
            /// exact coordinates returns its (file, line).
            #[test]
            fn parse_roundtrip(
                lines in proptest::collection::vec((1u32..200, 0i64..10_000_000, 0i64..50_000_000), 1..20),
            ) {
                let mut text = String::from("Input:1:doc.tex\nContent:\n{1\n");
                for (line, x, y) in &lines {
                    text.push_str(&format!("x1,{line}:{x},{y}\n"));
                }
                text.push_str("}\n");
                let map = PositionMap::parse(&text).unwrap();
                prop_assert_eq!(map.records().len(), lines.len());

                for record in map.records() {
                    let fwd = map.source_to_page("doc.tex", record.line, None).unwrap();
                    prop_assert_eq!(fwd.page, record.page);
                    let back = map.page_to_source(record.page, record.x, record.y).unwrap();
                    prop_assert_eq!(back.file.as_str(), "doc.tex");
                }
            }
        }
    }
}
