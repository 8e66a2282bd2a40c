// smap.rs - source map generation and parsing
//
// The debug mapping between original source positions and generated code
// positions travels in the SMAP text format: a header, one or more
// strata, each with a file section (*F) and a line section (*L),
// terminated by *E. Line entries use the compact form
//
//   InputStartLine[#FileId][,RepeatCount]:OutputStartLine[,Increment]
//
// where the file id is omitted when unchanged from the previous entry.
// Parsers must skip embedded sections (*O ... *C) they do not understand.
//
// `generate` takes a flat list of mapped lines and does the grouping: a
// new stratum starts whenever the language changes from the current
// stratum's, and each stratum assigns file ids in first-appearance
// order.

use crate::translate::CompileUnit;
use std::fmt::Write as _;
use std::sync::Arc;

/// Original source coordinates of one generated line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalEntry {
    pub file: String,
    pub line: u32,
    pub language: String,
}

/// One mapping record handed to `generate`. Built during translation,
/// discarded once the map text is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedLine {
    pub generated_line: u32,
    pub entry: OriginalEntry,
}

#[derive(Debug, thiserror::Error)]
pub enum SmapError {
    #[error("missing SMAP header")]
    MissingHeader,
    #[error("truncated source map")]
    Truncated,
    #[error("malformed line entry: {0}")]
    BadLineEntry(String),
    #[error("malformed file entry: {0}")]
    BadFileEntry(String),
    #[error("unterminated embedded section")]
    UnterminatedEmbedded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: u32,
    pub name: String,
    /// Full path form (the "+" file entry variant).
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub input_start: u32,
    /// None inherits the previous entry's file.
    pub file_id: Option<u32>,
    pub repeat: u32,
    pub output_start: u32,
    pub output_increment: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stratum {
    pub name: String,
    pub files: Vec<FileEntry>,
    pub lines: Vec<LineEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMap {
    pub output_file: String,
    pub default_stratum: String,
    pub strata: Vec<Stratum>,
}

impl SourceMap {
    pub fn new(output_file: &str, default_stratum: &str) -> SourceMap {
        SourceMap {
            output_file: output_file.to_string(),
            default_stratum: default_stratum.to_string(),
            strata: Vec::new(),
        }
    }

    /// Resolve an output line back to (file name, input line) within the
    /// default stratum.
    pub fn lookup(&self, output_line: u32) -> Option<(&str, u32)> {
        let stratum = self
            .strata
            .iter()
            .find(|s| s.name == self.default_stratum)?;
        let mut current_file = 0u32;
        let mut hit = None;
        for e in &stratum.lines {
            if let Some(f) = e.file_id {
                current_file = f;
            }
            for r in 0..e.repeat {
                let out = e.output_start + r * e.output_increment;
                let span = e.output_increment.max(1);
                if output_line >= out && output_line < out + span {
                    hit = Some((current_file, e.input_start + r));
                }
            }
        }
        let (file_id, line) = hit?;
        let name = stratum
            .files
            .iter()
            .find(|f| f.id == file_id)
            .map(|f| f.name.as_str())?;
        Some((name, line))
    }

    /// Flatten back to mapped lines, resolving inherited file ids and
    /// expanding repeat counts. Inverse of `build` for well-formed maps.
    pub fn mapped_lines(&self) -> Vec<MappedLine> {
        let mut out = Vec::new();
        for stratum in &self.strata {
            let mut current_file = 0u32;
            for e in &stratum.lines {
                if let Some(f) = e.file_id {
                    current_file = f;
                }
                let file = stratum
                    .files
                    .iter()
                    .find(|f| f.id == current_file)
                    .map(|f| f.name.clone())
                    .unwrap_or_default();
                for r in 0..e.repeat {
                    out.push(MappedLine {
                        generated_line: e.output_start + r * e.output_increment,
                        entry: OriginalEntry {
                            file: file.clone(),
                            line: e.input_start + r,
                            language: stratum.name.clone(),
                        },
                    });
                }
            }
        }
        out
    }

    pub fn to_smap(&self) -> String {
        let mut out = String::new();
        out.push_str("SMAP\n");
        let _ = writeln!(out, "{}", self.output_file);
        let _ = writeln!(out, "{}", self.default_stratum);
        for stratum in &self.strata {
            let _ = writeln!(out, "*S {}", stratum.name);
            out.push_str("*F\n");
            for f in &stratum.files {
                match &f.path {
                    Some(path) => {
                        let _ = writeln!(out, "+ {} {}", f.id, f.name);
                        let _ = writeln!(out, "{path}");
                    }
                    None => {
                        let _ = writeln!(out, "{} {}", f.id, f.name);
                    }
                }
            }
            out.push_str("*L\n");
            let mut current_file = None;
            for e in &stratum.lines {
                let _ = write!(out, "{}", e.input_start);
                if let Some(f) = e.file_id {
                    if current_file != Some(f) {
                        let _ = write!(out, "#{f}");
                        current_file = Some(f);
                    }
                }
                if e.repeat != 1 {
                    let _ = write!(out, ",{}", e.repeat);
                }
                let _ = write!(out, ":{}", e.output_start);
                if e.output_increment != 1 {
                    let _ = write!(out, ",{}", e.output_increment);
                }
                out.push('\n');
            }
        }
        out.push_str("*E\n");
        out
    }

    pub fn parse(text: &str) -> Result<SourceMap, SmapError> {
        let mut lines = text.lines().peekable();
        if lines.next() != Some("SMAP") {
            return Err(SmapError::MissingHeader);
        }
        let output_file = lines.next().ok_or(SmapError::Truncated)?.to_string();
        let default_stratum = lines.next().ok_or(SmapError::Truncated)?.to_string();

        let mut map = SourceMap {
            output_file,
            default_stratum,
            strata: Vec::new(),
        };
        let mut stratum: Option<Stratum> = None;
        let mut section = "";

        while let Some(line) = lines.next() {
            if let Some(name) = line.strip_prefix("*S ") {
                if let Some(s) = stratum.take() {
                    map.strata.push(s);
                }
                stratum = Some(Stratum {
                    name: name.to_string(),
                    files: Vec::new(),
                    lines: Vec::new(),
                });
                section = "";
            } else if line == "*F" {
                section = "F";
            } else if line == "*L" {
                section = "L";
            } else if line == "*E" {
                break;
            } else if line.starts_with("*O") {
                // Embedded section for another tool: skip to the matching
                // close marker, allowing nesting.
                let mut depth = 1;
                for inner in lines.by_ref() {
                    if inner.starts_with("*O") {
                        depth += 1;
                    } else if inner.starts_with("*C") {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                }
                if depth != 0 {
                    return Err(SmapError::UnterminatedEmbedded);
                }
            } else if let Some(s) = stratum.as_mut() {
                match section {
                    "F" => {
                        let entry = if let Some(rest) = line.strip_prefix("+ ") {
                            let (id, name) = split_file_line(rest)?;
                            let path = lines.next().ok_or(SmapError::Truncated)?.to_string();
                            FileEntry {
                                id,
                                name,
                                path: Some(path),
                            }
                        } else {
                            let (id, name) = split_file_line(line)?;
                            FileEntry {
                                id,
                                name,
                                path: None,
                            }
                        };
                        s.files.push(entry);
                    }
                    "L" => s.lines.push(parse_line_entry(line)?),
                    _ => {}
                }
            }
        }
        if let Some(s) = stratum.take() {
            map.strata.push(s);
        }
        Ok(map)
    }
}

fn split_file_line(line: &str) -> Result<(u32, String), SmapError> {
    let (id, name) = line
        .split_once(' ')
        .ok_or_else(|| SmapError::BadFileEntry(line.to_string()))?;
    let id = id
        .parse()
        .map_err(|_| SmapError::BadFileEntry(line.to_string()))?;
    Ok((id, name.to_string()))
}

fn parse_line_entry(line: &str) -> Result<LineEntry, SmapError> {
    let bad = || SmapError::BadLineEntry(line.to_string());
    let (input, output) = line.split_once(':').ok_or_else(bad)?;

    let (input, repeat) = match input.split_once(',') {
        Some((i, r)) => (i, r.parse().map_err(|_| bad())?),
        None => (input, 1),
    };
    let (input_start, file_id) = match input.split_once('#') {
        Some((i, f)) => (
            i.parse().map_err(|_| bad())?,
            Some(f.parse().map_err(|_| bad())?),
        ),
        None => (input.parse().map_err(|_| bad())?, None),
    };
    let (output_start, output_increment) = match output.split_once(',') {
        Some((o, inc)) => (
            o.parse().map_err(|_| bad())?,
            inc.parse().map_err(|_| bad())?,
        ),
        None => (output.parse().map_err(|_| bad())?, 1),
    };
    Ok(LineEntry {
        input_start,
        file_id,
        repeat,
        output_start,
        output_increment,
    })
}

/// Emit the map text for a flat list of mapped lines.
pub fn generate(output_file: &str, lines: &[MappedLine]) -> String {
    build(output_file, lines).to_smap()
}

/// Structured form of `generate`. Lines are grouped by file inside each
/// stratum; a language change relative to the current stratum opens a
/// new one. The first line's language becomes the default stratum.
pub fn build(output_file: &str, lines: &[MappedLine]) -> SourceMap {
    let default_stratum = lines
        .first()
        .map(|l| l.entry.language.clone())
        .unwrap_or_else(|| "Wasm".to_string());
    let mut map = SourceMap::new(output_file, &default_stratum);
    let mut last_file: Option<u32> = None;

    for l in lines {
        if map
            .strata
            .last()
            .map_or(true, |s| s.name != l.entry.language)
        {
            map.strata.push(Stratum {
                name: l.entry.language.clone(),
                files: Vec::new(),
                lines: Vec::new(),
            });
            last_file = None;
        }
        let Some(stratum) = map.strata.last_mut() else {
            continue;
        };
        let file_id = match stratum.files.iter().find(|f| f.name == l.entry.file) {
            Some(f) => f.id,
            None => {
                let id = stratum.files.len() as u32;
                stratum.files.push(FileEntry {
                    id,
                    name: l.entry.file.clone(),
                    path: None,
                });
                id
            }
        };
        stratum.lines.push(LineEntry {
            input_start: l.entry.line,
            file_id: if last_file == Some(file_id) {
                None
            } else {
                Some(file_id)
            },
            repeat: 1,
            output_start: l.generated_line,
            output_increment: 1,
        });
        last_file = Some(file_id);
    }
    map
}

/// Build the source map for a set of compiled functions: instruction
/// indices (1-based) of the source module map to op positions (1-based)
/// in the concatenated output, one contiguous range per function.
pub fn from_units(output_file: &str, source_name: &str, units: &[Arc<CompileUnit>]) -> SourceMap {
    let mut lines = Vec::new();
    let mut output_base = 0u32;
    for unit in units {
        for &(op_pc, instr_idx) in &unit.line_map {
            lines.push(MappedLine {
                generated_line: output_base + op_pc + 1,
                entry: OriginalEntry {
                    file: source_name.to_string(),
                    line: instr_idx + 1,
                    language: "Wasm".to_string(),
                },
            });
        }
        output_base += unit.ops.len() as u32;
    }
    build(output_file, &lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ValType;

    fn sample_map() -> SourceMap {
        SourceMap {
            output_file: "app_unit_0".to_string(),
            default_stratum: "Wasm".to_string(),
            strata: vec![Stratum {
                name: "Wasm".to_string(),
                files: vec![
                    FileEntry {
                        id: 0,
                        name: "main.wasm".to_string(),
                        path: Some("src/main.wasm".to_string()),
                    },
                    FileEntry {
                        id: 1,
                        name: "lib.wasm".to_string(),
                        path: None,
                    },
                ],
                lines: vec![
                    LineEntry {
                        input_start: 1,
                        file_id: Some(0),
                        repeat: 3,
                        output_start: 10,
                        output_increment: 2,
                    },
                    LineEntry {
                        input_start: 9,
                        file_id: None,
                        repeat: 1,
                        output_start: 20,
                        output_increment: 1,
                    },
                    LineEntry {
                        input_start: 4,
                        file_id: Some(1),
                        repeat: 1,
                        output_start: 30,
                        output_increment: 1,
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_round_trip() {
        let map = sample_map();
        let text = map.to_smap();
        let parsed = SourceMap::parse(&text).unwrap();
        assert_eq!(parsed.output_file, map.output_file);
        assert_eq!(parsed.strata.len(), 1);
        assert_eq!(parsed.strata[0].files, map.strata[0].files);
        assert_eq!(parsed.strata[0].lines, map.strata[0].lines);
    }

    #[test]
    fn test_unchanged_file_id_is_omitted() {
        let text = sample_map().to_smap();
        assert!(text.contains("1#0,3:10,2"));
        assert!(text.contains("9:20"));
        assert!(text.contains("4#1:30"));
    }

    #[test]
    fn test_embedded_sections_are_skipped() {
        let text = "SMAP\nout\nWasm\n*S Wasm\n*F\n0 f.wasm\n*L\n*O other\n99:99\n*O nested\n*C nested\n*C other\n5:6\n*E\n";
        let map = SourceMap::parse(text).unwrap();
        assert_eq!(
            map.strata[0].lines,
            vec![LineEntry {
                input_start: 5,
                file_id: None,
                repeat: 1,
                output_start: 6,
                output_increment: 1,
            }]
        );
    }

    #[test]
    fn test_missing_header_rejected() {
        assert!(matches!(
            SourceMap::parse("not a map"),
            Err(SmapError::MissingHeader)
        ));
    }

    #[test]
    fn test_lookup_resolves_repeats() {
        let map = sample_map();
        // Third repetition of the first entry: input 3, output 14..15.
        assert_eq!(map.lookup(14), Some(("main.wasm", 3)));
        assert_eq!(map.lookup(30), Some(("lib.wasm", 4)));
        assert_eq!(map.lookup(999), None);
    }

    fn mapped(generated: u32, file: &str, line: u32, language: &str) -> MappedLine {
        MappedLine {
            generated_line: generated,
            entry: OriginalEntry {
                file: file.to_string(),
                line,
                language: language.to_string(),
            },
        }
    }

    #[test]
    fn test_generate_round_trips_files_and_strata() {
        let lines = vec![
            mapped(1, "main.wasm", 3, "Wasm"),
            mapped(2, "main.wasm", 4, "Wasm"),
            mapped(3, "lib.wasm", 7, "Wasm"),
            mapped(4, "main.wasm", 5, "Wasm"),
            mapped(5, "glue.js", 12, "JS"),
            mapped(6, "glue.js", 13, "JS"),
        ];
        let text = generate("app_unit_0", &lines);
        let parsed = SourceMap::parse(&text).unwrap();
        assert_eq!(parsed.default_stratum, "Wasm");
        assert_eq!(parsed.strata.len(), 2);
        assert_eq!(parsed.strata[0].files.len(), 2);
        assert_eq!(parsed.strata[0].files[0].name, "main.wasm");
        assert_eq!(parsed.strata[0].files[1].name, "lib.wasm");
        assert_eq!(parsed.strata[1].files.len(), 1);
        assert_eq!(parsed.strata[1].files[0].name, "glue.js");
        assert_eq!(parsed.mapped_lines(), lines);
    }

    #[test]
    fn test_alternating_languages_open_new_strata() {
        let lines = vec![
            mapped(1, "a.wasm", 1, "Wasm"),
            mapped(2, "b.js", 1, "JS"),
            mapped(3, "a.wasm", 2, "Wasm"),
        ];
        let map = build("out", &lines);
        let names: Vec<&str> = map.strata.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Wasm", "JS", "Wasm"]);
        // File ids restart per stratum, and the first entry of each
        // stratum always carries its id explicitly.
        for s in &map.strata {
            assert_eq!(s.files[0].id, 0);
            assert_eq!(s.lines[0].file_id, Some(0));
        }
        assert_eq!(map.mapped_lines(), lines);
    }

    #[test]
    fn test_generate_empty_input() {
        let text = generate("out", &[]);
        let parsed = SourceMap::parse(&text).unwrap();
        assert_eq!(parsed.default_stratum, "Wasm");
        assert!(parsed.strata.is_empty());
        assert!(parsed.mapped_lines().is_empty());
    }

    #[test]
    fn test_from_units_offsets_successive_functions() {
        let unit = |func_index: u32, n_ops: usize, line_map: Vec<(u32, u32)>| {
            Arc::new(CompileUnit {
                func_index,
                params: vec![],
                results: vec![],
                local_types: vec![ValType::I32],
                frame_size: 1,
                ops: vec![crate::translate::Op::Return { regs: vec![] }; n_ops],
                line_map,
            })
        };
        let units = vec![
            unit(0, 4, vec![(0, 0), (2, 1)]),
            unit(1, 2, vec![(0, 0)]),
        ];
        let map = from_units("app_unit_0", "m.wasm", &units);
        let lines = &map.strata[0].lines;
        assert_eq!(lines[0].output_start, 1);
        assert_eq!(lines[1].output_start, 3);
        // Second function starts after the first one's four ops.
        assert_eq!(lines[2].output_start, 5);
        assert_eq!(lines[0].file_id, Some(0));
        assert_eq!(lines[2].file_id, None);
    }
}
