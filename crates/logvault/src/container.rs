//! Self-describing recordset container
//!
//! Layout:
//!
//! ```text
//! #LVC1
//! {"device":"Dev","object_key":"Plane","recordsets":[{"ordinal":0,"name":"1) Flight","channel":1,"start_ms":1578614400000}]}
//! 0;altitude=12.5;speed=3
//! 0;altitude=14.0;speed=4
//! ```
//!
//! Line one is the magic, line two the JSON header. Every following line is a
//! sample of the recordset with the given ordinal. Truss extraction only reads
//! the first two lines.

use crate::error::ParseError;
use crate::parser::FormatParser;
use crate::types::{SourceKind, Truss, Vault};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

pub const CONTAINER_MAGIC: &str = "#LVC1";

/// Header lines longer than this are rejected without reading further
const MAX_HEADER_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub device: String,
    #[serde(default)]
    pub object_key: String,
    pub recordsets: Vec<RecordsetHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordsetHeader {
    pub ordinal: u32,
    pub name: String,
    pub channel: u32,
    pub start_ms: i64,
}

/// Read only the magic and header lines
pub fn read_header(path: &Path) -> Result<ContainerHeader, ParseError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file).take(MAX_HEADER_BYTES);
    read_header_from(&mut reader, path)
}

fn read_header_from<R: BufRead>(reader: &mut R, path: &Path) -> Result<ContainerHeader, ParseError> {
    let mut magic = String::new();
    reader.read_line(&mut magic)?;
    if magic.trim_end() != CONTAINER_MAGIC {
        return Err(ParseError::NotSupportedFormat(format!(
            "{}: missing {} magic",
            path.display(),
            CONTAINER_MAGIC
        )));
    }

    let mut header_line = String::new();
    reader.read_line(&mut header_line)?;
    if !header_line.ends_with('\n') && header_line.len() as u64 >= MAX_HEADER_BYTES - magic.len() as u64 {
        return Err(ParseError::Inconsistent(format!(
            "{}: header exceeds {} bytes",
            path.display(),
            MAX_HEADER_BYTES
        )));
    }

    serde_json::from_str(header_line.trim_end())
        .map_err(|e| ParseError::Inconsistent(format!("{}: bad header: {}", path.display(), e)))
}

/// Write a container file. Samples are `(ordinal, [(measurement, value)])`.
pub fn write_container(
    path: &Path,
    header: &ContainerHeader,
    samples: &[(u32, Vec<(&str, f64)>)],
) -> io::Result<()> {
    let mut file = io::BufWriter::new(File::create(path)?);
    writeln!(file, "{}", CONTAINER_MAGIC)?;
    let json = serde_json::to_string(header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(file, "{}", json)?;
    for (ordinal, values) in samples {
        let mut line = ordinal.to_string();
        for (name, value) in values {
            line.push(';');
            line.push_str(name);
            line.push('=');
            line.push_str(&value.to_string());
        }
        writeln!(file, "{}", line)?;
    }
    file.flush()
}

#[derive(Default)]
struct MeasurementStats {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

impl MeasurementStats {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }
}

/// Default parser for the container format. Raw imports are not supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerParser;

impl ContainerParser {
    fn parse_container(&self, path: &Path, trusses: &[Truss]) -> Result<Vec<Vault>, ParseError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let header = read_header_from(&mut reader, path)?;

        for truss in trusses {
            if !header.recordsets.iter().any(|r| r.ordinal == truss.recordset_ordinal) {
                return Err(ParseError::Inconsistent(format!(
                    "{}: no recordset with ordinal {}",
                    path.display(),
                    truss.recordset_ordinal
                )));
            }
        }

        let mut stats: BTreeMap<u32, BTreeMap<String, MeasurementStats>> = BTreeMap::new();
        let mut samples: BTreeMap<u32, i64> = BTreeMap::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split(';');
            let ordinal: u32 = fields
                .next()
                .unwrap_or_default()
                .trim()
                .parse()
                .map_err(|_| {
                    ParseError::TypeMismatch(format!(
                        "{}: sample line {} has no ordinal",
                        path.display(),
                        index + 3
                    ))
                })?;
            *samples.entry(ordinal).or_default() += 1;
            let per_recordset = stats.entry(ordinal).or_default();
            for field in fields {
                let (name, raw) = field.split_once('=').ok_or_else(|| {
                    ParseError::Inconsistent(format!(
                        "{}: malformed field '{}' on line {}",
                        path.display(),
                        field,
                        index + 3
                    ))
                })?;
                let value: f64 = raw.trim().parse().map_err(|_| {
                    ParseError::TypeMismatch(format!(
                        "{}: '{}' is not numeric on line {}",
                        path.display(),
                        raw,
                        index + 3
                    ))
                })?;
                per_recordset.entry(name.trim().to_string()).or_default().add(value);
            }
        }

        let vaults = trusses
            .iter()
            .cloned()
            .map(|truss| {
                let ordinal = truss.recordset_ordinal;
                let mut vault = Vault::from_truss(truss);
                if let Some(measurements) = stats.get(&ordinal) {
                    for (name, s) in measurements {
                        vault.metrics.insert(format!("{}.min", name), s.min);
                        vault.metrics.insert(format!("{}.max", name), s.max);
                        vault.metrics.insert(format!("{}.avg", name), s.sum / s.count as f64);
                    }
                }
                vault
                    .scores
                    .insert("samples".to_string(), samples.get(&ordinal).copied().unwrap_or(0));
                vault
            })
            .collect();
        Ok(vaults)
    }
}

impl FormatParser for ContainerParser {
    fn parse(&self, kind: SourceKind, path: &Path, trusses: &[Truss]) -> Result<Vec<Vault>, ParseError> {
        match kind {
            SourceKind::SelfDescribing => self.parse_container(path, trusses),
            SourceKind::ImportRaw => Err(ParseError::NotSupportedFormat(format!(
                "{}: raw import needs a device parser",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_truss;
    use tempfile::TempDir;

    fn header() -> ContainerHeader {
        ContainerHeader {
            device: "Dev".to_string(),
            object_key: "Plane".to_string(),
            recordsets: vec![
                RecordsetHeader { ordinal: 0, name: "1) Flight".to_string(), channel: 1, start_ms: 1_000 },
                RecordsetHeader { ordinal: 1, name: "2) Hover".to_string(), channel: 2, start_ms: 2_000 },
            ],
        }
    }

    #[test]
    fn test_header_only_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.lvc");
        write_container(&path, &header(), &[(0, vec![("alt", 1.0)])]).unwrap();

        assert_eq!(read_header(&path).unwrap(), header());
    }

    #[test]
    fn test_missing_magic_is_not_supported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.lvc");
        std::fs::write(&path, "hello\n{}\n").unwrap();

        assert!(matches!(read_header(&path), Err(ParseError::NotSupportedFormat(_))));
    }

    #[test]
    fn test_parse_computes_metrics_per_recordset() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.lvc");
        write_container(
            &path,
            &header(),
            &[
                (0, vec![("alt", 10.0), ("speed", 1.0)]),
                (0, vec![("alt", 30.0), ("speed", 3.0)]),
                (1, vec![("alt", 5.0)]),
            ],
        )
        .unwrap();

        let mut first = sample_truss(path.to_str().unwrap(), 1_000);
        first.recordset_ordinal = 0;
        let mut second = sample_truss(path.to_str().unwrap(), 2_000);
        second.recordset_ordinal = 1;

        let vaults = ContainerParser
            .parse(SourceKind::SelfDescribing, &path, &[first, second])
            .unwrap();

        assert_eq!(vaults.len(), 2);
        assert_eq!(vaults[0].metrics["alt.min"], 10.0);
        assert_eq!(vaults[0].metrics["alt.max"], 30.0);
        assert_eq!(vaults[0].metrics["alt.avg"], 20.0);
        assert_eq!(vaults[0].scores["samples"], 2);
        assert_eq!(vaults[1].scores["samples"], 1);
        assert!(!vaults[1].metrics.contains_key("speed.min"));
    }

    #[test]
    fn test_non_numeric_sample_is_type_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.lvc");
        write_container(&path, &header(), &[]).unwrap();
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("0;alt=high\n");
        std::fs::write(&path, content).unwrap();

        let truss = sample_truss(path.to_str().unwrap(), 1_000);
        assert!(matches!(
            ContainerParser.parse(SourceKind::SelfDescribing, &path, &[truss]),
            Err(ParseError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_unknown_ordinal_is_inconsistent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.lvc");
        write_container(&path, &header(), &[]).unwrap();

        let mut truss = sample_truss(path.to_str().unwrap(), 1_000);
        truss.recordset_ordinal = 7;
        assert!(matches!(
            ContainerParser.parse(SourceKind::SelfDescribing, &path, &[truss]),
            Err(ParseError::Inconsistent(_))
        ));
    }
}
