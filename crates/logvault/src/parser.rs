//! Format parser boundary

use crate::error::ParseError;
use crate::types::{SourceKind, Truss, Vault};
use std::path::Path;

/// Parses one physical file into vaults for the given trusses.
///
/// All trusses share `path` as their resolved path. Implementations return
/// one vault per truss they could promote.
pub trait FormatParser: Send + Sync {
    fn parse(&self, kind: SourceKind, path: &Path, trusses: &[Truss]) -> Result<Vec<Vault>, ParseError>;
}

impl<F> FormatParser for F
where
    F: Fn(SourceKind, &Path, &[Truss]) -> Result<Vec<Vault>, ParseError> + Send + Sync,
{
    fn parse(&self, kind: SourceKind, path: &Path, trusses: &[Truss]) -> Result<Vec<Vault>, ParseError> {
        self(kind, path, trusses)
    }
}

/// Routes raw imports to a device parser and everything else to `primary`
pub struct DeviceParsers<P, D> {
    pub primary: P,
    pub device: D,
}

impl<P: FormatParser, D: FormatParser> FormatParser for DeviceParsers<P, D> {
    fn parse(&self, kind: SourceKind, path: &Path, trusses: &[Truss]) -> Result<Vec<Vault>, ParseError> {
        match kind {
            SourceKind::SelfDescribing => self.primary.parse(kind, path, trusses),
            SourceKind::ImportRaw => self.device.parse(kind, path, trusses),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_truss;

    #[test]
    fn test_closure_parser_and_routing() {
        let primary = |_: SourceKind, _: &Path, trusses: &[Truss]| -> Result<Vec<Vault>, ParseError> {
            Ok(trusses.iter().cloned().map(Vault::from_truss).collect())
        };
        let device = |_: SourceKind, path: &Path, _: &[Truss]| -> Result<Vec<Vault>, ParseError> {
            Err(ParseError::NotSupportedFormat(path.display().to_string()))
        };
        let parsers = DeviceParsers { primary, device };
        let trusses = vec![sample_truss("/logs/A.lvc", 1)];

        let vaults = parsers
            .parse(SourceKind::SelfDescribing, Path::new("/logs/A.lvc"), &trusses)
            .unwrap();
        assert_eq!(vaults.len(), 1);
        assert!(vaults[0].truss.complete);

        assert!(matches!(
            parsers.parse(SourceKind::ImportRaw, Path::new("/logs/A.bin"), &trusses),
            Err(ParseError::NotSupportedFormat(_))
        ));
    }
}
