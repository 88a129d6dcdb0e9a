use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::error::MirrorError;

/// Read role of a sequencing file, inferred from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadRole {
    Forward,
    Reverse,
    Single,
}

impl ReadRole {
    /// Column of the file map holding this role.
    pub fn column(&self) -> &'static str {
        match self {
            ReadRole::Forward => "fastq_1",
            ReadRole::Reverse => "fastq_2",
            ReadRole::Single => "fastq_single",
        }
    }
}

impl fmt::Display for ReadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

// Order matters: `.fastq.gz` also matches the paired suffixes.
const SUFFIXES: [(&str, ReadRole, &str); 3] = [
    ("_1.fastq.gz", ReadRole::Forward, ".pair.1.fq.gz"),
    ("_2.fastq.gz", ReadRole::Reverse, ".pair.2.fq.gz"),
    (".fastq.gz", ReadRole::Single, ".single.fq.gz"),
];

fn classify(name: &str) -> Result<(&str, ReadRole, &'static str), MirrorError> {
    SUFFIXES
        .iter()
        .find_map(|(suffix, role, replacement)| {
            name.strip_suffix(suffix)
                .map(|stem| (stem, *role, *replacement))
        })
        .ok_or_else(|| MirrorError::UnrecognizedSuffix(name.to_string()))
}

pub fn read_role(name: &str) -> Result<ReadRole, MirrorError> {
    classify(name).map(|(_, role, _)| role)
}

/// Rewrites a read file name (or full path) into its canonical local form.
///
/// `x_1.fastq.gz` becomes `x.pair.1.fq.gz`, `x_2.fastq.gz` becomes
/// `x.pair.2.fq.gz` and `x.fastq.gz` becomes `x.single.fq.gz`.
pub fn normalize(name: &str) -> Result<String, MirrorError> {
    let (stem, _, replacement) = classify(name)?;
    Ok(format!("{stem}{replacement}"))
}

/// Final path component of the normalized name.
pub fn normalized_file_name(name: &str) -> Result<String, MirrorError> {
    let normalized = normalize(name)?;
    Ok(Path::new(&normalized)
        .file_name()
        .map(|value| value.to_string_lossy().into_owned())
        .unwrap_or(normalized))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn normalize_known_suffixes() {
        assert_eq!(normalize("x_1.fastq.gz").unwrap(), "x.pair.1.fq.gz");
        assert_eq!(normalize("x_2.fastq.gz").unwrap(), "x.pair.2.fq.gz");
        assert_eq!(normalize("x.fastq.gz").unwrap(), "x.single.fq.gz");
    }

    #[test]
    fn normalize_unknown_suffix() {
        assert_matches!(normalize("x.bam"), Err(MirrorError::UnrecognizedSuffix(_)));
        assert_matches!(normalize("x_3.fq.gz"), Err(MirrorError::UnrecognizedSuffix(_)));
    }

    #[test]
    fn normalize_keeps_directories() {
        assert_eq!(
            normalize("ftp.sra.ebi.ac.uk/vol1/ERR1/ERR1_2.fastq.gz").unwrap(),
            "ftp.sra.ebi.ac.uk/vol1/ERR1/ERR1.pair.2.fq.gz"
        );
        assert_eq!(
            normalized_file_name("ftp.sra.ebi.ac.uk/vol1/ERR1/ERR1_2.fastq.gz").unwrap(),
            "ERR1.pair.2.fq.gz"
        );
    }

    #[test]
    fn role_agrees_with_normalization() {
        for (name, role) in [
            ("a_1.fastq.gz", ReadRole::Forward),
            ("a_2.fastq.gz", ReadRole::Reverse),
            ("a.fastq.gz", ReadRole::Single),
            ("a_10.fastq.gz", ReadRole::Single),
        ] {
            assert_eq!(read_role(name).unwrap(), role);
            assert!(normalize(name).unwrap().contains(match role {
                ReadRole::Forward => ".pair.1.",
                ReadRole::Reverse => ".pair.2.",
                ReadRole::Single => ".single.",
            }));
        }
    }
}
