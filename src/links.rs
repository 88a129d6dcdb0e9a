use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{LibraryField, MetadataRecord};
use crate::error::MirrorError;
use crate::naming::normalized_file_name;
use crate::store::MirrorStore;

#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    /// File name, under the target directory, of the sample accession list.
    pub sample_manifest: Option<String>,
    /// Reject groupings that span more than one sample.
    pub require_single_sample: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub grouping: String,
    pub samples: Vec<String>,
    pub prefix_fields: Vec<LibraryField>,
    pub links: Vec<PathBuf>,
    /// Locators whose mirrored file is absent; no link was made for them.
    pub missing: Vec<String>,
}

/// Distinct sample accessions of `records`, sorted.
pub fn sample_accessions(records: &[MetadataRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| record.sample_accession.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Fails with [`MirrorError::AmbiguousGrouping`] unless `records` name exactly one sample.
pub fn require_single_sample(
    grouping: &str,
    records: &[MetadataRecord],
) -> Result<(), MirrorError> {
    let samples = sample_accessions(records);
    if samples.len() == 1 {
        return Ok(());
    }
    Err(MirrorError::AmbiguousGrouping {
        grouping: grouping.to_string(),
        samples,
    })
}

/// Library dimensions that take more than one value within `records`.
pub fn prefix_fields(records: &[MetadataRecord]) -> Vec<LibraryField> {
    LibraryField::ALL
        .into_iter()
        .filter(|field| {
            records
                .iter()
                .map(|record| record.library_value(*field))
                .collect::<BTreeSet<_>>()
                .len()
                > 1
        })
        .collect()
}

struct PlannedLink {
    locator: String,
    source: Utf8PathBuf,
    link: Utf8PathBuf,
}

/// Builds `<target>/[<prefix values>/]<sample>/<normalized name>` symlinks
/// into the mirror tree for one grouping.
pub struct LinkStructureBuilder<'a> {
    store: &'a MirrorStore,
}

impl<'a> LinkStructureBuilder<'a> {
    pub fn new(store: &'a MirrorStore) -> Self {
        Self { store }
    }

    pub fn build(
        &self,
        grouping: &str,
        records: &[MetadataRecord],
        target: &Utf8Path,
        options: &LinkOptions,
    ) -> Result<LinkReport, MirrorError> {
        if options.require_single_sample {
            require_single_sample(grouping, records)?;
        }
        let samples = sample_accessions(records);

        let fields = prefix_fields(records);
        let planned = self.plan(records, target, &fields)?;

        fs::create_dir_all(target.as_std_path())
            .map_err(|err| MirrorError::Filesystem(format!("create {target}: {err}")))?;
        if let Some(manifest) = &options.sample_manifest {
            let mut content = samples.join("\n");
            if !content.is_empty() {
                content.push('\n');
            }
            MirrorStore::write_bytes_atomic(&target.join(manifest), content.as_bytes())?;
        }

        let mut links = Vec::with_capacity(planned.len());
        let mut missing = Vec::new();
        for entry in planned {
            if !entry.source.as_std_path().exists() {
                warn!(
                    locator = %entry.locator,
                    path = %entry.source,
                    "mirrored file missing, not linking"
                );
                missing.push(entry.locator);
                continue;
            }
            let source = fs::canonicalize(entry.source.as_std_path()).map_err(|err| {
                MirrorError::Filesystem(format!("resolve {}: {err}", entry.source))
            })?;
            MirrorStore::ensure_parent(&entry.link)?;
            replace_link(&source, entry.link.as_std_path())?;
            debug!(link = %entry.link, source = %source.display(), "linked");
            links.push(entry.link.into_std_path_buf());
        }

        info!(
            grouping,
            samples = samples.len(),
            links = links.len(),
            missing = missing.len(),
            "link tree built"
        );
        Ok(LinkReport {
            grouping: grouping.to_string(),
            samples,
            prefix_fields: fields,
            links,
            missing,
        })
    }

    /// Resolves every link path first so a bad file name aborts the grouping
    /// before anything is written.
    fn plan(
        &self,
        records: &[MetadataRecord],
        target: &Utf8Path,
        fields: &[LibraryField],
    ) -> Result<Vec<PlannedLink>, MirrorError> {
        let mut planned = Vec::new();
        for record in records {
            let mut dir = target.to_path_buf();
            if !fields.is_empty() {
                let prefix = fields
                    .iter()
                    .map(|field| record.library_value(*field))
                    .collect::<Vec<_>>()
                    .join("_");
                dir.push(prefix);
            }
            dir.push(&record.sample_accession);

            for remote in record.remote_files()? {
                let name = normalized_file_name(remote.locator.file_name())?;
                planned.push(PlannedLink {
                    locator: remote.locator.to_string(),
                    source: self.store.mirror_path(&remote.locator),
                    link: dir.join(name),
                });
            }
        }
        Ok(planned)
    }
}

/// Points `link` at `source`, replacing whatever link or file is already there.
fn replace_link(source: &Path, link: &Path) -> Result<(), MirrorError> {
    match fs::symlink_metadata(link) {
        Ok(metadata) if metadata.is_dir() => {
            return Err(MirrorError::Filesystem(format!(
                "{} is a directory, cannot replace with a link",
                link.display()
            )));
        }
        Ok(_) => fs::remove_file(link)
            .map_err(|err| MirrorError::Filesystem(format!("remove {}: {err}", link.display())))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(MirrorError::Filesystem(format!(
                "stat {}: {err}",
                link.display()
            )));
        }
    }
    symlink(source, link)
        .map_err(|err| MirrorError::Filesystem(format!("link {}: {err}", link.display())))
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(windows)]
fn symlink(source: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(source, link)
}
