use ron::ser::{PrettyConfig, to_string_pretty};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ArchiveErrors {
    #[error("expected an archive of class '{expected}', found '{found}'")]
    ClassMismatch { expected: String, found: String },
    #[error("class '{class}' version {found} is newer than the supported version {supported}")]
    UnsupportedVersion {
        class: String,
        found: u32,
        supported: u32,
    },
    #[error("{0}")]
    Ron(String),
}

/// Envelope written around every archived item: a class tag, a version and the persistent data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive<T> {
    pub class: String,
    pub version: u32,
    pub data: T,
}

#[derive(Deserialize)]
struct ArchiveHeader {
    class: String,
    version: u32,
}

/// Items that persist part of their state as a versioned ron archive.
///
/// Only the persistent parameters go in `Data`; bindings to other items and
/// solver bookkeeping are never archived and survive `archive_in` untouched.
pub trait Archivable {
    const CLASS_NAME: &'static str;
    const CLASS_VERSION: u32;
    type Data: Serialize + DeserializeOwned;

    fn archive_data(&self) -> Self::Data;

    /// `version` is the version the data was written with, never newer than `CLASS_VERSION`.
    fn restore_data(&mut self, data: Self::Data, version: u32);

    fn archive_out(&self) -> Result<String, ArchiveErrors> {
        let archive = Archive {
            class: Self::CLASS_NAME.to_string(),
            version: Self::CLASS_VERSION,
            data: self.archive_data(),
        };
        to_string_pretty(&archive, PrettyConfig::new())
            .map_err(|e| ArchiveErrors::Ron(e.to_string()))
    }

    fn archive_in(&mut self, s: &str) -> Result<(), ArchiveErrors> {
        let header: ArchiveHeader =
            ron::from_str(s).map_err(|e| ArchiveErrors::Ron(e.to_string()))?;
        if header.class != Self::CLASS_NAME {
            return Err(ArchiveErrors::ClassMismatch {
                expected: Self::CLASS_NAME.to_string(),
                found: header.class,
            });
        }
        if header.version > Self::CLASS_VERSION {
            return Err(ArchiveErrors::UnsupportedVersion {
                class: header.class,
                found: header.version,
                supported: Self::CLASS_VERSION,
            });
        }
        let archive: Archive<Self::Data> =
            ron::from_str(s).map_err(|e| ArchiveErrors::Ron(e.to_string()))?;
        debug!(
            class = Self::CLASS_NAME,
            version = archive.version,
            "restoring from archive"
        );
        self.restore_data(archive.data, archive.version);
        Ok(())
    }
}
