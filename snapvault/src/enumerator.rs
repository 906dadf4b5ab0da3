//! Discovers which collections a snapshot captures.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::{
    Result,
    error::{InvalidCollectionNameSnafu, SnapshotError},
    store::Connection,
};

/// Collections under this prefix belong to the data store itself.
const SYSTEM_PREFIX: &str = "system.";

/// A collection selected for snapshotting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct CollectionDescriptor {
    pub name: String,
}

/// Turns the store's collection list into a fixed, inspectable list of descriptors.
#[derive(Debug, Clone, Default)]
pub struct CollectionEnumerator {
    exclude: BTreeSet<String>,
}

impl CollectionEnumerator {
    pub fn new<I, S>(exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    /// Sorted, de-duplicated descriptors for every collection worth capturing.
    pub async fn enumerate<C: Connection>(&self, conn: &C) -> Result<Vec<CollectionDescriptor>> {
        let names = conn.list_collections().await?;
        self.select(names)
    }

    fn select(&self, names: Vec<String>) -> Result<Vec<CollectionDescriptor>> {
        let mut selected = BTreeSet::new();
        for name in names {
            if name.starts_with(SYSTEM_PREFIX) || self.exclude.contains(&name) {
                debug!(collection = %name, "collection excluded from snapshot");
                continue;
            }
            validate_collection_name(&name)?;
            selected.insert(CollectionDescriptor { name });
        }
        Ok(selected.into_iter().collect())
    }
}

/// Rejects names that cannot be used as a single file name.
pub fn validate_collection_name(name: &str) -> Result<(), SnapshotError> {
    let unusable = name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']);
    if unusable {
        return InvalidCollectionNameSnafu { name }.fail();
    }
    Ok(())
}
