use std::collections::HashSet;
use std::path::PathBuf;

use dray_types::{layout, ImageId};

/// Which images the local side already holds.
///
/// A pull walks parents only until it reaches an image the catalog knows,
/// since everything above it is already loaded.
pub trait ImageCatalog: Send + Sync {
    fn has_image(&self, id: &ImageId) -> bool;
}

/// A catalog that knows nothing, so a pull fetches the whole chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLocalImages;

impl ImageCatalog for NoLocalImages {
    fn has_image(&self, _id: &ImageId) -> bool {
        false
    }
}

/// Images already materialised in a work directory, recognised by their
/// `images/{id}/json` record.
#[derive(Clone, Debug)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ImageCatalog for DirectoryCatalog {
    fn has_image(&self, id: &ImageId) -> bool {
        self.root.join(layout::metadata_path(id)).is_file()
    }
}

impl ImageCatalog for HashSet<ImageId> {
    fn has_image(&self, id: &ImageId) -> bool {
        self.contains(id)
    }
}
