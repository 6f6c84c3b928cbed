use std::io;
use std::path::PathBuf;

use brisk_snapshot::SnapshotError;

#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("could not move {} to {}: {source}", .from.display(), .to.display())]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}
