//! Error taxonomy for the aggregation engine.
//!
//! Two scopes exist. [`Error`] covers failures that surface to the caller (store
//! initialization, write-group commits, run setup). [`RegionFailure`] covers failures of a
//! single region; these never propagate and are recorded as a FAILED status row whose
//! comment is the `Display` text.

/// Result alias used by the store, tile cache and controller.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort an operation and are returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The run could not be set up (catalog or inventory unavailable).
    #[error("run initialization failed: {0}")]
    RunInitialization(String),

    /// A write group failed to commit. Groups committed before it remain durable.
    #[error("persistence failure after {committed_regions} committed regions: {source}")]
    Persistence {
        /// Regions whose rows were committed before the failing group.
        committed_regions: usize,
        #[source]
        source: rusqlite::Error,
    },

    /// Any other database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Another thread panicked while holding the connection.
    #[error("database connection lock poisoned")]
    LockPoisoned,

    /// Year / day-of-year pair outside the calendar.
    #[error("invalid temporal key: year {year}, day {day}")]
    InvalidTemporalKey { year: i32, day: u32 },

    /// No imagery is available for the key a tile cache rebuild was asked to use.
    #[error("no imagery found for {0}")]
    NoImageryFound(String),

    /// An external collaborator failed outside of a region task.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// A blocking worker could not be joined.
    #[error("worker task failed: {0}")]
    Task(String),
}

impl Error {
    /// Build a collaborator error from anything displayable.
    pub fn collaborator(err: impl std::fmt::Display) -> Self {
        Error::Collaborator(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}

/// Why a single region could not be aggregated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionFailure {
    /// The tile cache has no entry for the region.
    #[error("no intersecting tiles")]
    NoIntersectingTiles,

    /// The catalog could not provide a usable geometry.
    #[error("geometry unable to be loaded: {0}")]
    GeometryUnavailable(String),

    /// Every tile that was attempted raised an error; holds the last captured reason.
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),

    /// Tiles were attempted but none overlapped the region for this cycle.
    #[error("no imagery overlap for region")]
    NoImageryOverlap,

    /// The worker running the task panicked or was cancelled.
    #[error("aggregation task aborted: {0}")]
    TaskAborted(String),
}
