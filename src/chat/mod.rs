//! Turn coordination: sessions, generations, cancellation and the collaborator seams.

pub mod backend;
pub mod collaborators;
pub mod coordinator;
pub mod events;
pub mod prompt;
pub mod session;

pub use backend::{ChatBackend, FragmentStream};
pub use collaborators::{
    MemoryExtractor, NoSearch, SearchOutcome, SearchProvider, SearchResult, TagMemoryExtractor,
};
pub use coordinator::{
    ABORTED_MARKER, CoordinatorBuilder, INTERRUPTED_MARKER, RequestCoordinator, TurnState,
};
pub use events::{ContentSource, CoordinatorEvent, EventSink};
pub use session::{CancelToken, Generation, GenerationCounter, StreamingSession};
