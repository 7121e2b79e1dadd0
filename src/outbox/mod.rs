pub mod fallback;
pub mod queue;
pub mod registry;
pub mod types;

pub use fallback::{FallbackEntry, FallbackQueue, FALLBACK_IDENTITY};
pub use queue::MutationOutbox;
pub use registry::{validate_mutation_name, MutationExecutor, MutationFuture, MutationHandler, MutationRegistry};
pub use types::{MutationRecord, MutationStatus, OutboxEvent, OutboxStats, ProcessResult};
