//! `eventflow` Core: partition ownership records, checkpoints, event model,
//! and the ownership store contract shared by every processor instance.

pub mod clock;
pub mod event;
pub mod partition;
pub mod traits;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use event::{EventData, LastEnqueuedEventProperties, ReceivedEvent};
pub use partition::{compare_partition_ids, sort_partition_ids};
pub use traits::OwnershipStore;
pub use types::{
    Checkpoint, CheckpointOutcome, ClaimOutcome, EventPosition, PartitionOwnership,
    ProcessorPresence, StreamScope,
};
