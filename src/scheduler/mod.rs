pub mod job;
pub mod queue;

pub use job::{
    DocumentTask, FilterSet, Job, JobRecord, JobStatus, PublishingSystem, RequestedDocument,
    Subset, SubsetSpecification,
};
pub use queue::WorkQueue;
