pub mod backoff;
pub mod diff;
pub mod engine;
pub mod index;
pub mod jobs;
pub mod paths;
pub mod record;
pub mod remote;
pub mod store;
pub mod transfer;
