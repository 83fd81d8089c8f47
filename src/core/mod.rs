pub mod args;
pub mod comparator;
pub mod filter;
pub mod lister;
pub mod pipe;
pub mod record;
pub mod strategy;

pub use args::{Location, ObjectPath, SyncArgs, SyncMode};
pub use comparator::{ActionStream, ActionSummary, Comparator, Strategies, SyncAction};
pub use filter::{Filter, FilterConfig, Side, TimeRange};
pub use lister::{spawn_lister, Lister, LocalLister, RemoteLister};
pub use record::{EndInfo, ItemError, ItemErrorKind, Record, StreamElement};
pub use strategy::{ActionKind, ChangeDetection, ChangedSync, ChecksumSource, SyncStrategy};
