//! Building blocks of resource synchronization.

pub mod debounce;
pub mod governor;
pub mod optimistic;
pub mod poller;

pub use debounce::{PersistenceQueue, WriteFn, WriteMonitor};
pub use governor::{request_key, GovernorOptions, RequestGovernor, RequestState};
pub use optimistic::{OptimisticCache, Ticket};
pub use poller::{AfterSink, FetchSpacing, Fetcher, PollOptions, PollPhase, PollingSupervisor, Sink};
