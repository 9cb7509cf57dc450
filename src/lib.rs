pub mod audit;
pub mod chat;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod events;
pub mod executor;
pub mod feed;
pub mod moderator_cache;
pub mod modmail;
pub mod platform;
pub mod supervisor;
pub mod toxicity;
pub mod tracker;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::ActionClassifier;
pub use config::{Community, CommunityRegistry, Config};
pub use dispatcher::{DryRun, RateLimitedDispatcher};
pub use executor::{Effect, EffectExecutor};
pub use supervisor::{RestartPolicy, Supervisor, Task};
pub use tracker::CommunityTracker;
