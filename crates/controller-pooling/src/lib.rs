//! # Controller Pooling
//!
//! Spreads the requests handled by a rule-engine controller across a group of
//! cooperating hosts so that each request is processed by exactly one of them:
//! - **Bucket assignment**: request ids hash into a fixed set of buckets, each
//!   owned by one host
//! - **Coordination**: hosts elect the lowest host id as leader over a shared
//!   topic; the leader computes the table and broadcasts it
//! - **Routing**: events owned by another host are forwarded to it, events
//!   arriving before any table exists are parked until one is installed
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       PoolingManager                         │
//! ├───────────────┬───────────────────────┬──────────────────────┤
//! │  Event Router │  State Machine        │  Internal Bus        │
//! ├───────────────┼───────────────────────┼──────────────────────┤
//! │ • request id  │ • Start / Query       │ • admin channel      │
//! │ • bucket hash │ • Active (leader)     │ • per-host channel   │
//! │ • forward     │ • Inactive (follower) │ • JSON messages      │
//! │ • offline q   │ • timers              │ • TopicEndpoint      │
//! └───────────────┴───────────────────────┴──────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use controller_pooling::{InMemoryTopic, PoolingConfig, PoolingManager};
//!
//! let topic = InMemoryTopic::new("pooling");
//! let config = PoolingConfig::builder("pooling").host("host-a").build()?;
//! let manager = PoolingManager::new(config, topic.endpoint(), controller)?;
//!
//! manager.before_start();
//! manager.after_start();
//!
//! if !manager.before_offer("ueb", "requests", &event) {
//!     // not taken by the pool: process locally
//! }
//! ```

pub mod assignments;
pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod hash;
pub mod manager;
pub mod message;
pub mod observability;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use assignments::{BucketAssignments, HostId};
pub use bus::{InMemoryEndpoint, InMemoryTopic, InternalBus, TopicEndpoint, TopicListener};
pub use config::{PoolingConfig, PoolingConfigBuilder};
pub use controller::PoolingController;
pub use error::{PoolingError, Result};
pub use manager::PoolingManager;
pub use message::{
    Forward, Heartbeat, Identification, Leader, Message, MessageKind, Offline, Query,
    ADMIN_CHANNEL, MAX_HOPS,
};
pub use observability::{CoordinationMetrics, RoutingMetrics};
pub use queue::EventQueue;
pub use router::{
    ForwardOutcome, JsonFieldExtractor, RequestIdExtractor, RouteOutcome, RouterStatsSnapshot,
};
pub use scheduler::{TimerId, TimerKind};
pub use state::{State, StateContext, StateKind, Transition};
