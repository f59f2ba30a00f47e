//! Priority job queue service backed by a linearizable key-value store
//! with watch semantics.
//!
//! Clients enqueue items tagged with a bucket and a weight; the queue
//! orders them by weight within each bucket, presents the highest-weight
//! unfinished item as the front of the bucket, lets workers report
//! progress by re-enqueueing, and pushes every observed state transition
//! of an item to every subscriber that asked for it. Items that reach
//! terminal progress move from the scheduled namespace to a completed
//! archive namespace.
//!
//! The backing store is either a remote etcd cluster or the in-process
//! single-node server in [`kv::embedded`], selected through the
//! [`kv::KvStore`] gateway.

pub mod item;
pub mod keys;
pub mod kv;
pub mod queue;
pub mod settings;
pub mod trace;

pub use item::{Item, ItemMismatch, MAX_PROGRESS, MAX_WEIGHT};
pub use queue::{ItemStream, Queue, QueueError};
