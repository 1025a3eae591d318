#![allow(unsafe_code)]
//! Lock-free building blocks shared by the page cache and the freezer.
//!
//! [`queue`] is an intrusive multi-producer/single-consumer linked queue: producers
//! swap the tail pointer and then link the previous tail, the consumer advances the
//! head. [`WaitList`] parks threads on top of it until a coordinator releases them.

mod queue;
mod wait_list;

pub use queue::{queue, QueueConsumer, QueueProducer};
pub use wait_list::{WaitList, WaitTicket};
