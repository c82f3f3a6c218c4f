//! Per-queue admission control for outbound jobs.
//!
//! Workers share nothing but a [`counter_store::CounterStore`]. For every job
//! attempt the [`admission::AdmissionEngine`] decides whether it may run in the
//! current minute under the queue's minute and hour ceilings; if not, the
//! [`allocator::SlotAllocator`] reserves capacity in a future minute and the
//! [`scheduler::Scheduler`] re-dispatches the job for that slot.

pub mod admission;
pub mod allocator;
pub mod clock;
pub mod codec;
pub mod counter_store;
pub mod factory;
pub mod keys;
pub mod metrics;
pub mod scheduler;
pub mod settings;
pub mod slot;
pub mod slotgatectl;
pub mod trace;

pub use slotgate_macros::test;
