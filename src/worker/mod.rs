//! Pipeline execution engine.
//!
//! One executor task runs per in-flight job, at most one per device. The
//! executor walks the job's resolved pipeline sequentially, observing
//! cancellation and failure between steps and merging each step's returned
//! context back into the job record. When the job stops for any reason the
//! executor releases its device binding and pings the scheduler so the
//! next startable job can take the slot.

pub(crate) mod executor;
