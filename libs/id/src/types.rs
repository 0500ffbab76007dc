//! Typed ID definitions.

use crate::define_id;

// Local handle identity for a container produced by the factory.
define_id!(ContainerId, "ctr");

// Caller-supplied correlation id for a factory operation.
define_id!(TransactionId, "tx");
