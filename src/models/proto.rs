//! Storage records.

include!("proto/next_group.rs");
