//! Scenario test harness, mirroring the teacher's `lib/tests/it/` layout.

mod config;
mod pathblob;
mod plugin_transport;
mod proptest_invariants;
mod resolver;
mod scheme;
