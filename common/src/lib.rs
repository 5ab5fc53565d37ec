pub mod afl_snapshot;
pub mod defs;
