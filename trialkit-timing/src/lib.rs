pub mod timer;

pub use timer::{Timer, TimingStats, TokioTimer};
