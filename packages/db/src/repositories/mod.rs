//! Repository implementations for database operations.

mod circuit_repo;
mod dead_letter_repo;
mod envelope_repo;
mod rate_limit_repo;
mod schedule_repo;
mod stats_repo;

pub use circuit_repo::CircuitRepository;
pub use dead_letter_repo::DeadLetterRepository;
pub use envelope_repo::EnvelopeRepository;
pub use rate_limit_repo::RateLimitRepository;
pub use schedule_repo::ScheduleRepository;
pub use stats_repo::StatsRepository;
