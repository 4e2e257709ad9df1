pub mod mutation;
pub mod outbox;
