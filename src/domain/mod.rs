// Queue engine domain: entities, ordering and estimation rules, lifecycle and
// time-window policies. Storage and transport live behind the traits in
// `repository` and `event`.

pub mod clock;
pub mod entity;
pub mod error;
pub mod estimator;
pub mod event;
pub mod lifecycle;
pub mod policy;
pub mod position;
pub mod repository;
