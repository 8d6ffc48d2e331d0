//! Flow definitions: YAML model, parser and revisioned registry.

pub mod parser;
pub mod repository;
pub mod types;

pub use parser::parse_flow;
pub use repository::FlowRepository;
pub use types::{
    Concurrency, ConcurrencyBehavior, Condition, Flow, FlowInput, Retry, Task, TaskKind, Trigger,
    TriggerKind,
};
