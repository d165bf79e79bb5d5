//! Declarative post-readiness validation of stack services.
//!
//! Each [`ValidationRule`] names a target service, a query, an expected value
//! and a [`Comparator`]. The target's [`Observer`] answers the query and
//! [`evaluate`] checks every rule concurrently without side effects.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod engine;
mod error;
mod observers;
mod rule;
mod spec;

pub use engine::{DEFAULT_OBSERVE_TIMEOUT, evaluate};
pub use error::{Error, Result};
pub use observers::{
    ExecObserver, HttpJsonObserver, MetricsObserver, Observer, QUERY_VARIABLE, select_json,
    select_metric,
};
pub use rule::{Comparator, RuleOutcome, ValidationRule};
pub use spec::{DefaultObserverFactory, ObserverFactory, ObserverSpec};
