pub mod adapter;
pub mod collector;
pub mod config;
pub mod controller;
pub mod corpus;
pub mod input;
pub mod mutator;
pub mod outcome;
pub mod report;

pub use adapter::{
    BleAdapter, BleTargetConfig, BridgeLink, CharacteristicBinding, GattError, GattLink,
    HttpAdapter, HttpTargetConfig, TargetAdapter,
};
pub use collector::{ResultCollector, RunSummary, StatusCounts};
pub use config::{ConfigError, DuofuzzConfig};
pub use controller::{CancelToken, KindSchedule, RunController, RunError, RunSettings, RunState};
pub use corpus::{CorpusError, SeedCorpus};
pub use input::{FieldValue, Payload};
pub use mutator::{Mutation, MutationKind, Mutator, PayloadMutator, mutate};
pub use outcome::{Outcome, ResponseDescriptor, Status};
