mod builder;
pub mod manifest;
mod parameters;
mod types;

pub use builder::{ModuleBuilder, build_module};
pub(crate) use builder::is_valid_identifier;
pub use parameters::DeploymentParameters;
pub use types::{
    AccountRef, ArgumentValue, CallOptions, ContractAtOptions, ContractOptions, DeploymentFuture,
    FutureAction, FutureId, FutureKind, FutureRef, LibraryOptions, Module, ParameterRef,
    ReadEventArgumentOptions, SendDataOptions, StaticCallOptions, Wei,
};
