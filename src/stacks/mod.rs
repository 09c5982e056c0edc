//! The five stacks of a deployment unit
//!
//! Each stack compiles from a typed input struct and returns its [`Stack`]
//! together with the handles later stacks borrow. Nothing looks another
//! stack up by name; handles flow forward through the compiler.
//!
//! [`Stack`]: stackwire_common::stack::Stack

pub mod application;
pub mod data;
pub mod foundation;
pub mod network;
pub mod tester;

pub use application::{
    ApplicationInputs, ApplicationInputsBuilder, ApplicationOutputs, ApplicationStack, Artifact,
    CompiledApplication, SeedBundle, ServiceSettings,
};
pub use data::{CompiledData, DataInputs, DataStack};
pub use foundation::{CompiledFoundation, FoundationStack};
pub use network::{CompiledNetwork, NetworkStack};
pub use tester::{CompiledTester, HarnessAllowlist, TesterInputs, TesterStack};
